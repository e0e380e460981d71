//! Integration tests for the Kubernetes spawner against a local mock of the
//! batch Jobs API.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use recac::config::{AgentConfig, KubernetesConfig};
use recac::models::work_item::WorkItem;
use recac::orchestrator::spawner::kubernetes::KubernetesSpawner;
use recac::orchestrator::spawner::{ExecutionOutcome, Spawner};
use recac::AppError;
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Cluster {
    jobs: Arc<Mutex<BTreeMap<String, Value>>>,
    created: Arc<Mutex<Vec<Value>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    auth: Arc<Mutex<Vec<String>>>,
    conflict_on_create: Arc<Mutex<bool>>,
}

impl Cluster {
    fn insert(&self, name: &str, item_label: &str, status: Value) {
        self.jobs.lock().unwrap().insert(
            name.to_owned(),
            json!({
                "metadata": { "name": name, "labels": { "recac.io/work-item": item_label } },
                "status": status
            }),
        );
    }

    fn insert_owned(&self, name: &str, item_label: &str, item_id: &str, status: Value) {
        self.insert(name, item_label, status);
        if let Some(job) = self.jobs.lock().unwrap().get_mut(name) {
            job["metadata"]["annotations"] = json!({ "recac.io/work-item-id": item_id });
        }
    }

    fn set_status(&self, name: &str, status: Value) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(name) {
            job["status"] = status;
        }
    }

    fn note_auth(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get("authorization") {
            self.auth
                .lock()
                .unwrap()
                .push(value.to_str().unwrap_or_default().to_owned());
        }
    }
}

async fn list_jobs(
    State(cluster): State<Cluster>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let selector = query.get("labelSelector").cloned().unwrap_or_default();
    let (key, value) = selector.split_once('=').unwrap_or_default();
    let items: Vec<Value> = cluster
        .jobs
        .lock()
        .unwrap()
        .values()
        .filter(|job| key.is_empty() || job["metadata"]["labels"][key] == value)
        .cloned()
        .collect();
    Json(json!({ "kind": "JobList", "items": items }))
}

async fn create_job(
    State(cluster): State<Cluster>,
    headers: HeaderMap,
    Json(manifest): Json<Value>,
) -> Response {
    cluster.note_auth(&headers);
    if *cluster.conflict_on_create.lock().unwrap() {
        return (StatusCode::CONFLICT, "AlreadyExists").into_response();
    }
    let name = manifest["metadata"]["name"].as_str().unwrap_or_default().to_owned();
    let mut job = manifest.clone();
    job["status"] = json!({});
    cluster.jobs.lock().unwrap().insert(name, job);
    cluster.created.lock().unwrap().push(manifest.clone());
    (StatusCode::CREATED, Json(manifest)).into_response()
}

async fn get_job(
    State(cluster): State<Cluster>,
    headers: HeaderMap,
    Path((_ns, name)): Path<(String, String)>,
) -> Response {
    cluster.note_auth(&headers);
    match cluster.jobs.lock().unwrap().get(&name) {
        Some(job) => Json(job.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "NotFound").into_response(),
    }
}

async fn delete_job(
    State(cluster): State<Cluster>,
    Path((_ns, name)): Path<(String, String)>,
) -> Response {
    cluster.deleted.lock().unwrap().push(name.clone());
    match cluster.jobs.lock().unwrap().remove(&name) {
        Some(_) => Json(json!({ "kind": "Status", "status": "Success" })).into_response(),
        None => (StatusCode::NOT_FOUND, "NotFound").into_response(),
    }
}

async fn list_pods(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let selector = query.get("labelSelector").cloned().unwrap_or_default();
    let items = match selector.strip_prefix("job-name=") {
        Some(job) if job == "recac-agent-proj-1" => json!([{ "metadata": { "name": "recac-agent-proj-1-abcde" } }]),
        _ => json!([]),
    };
    Json(json!({ "items": items }))
}

async fn pod_log(Path((_ns, pod)): Path<(String, String)>) -> String {
    format!("log of {pod}\nall done\n")
}

async fn serve(cluster: Cluster) -> String {
    let app = Router::new()
        .route(
            "/apis/batch/v1/namespaces/{ns}/jobs",
            get(list_jobs).post(create_job),
        )
        .route(
            "/apis/batch/v1/namespaces/{ns}/jobs/{name}",
            get(get_job).delete(delete_job),
        )
        .route("/api/v1/namespaces/{ns}/pods", get(list_pods))
        .route("/api/v1/namespaces/{ns}/pods/{pod}/log", get(pod_log))
        .with_state(cluster);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn spawner(url: &str, token_dir: &std::path::Path) -> KubernetesSpawner {
    let config = KubernetesConfig {
        api_server: url.to_owned(),
        namespace: "agents".into(),
        token_file: token_dir.join("token"),
        ..KubernetesConfig::default()
    };
    KubernetesSpawner::from_config(&config).unwrap()
}

fn item() -> WorkItem {
    WorkItem::new("PROJ-1", "Fix flaky test")
}

#[tokio::test]
async fn spawn_creates_job_when_absent() {
    let cluster = Cluster::default();
    let url = serve(cluster.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());
    assert_eq!(k8s.namespace(), "agents");

    let handle = k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();

    assert_eq!(handle.id, "recac-agent-proj-1");
    assert_eq!(handle.item_id, "PROJ-1");
    let created = cluster.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["metadata"]["labels"]["recac.io/work-item"], "proj-1");
    assert!(cluster.auth.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_spawn_adopts_existing_job() {
    let cluster = Cluster::default();
    let url = serve(cluster.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());

    let first = k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();
    let second = k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(cluster.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_job_is_deleted_and_reported() {
    let cluster = Cluster::default();
    cluster.insert("recac-agent-proj-1", "proj-1", json!({ "failed": 1 }));
    let url = serve(cluster.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());

    let err = k8s.spawn(&item(), &AgentConfig::default()).await.unwrap_err();

    assert!(matches!(err, AppError::Spawn(ref msg) if msg.contains("will retry next cycle")));
    assert!(err.is_transient());
    assert_eq!(*cluster.deleted.lock().unwrap(), ["recac-agent-proj-1"]);

    k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();
    assert_eq!(cluster.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn create_conflict_is_adopted() {
    let cluster = Cluster::default();
    *cluster.conflict_on_create.lock().unwrap() = true;
    let url = serve(cluster.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());

    let handle = k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();
    assert_eq!(handle.id, "recac-agent-proj-1");
}

#[tokio::test]
async fn activity_follows_job_status() {
    let cluster = Cluster::default();
    let url = serve(cluster.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());
    let handle = k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();

    assert!(k8s.is_active(&handle).await.unwrap());
    cluster.set_status(&handle.id, json!({ "active": 1 }));
    assert!(k8s.is_active(&handle).await.unwrap());
    cluster.set_status(&handle.id, json!({ "succeeded": 1 }));
    assert!(!k8s.is_active(&handle).await.unwrap());

    assert_eq!(k8s.finalize(&handle).await.unwrap(), ExecutionOutcome::Succeeded);
    assert!(cluster.jobs.lock().unwrap().is_empty());
    assert!(!k8s.is_active(&handle).await.unwrap());
}

#[tokio::test]
async fn find_active_uses_the_item_label() {
    let cluster = Cluster::default();
    cluster.insert("recac-agent-proj-1", "proj-1", json!({ "active": 1 }));
    cluster.insert("recac-agent-proj-2", "proj-2", json!({ "succeeded": 1 }));
    let url = serve(cluster).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());

    let found = k8s.find_active("PROJ-1").await.unwrap().unwrap();
    assert_eq!(found.id, "recac-agent-proj-1");
    assert!(k8s.find_active("PROJ-2").await.unwrap().is_none());
    assert!(k8s.find_active("PROJ-3").await.unwrap().is_none());
}

#[tokio::test]
async fn failed_job_finalizes_with_its_output() {
    let cluster = Cluster::default();
    let url = serve(cluster.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());
    let handle = k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();
    cluster.set_status(&handle.id, json!({ "failed": 1 }));

    let outcome = k8s.finalize(&handle).await.unwrap();

    let ExecutionOutcome::Failed { reason, output } = outcome else {
        panic!("expected a failed outcome, got {outcome:?}");
    };
    assert_eq!(reason, "job recac-agent-proj-1 failed");
    assert!(output.contains("all done"));
    assert_eq!(*cluster.deleted.lock().unwrap(), ["recac-agent-proj-1"]);
}

#[tokio::test]
async fn colliding_ids_do_not_share_a_job() {
    let cluster = Cluster::default();
    cluster.insert_owned("recac-agent-a-1", "a-1", "A_1", json!({ "active": 1 }));
    let url = serve(cluster.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());

    assert!(k8s.find_active("a-1").await.unwrap().is_none());
    assert_eq!(k8s.find_active("A_1").await.unwrap().unwrap().id, "recac-agent-a-1");

    let err = k8s
        .spawn(&WorkItem::new("a-1", "other work"), &AgentConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(ref msg) if msg.contains("A_1")));
    assert!(cluster.created.lock().unwrap().is_empty());
    assert!(cluster.deleted.lock().unwrap().is_empty());

    let adopted = k8s
        .spawn(&WorkItem::new("A_1", "same work"), &AgentConfig::default())
        .await
        .unwrap();
    assert_eq!(adopted.id, "recac-agent-a-1");
}

#[tokio::test]
async fn logs_come_from_the_job_pod() {
    let cluster = Cluster::default();
    let url = serve(cluster).await;
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&url, dir.path());
    let handle = k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();

    let logs = k8s.logs(&handle).await.unwrap();
    assert!(logs.contains("log of recac-agent-proj-1-abcde"));

    let other = k8s
        .spawn(&WorkItem::new("PROJ-5", "other"), &AgentConfig::default())
        .await
        .unwrap();
    assert!(matches!(k8s.logs(&other).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn service_account_token_is_sent() {
    let cluster = Cluster::default();
    let url = serve(cluster.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("token"), "sa-token\n").unwrap();
    let k8s = spawner(&url, dir.path());

    k8s.spawn(&item(), &AgentConfig::default()).await.unwrap();

    let auth = cluster.auth.lock().unwrap();
    assert!(!auth.is_empty());
    assert!(auth.iter().all(|value| value == "Bearer sa-token"));
}

#[tokio::test]
async fn unreachable_api_is_transient() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let dir = tempfile::tempdir().unwrap();
    let k8s = spawner(&format!("http://{addr}"), dir.path());

    let err = k8s.find_active("PROJ-1").await.unwrap_err();
    assert!(matches!(err, AppError::Unavailable(_)));
}
