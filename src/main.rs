#![forbid(unsafe_code)]

//! `recac` command-line front end.
//!
//! Local commands manage detached agent sessions and their git checkpoints.
//! `orchestrate` runs the dispatch loop until Ctrl-C or SIGTERM, and `task`
//! feeds the configured work queue.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use recac::agent::HostCliAgent;
use recac::config::{SpawnerMode, TaskSourceKind};
use recac::git::GitCli;
use recac::models::session::Session;
use recac::models::work_item::NewWorkItem;
use recac::orchestrator::checkpoint_manager::{
    self, AgentJudge, BisectJudge, BisectRequest, ExitCodeJudge, Prompter, RollbackMode,
    RollbackOutcome,
};
use recac::orchestrator::dispatch::Orchestrator;
use recac::orchestrator::session_manager::{LocalSessionManager, SessionManager, StartRequest};
use recac::orchestrator::spawner::AnySpawner;
use recac::persistence::session_store::SessionStore;
use recac::tasks::{AnyTaskSource, TaskSource};
use recac::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "recac", about = "Fleet manager for autonomous coding agents", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file (default `~/.recac/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Debug logging unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch a command as a detached session.
    Start {
        /// Session name.
        name: String,
        /// Goal shown in listings.
        #[arg(long, default_value = "")]
        goal: String,
        /// Workspace directory.
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Tag to attach; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Command and arguments, after `--`.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// List sessions.
    Ps {
        /// List archived sessions instead.
        #[arg(long)]
        archived: bool,
        /// Print JSON records.
        #[arg(long)]
        json: bool,
    },

    /// Print the tail of a session log.
    Logs {
        /// Session name.
        name: String,
        /// Lines to show; 0 prints the whole log.
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },

    /// Suspend a running session.
    Pause {
        /// Session name.
        name: String,
    },

    /// Continue a paused session.
    Resume {
        /// Session name.
        name: String,
    },

    /// Terminate a session.
    Stop {
        /// Session name.
        name: String,
    },

    /// Delete a session record and its log.
    Rm {
        /// Session name.
        name: String,
        /// Stop the session first if it is running.
        #[arg(long)]
        force: bool,
    },

    /// Rename a finished session.
    Rename {
        /// Current name.
        old: String,
        /// New name.
        new: String,
    },

    /// Move a finished session to the archive.
    Archive {
        /// Session name.
        name: String,
    },

    /// Restore an archived session.
    Unarchive {
        /// Session name.
        name: String,
    },

    /// Show the diff stat between a session's start and end commits.
    Diff {
        /// Session name.
        name: String,
    },

    /// Commit everything in a workspace as an iteration checkpoint.
    Checkpoint {
        /// Iteration number.
        #[arg(long)]
        iteration: u32,
        /// Workspace directory.
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },

    /// Restore a workspace to an iteration checkpoint.
    Rollback {
        /// Iteration number.
        #[arg(long)]
        iteration: u32,
        /// Session whose workspace is rolled back.
        #[arg(long, conflicts_with = "workspace")]
        session: Option<String>,
        /// Workspace directory, when not going through a session.
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Check out a new branch instead of resetting; optional name.
        #[arg(long, num_args = 0..=1)]
        branch: Option<Option<String>>,
        /// Roll back even if the session is running.
        #[arg(long)]
        force: bool,
        /// Pick the session and confirm interactively.
        #[arg(long)]
        interactive: bool,
    },

    /// Find the first bad commit between two revisions.
    Bisect {
        /// Known good revision.
        #[arg(long)]
        good: String,
        /// Known bad revision.
        #[arg(long)]
        bad: String,
        /// Shell command run at every step.
        #[arg(long = "cmd")]
        probe: String,
        /// Workspace directory.
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Ask the host agent CLI to judge each step.
        #[arg(long)]
        agent_judge: bool,
        /// What a good result looks like, for the agent judge.
        #[arg(long, default_value = "the command succeeded and its output shows no errors")]
        criteria: String,
        /// Leave the repository in bisect state.
        #[arg(long)]
        keep: bool,
    },

    /// Poll the task source and dispatch work until interrupted.
    Orchestrate {
        /// Execution platform (docker or kubernetes).
        #[arg(long)]
        mode: Option<String>,
        /// Task source (jira, github, file, or dir).
        #[arg(long)]
        source: Option<String>,
        /// Seconds between ticks.
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Work queue operations.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    /// Add a work item.
    Submit {
        /// Item title.
        title: String,
        /// Item description.
        #[arg(long, default_value = "")]
        description: String,
        /// Priority name.
        #[arg(long)]
        priority: Option<String>,
        /// Label to attach; repeatable.
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Repository the agent should clone.
        #[arg(long)]
        repo: Option<String>,
        /// Task source (jira, github, file, or dir).
        #[arg(long)]
        source: Option<String>,
    },

    /// List open work items.
    List {
        /// Task source (jira, github, file, or dir).
        #[arg(long)]
        source: Option<String>,
        /// Print JSON items.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format, args.verbose) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }

    let outcome = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    if let Err(err) = outcome {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Start {
            name,
            goal,
            workspace,
            tags,
            command,
        } => {
            let request = StartRequest {
                tags,
                ..StartRequest::new(name, goal, command, workspace)
            };
            let session = session_manager(&config)?.start_session(request)?;
            println!("started {} (pid {})", session.name, session.pid);
        }
        Command::Ps { archived, json } => {
            let manager = session_manager(&config)?;
            let sessions = if archived {
                manager.list_archived_sessions()?
            } else {
                manager.list_sessions()?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions(&sessions);
            }
        }
        Command::Logs { name, lines } => {
            print!("{}", session_manager(&config)?.session_log_content(&name, lines)?);
        }
        Command::Pause { name } => {
            session_manager(&config)?.pause_session(&name)?;
            println!("paused {name}");
        }
        Command::Resume { name } => {
            session_manager(&config)?.resume_session(&name)?;
            println!("resumed {name}");
        }
        Command::Stop { name } => {
            let session = session_manager(&config)?.stop_session(&name)?;
            println!("{name}: {}", session.display_status());
        }
        Command::Rm { name, force } => {
            session_manager(&config)?.remove_session(&name, force)?;
            println!("removed {name}");
        }
        Command::Rename { old, new } => {
            session_manager(&config)?.rename_session(&old, &new)?;
            println!("renamed {old} to {new}");
        }
        Command::Archive { name } => {
            session_manager(&config)?.archive_session(&name)?;
            println!("archived {name}");
        }
        Command::Unarchive { name } => {
            let session = session_manager(&config)?.unarchive_session(&name)?;
            println!("restored {name} ({})", session.display_status());
        }
        Command::Diff { name } => {
            let stat = session_manager(&config)?.session_git_diff_stat(&name)?;
            if stat.is_empty() {
                println!("no changes recorded for {name}");
            } else {
                println!("{stat}");
            }
        }
        Command::Checkpoint {
            iteration,
            workspace,
        } => {
            let sha = checkpoint_manager::checkpoint(&GitCli::default(), &workspace, iteration)?;
            println!("iteration {iteration}: {sha}");
        }
        Command::Rollback {
            iteration,
            session,
            workspace,
            branch,
            force,
            interactive,
        } => {
            let mode = branch.map_or(RollbackMode::Hard, RollbackMode::Branch);
            rollback(
                &config,
                RollbackArgs {
                    iteration,
                    session,
                    workspace,
                    mode,
                    force,
                    interactive,
                },
            )?;
        }
        Command::Bisect {
            good,
            bad,
            probe,
            workspace,
            agent_judge,
            criteria,
            keep,
        } => {
            let request = BisectRequest {
                workspace,
                good,
                bad,
                probe,
                keep_state: keep,
            };
            let mut judge: Box<dyn BisectJudge> = if agent_judge {
                let agent = HostCliAgent::new(
                    config.agent.host_cli.clone(),
                    config.agent.host_cli_args.clone(),
                )
                .in_dir(&request.workspace);
                Box::new(AgentJudge::new(agent, criteria))
            } else {
                Box::new(ExitCodeJudge)
            };
            let sha = checkpoint_manager::bisect(&GitCli::default(), &request, judge.as_mut()).await?;
            println!("first bad commit: {sha}");
        }
        Command::Orchestrate {
            mode,
            source,
            interval,
        } => {
            let mut config = config;
            if let Some(mode) = mode {
                config.orchestrator.mode = SpawnerMode::parse(&mode)?;
            }
            if let Some(source) = source {
                config.orchestrator.source = TaskSourceKind::parse(&source)?;
            }
            if let Some(interval) = interval {
                config.orchestrator.interval_seconds = interval;
            }
            config.validate()?;
            orchestrate(config).await?;
        }
        Command::Task { command } => task(config, command).await?,
    }
    Ok(())
}

fn session_manager(config: &GlobalConfig) -> Result<LocalSessionManager> {
    let store = SessionStore::open(&config.sessions_dir)?;
    Ok(LocalSessionManager::new(store)
        .allow_dirty(config.allow_dirty)
        .stop_grace(Duration::from_secs(config.stop_grace_seconds)))
}

fn print_sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("no sessions");
        return;
    }
    println!(
        "{:<24} {:<10} {:>8} {:<20} WORKSPACE",
        "NAME", "STATUS", "PID", "STARTED"
    );
    for session in sessions {
        println!(
            "{:<24} {:<10} {:>8} {:<20} {}",
            session.name,
            session.display_status().as_str(),
            session.pid,
            session.start_time.format("%Y-%m-%d %H:%M:%S"),
            session.workspace.display()
        );
    }
}

struct RollbackArgs {
    iteration: u32,
    session: Option<String>,
    workspace: Option<PathBuf>,
    mode: RollbackMode,
    force: bool,
    interactive: bool,
}

fn rollback(config: &GlobalConfig, args: RollbackArgs) -> Result<()> {
    let git = GitCli::default();

    let outcome = if args.interactive {
        let manager = session_manager(config)?;
        let mut prompter = StdioPrompter;
        checkpoint_manager::interactive_rollback(
            &manager,
            &git,
            &mut prompter,
            args.session.as_deref(),
            args.iteration,
            args.force,
        )?
    } else if let Some(name) = &args.session {
        let manager = session_manager(config)?;
        Some(checkpoint_manager::rollback_session(
            &manager,
            &git,
            name,
            args.iteration,
            &args.mode,
            args.force,
        )?)
    } else {
        let workspace = args.workspace.unwrap_or_else(|| PathBuf::from("."));
        Some(checkpoint_manager::rollback_with_mode(
            &git,
            &workspace,
            args.iteration,
            &args.mode,
        )?)
    };

    match outcome {
        Some(RollbackOutcome { sha, branch: Some(branch) }) => {
            println!("checked out {branch} at {sha}");
        }
        Some(RollbackOutcome { sha, branch: None }) => println!("reset to {sha}"),
        None => println!("rollback cancelled"),
    }
    Ok(())
}

async fn orchestrate(mut config: GlobalConfig) -> Result<()> {
    let kind = config.orchestrator.source;
    config.load_credentials(kind).await?;
    let source = AnyTaskSource::from_config(&config, kind)?;
    let watch = match &source {
        AnyTaskSource::Dir(dir) => Some(dir.watch()?),
        _ => None,
    };

    let sessions: Arc<dyn SessionManager> = Arc::new(session_manager(&config)?);
    let spawner = AnySpawner::from_config(&config, config.orchestrator.mode, Some(sessions))?;

    let mut orchestrator = Orchestrator::from_config(source, spawner, &config);
    if let Some(watch) = &watch {
        orchestrator = orchestrator.with_wake(watch.wake());
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    orchestrator.run(cancel).await
}

async fn task(mut config: GlobalConfig, command: TaskCommand) -> Result<()> {
    let requested = match &command {
        TaskCommand::Submit { source, .. } | TaskCommand::List { source, .. } => source.clone(),
    };
    let kind = match requested {
        Some(raw) => TaskSourceKind::parse(&raw)?,
        None => config.orchestrator.source,
    };
    config.load_credentials(kind).await?;
    let source = AnyTaskSource::from_config(&config, kind)?;

    match command {
        TaskCommand::Submit {
            title,
            description,
            priority,
            labels,
            repo,
            ..
        } => {
            let item = source
                .submit(NewWorkItem {
                    title,
                    description,
                    priority,
                    labels,
                    repo_url: repo,
                })
                .await?;
            println!("{}", item.id);
        }
        TaskCommand::List { json, .. } => {
            let items = source.list_open().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("no open items");
            } else {
                for item in items {
                    println!("{:<24} {:<8} {}", item.id, item.status.as_str(), item.title);
                }
            }
        }
    }
    Ok(())
}

/// Terminal prompts for interactive rollback.
struct StdioPrompter;

impl StdioPrompter {
    fn read_line(prompt: &str) -> Result<String> {
        let mut stdout = std::io::stdout();
        write!(stdout, "{prompt}")?;
        stdout.flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_owned())
    }
}

impl Prompter for StdioPrompter {
    fn select(&mut self, question: &str, options: &[String]) -> Result<Option<usize>> {
        println!("{question}");
        for (index, option) in options.iter().enumerate() {
            println!("  {}) {option}", index + 1);
        }
        loop {
            let answer = Self::read_line("Number (empty to cancel): ")?;
            if answer.is_empty() || answer.eq_ignore_ascii_case("q") {
                return Ok(None);
            }
            match answer.parse::<usize>() {
                Ok(choice) if (1..=options.len()).contains(&choice) => return Ok(Some(choice - 1)),
                _ => warn!(answer, "not a valid choice"),
            }
        }
    }

    fn confirm(&mut self, question: &str) -> Result<bool> {
        let answer = Self::read_line(&format!("{question} [y/N] "))?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

