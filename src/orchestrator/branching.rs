//! Git branch layout for dispatched work items.
//!
//! Every item works on its own `agent/<id>` branch. Items that share a
//! parent epic branch off a common `agent-epic/<epic>` branch, fetched when
//! it already exists on the remote and created and pushed otherwise. The
//! layout is applied inside the execution environment by a generated shell
//! prelude that ends by exec'ing the agent command.

use std::fmt::Write as _;

use crate::models::work_item::WorkItem;

/// Prefix for per-item feature branches.
pub const FEATURE_PREFIX: &str = "agent/";

/// Prefix for shared epic branches.
pub const EPIC_PREFIX: &str = "agent-epic/";

/// Directory the workspace is mounted at inside the execution environment.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Branches an execution checks out before the agent starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPlan {
    /// Repository to clone; no git setup happens without one.
    pub repo_url: Option<String>,
    /// Shared epic branch, when the item has a parent.
    pub epic_branch: Option<String>,
    /// Per-item feature branch.
    pub feature_branch: String,
}

impl BranchPlan {
    /// Branch layout for `item`.
    #[must_use]
    pub fn for_item(item: &WorkItem) -> Self {
        Self {
            repo_url: item.repo_url.clone(),
            epic_branch: item
                .parent
                .as_deref()
                .map(|epic| format!("{EPIC_PREFIX}{}", ref_component(epic))),
            feature_branch: format!("{FEATURE_PREFIX}{}", ref_component(&item.id)),
        }
    }

    /// Shell prelude that prepares the branches and then runs `"$@"`.
    #[must_use]
    pub fn setup_script(&self) -> String {
        let mut script = String::from("set -eu\n");
        let _ = writeln!(script, "cd {}", shell_quote(WORKSPACE_MOUNT));

        if let Some(repo) = &self.repo_url {
            let _ = writeln!(
                script,
                "if [ ! -d .git ]; then git clone -- {} .; fi",
                shell_quote(repo)
            );
            script.push_str(
                "base=$(git symbolic-ref --short refs/remotes/origin/HEAD 2>/dev/null || echo origin/main)\n",
            );

            if let Some(epic) = &self.epic_branch {
                checkout_or_create(&mut script, epic, "\"$base\"");
                let _ = writeln!(script, "base={}", shell_quote(epic));
            }
            checkout_or_create(&mut script, &self.feature_branch, "\"$base\"");
        }

        script.push_str("exec \"$@\"\n");
        script
    }

    /// Full command for the execution: the prelude followed by `agent_command`.
    #[must_use]
    pub fn wrap_command(&self, agent_command: &[String]) -> Vec<String> {
        let mut command = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            self.setup_script(),
            "recac-setup".to_owned(),
        ];
        command.extend(agent_command.iter().cloned());
        command
    }
}

fn checkout_or_create(script: &mut String, branch: &str, start: &str) {
    let quoted = shell_quote(branch);
    let _ = writeln!(
        script,
        "if git ls-remote --exit-code --heads origin {quoted} >/dev/null 2>&1; then\n  \
         git fetch origin {quoted}\n  \
         git checkout -B {quoted} FETCH_HEAD\n\
         else\n  \
         git checkout -B {quoted} {start}\n  \
         git push -u origin {quoted} || echo 'warning: could not push {branch}' >&2\n\
         fi"
    );
}

/// Reduce an arbitrary ID to characters that are safe in a git ref.
#[must_use]
pub fn ref_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "item".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Single-quote `raw` for POSIX sh.
#[must_use]
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
