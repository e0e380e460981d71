//! Agent collaborator abstraction.
//!
//! The core never interprets what an agent says; it only hands over a
//! prompt and collects text. [`HostCliAgent`] drives an external CLI (e.g.
//! `claude -p`) and streams its stdout line by line.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::{AppError, Result};

/// Environment variables inherited by the host CLI; everything else is
/// stripped before launch.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "RUST_LOG",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "OPENROUTER_API_KEY",
];

/// Callback receiving each streamed chunk.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Prompt-in, text-out interface to an AI agent.
pub trait Agent: Send + Sync {
    /// Send a prompt and wait for the full reply.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Agent` on launch failure, non-zero exit, or
    /// cancellation.
    fn send<'a>(&'a self, prompt: &'a str)
        -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Send a prompt, passing each chunk to `on_chunk` as it arrives, and
    /// return the full reply.
    ///
    /// # Errors
    ///
    /// Same as [`Agent::send`].
    fn send_stream<'a>(
        &'a self,
        prompt: &'a str,
        on_chunk: ChunkSink<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// Agent backed by a host CLI that takes the prompt as its last argument.
#[derive(Debug, Clone)]
pub struct HostCliAgent {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl HostCliAgent {
    /// Run `program` with `args` followed by the prompt.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the CLI from `dir`.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Abort in-flight calls when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn run(&self, prompt: &str, on_chunk: Option<ChunkSink<'_>>) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(prompt)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in ALLOWED_ENV_VARS {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Agent(format!("cannot launch {}: {err}", self.program)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Agent("agent stdout unavailable".into()))?;

        let mut lines = BufReader::new(stdout).lines();
        let mut reply = String::new();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(AppError::Agent("agent call cancelled".into()));
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(sink) = on_chunk {
                                sink(&line);
                            }
                            reply.push_str(&line);
                            reply.push('\n');
                        }
                        Ok(None) => break,
                        Err(err) => {
                            return Err(AppError::Agent(format!("cannot read agent output: {err}")));
                        }
                    }
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| AppError::Agent(format!("agent did not exit cleanly: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Agent(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        debug!(bytes = reply.len(), "agent replied");
        Ok(reply)
    }
}

impl Agent for HostCliAgent {
    fn send<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        let span = info_span!("agent_send", program = %self.program);
        Box::pin(self.run(prompt, None).instrument(span))
    }

    fn send_stream<'a>(
        &'a self,
        prompt: &'a str,
        on_chunk: ChunkSink<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        let span = info_span!("agent_send_stream", program = %self.program);
        Box::pin(self.run(prompt, Some(on_chunk)).instrument(span))
    }
}
