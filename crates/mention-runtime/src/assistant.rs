//! Assistant CLI subprocess runner.
//!
//! Each mention becomes one subprocess invocation: the rendered prompt goes
//! in on stdin, the process runs in the configured workspace directory, and
//! the exit is classified into an [`AssistantOutcome`] so the dispatch loop
//! can log and count without parsing errors itself.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Classified end state of one assistant invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssistantOutcome {
    Completed {
        stdout_summary: String,
    },
    TimedOut,
    ExecutableNotFound {
        executable: String,
    },
    /// The CLI refused to act without interactive permission approval.
    PermissionDenied,
    Failed {
        summary: String,
    },
}

impl AssistantOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Completed { .. } => "completed".to_string(),
            Self::TimedOut => "timed out".to_string(),
            Self::ExecutableNotFound { executable } => {
                format!("assistant cli not found at '{executable}'")
            }
            Self::PermissionDenied => {
                "permission denied; run manually: claude --dangerously-skip-permissions".to_string()
            }
            Self::Failed { summary } => format!("failed: {summary}"),
        }
    }
}

/// One invocation with its wall-clock duration.
#[derive(Debug, Clone)]
pub struct AssistantRun {
    pub outcome: AssistantOutcome,
    pub duration: Duration,
}

/// Seam between the dispatch loop and the subprocess machinery.
#[async_trait]
pub trait AssistantInvoker: Send + Sync {
    async fn run_prompt(&self, prompt: &str) -> Result<AssistantRun>;
}

#[derive(Debug, Clone)]
pub struct AssistantCliInvoker {
    executable: String,
    workspace_dir: PathBuf,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl AssistantCliInvoker {
    pub fn new(
        executable: String,
        workspace_dir: PathBuf,
        api_key: Option<String>,
        timeout_ms: u64,
    ) -> Result<Self> {
        if executable.trim().is_empty() {
            anyhow::bail!("assistant cli executable is empty");
        }
        if timeout_ms == 0 {
            anyhow::bail!("assistant cli timeout must be greater than 0ms");
        }
        Ok(Self {
            executable,
            workspace_dir,
            api_key,
            timeout_ms,
        })
    }
}

#[async_trait]
impl AssistantInvoker for AssistantCliInvoker {
    async fn run_prompt(&self, prompt: &str) -> Result<AssistantRun> {
        let started = Instant::now();

        let mut command = Command::new(&self.executable);
        command.kill_on_drop(true);
        command.arg("--output-format");
        command.arg("stream-json");
        command.arg("--print");
        command.arg("--verbose");
        command.arg("--dangerously-skip-permissions");
        command.current_dir(&self.workspace_dir);
        if let Some(api_key) = &self.api_key {
            command.env("CLAUDE_API_KEY", api_key);
        }
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AssistantRun {
                    outcome: AssistantOutcome::ExecutableNotFound {
                        executable: self.executable.clone(),
                    },
                    duration: started.elapsed(),
                });
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to spawn assistant cli '{}'", self.executable)
                });
            }
        };

        // Prompt is delivered on stdin; dropping the handle closes the pipe
        // so the CLI sees end of input. A child that exits before reading
        // stdin breaks the pipe but still has a classifiable exit status.
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(error) => {
                    return Err(error).context("failed to write prompt to assistant cli stdin");
                }
            }
            drop(stdin);
        }

        let output = match tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            child.wait_with_output(),
        )
        .await
        {
            // kill_on_drop reaps the child when the wait future is dropped.
            Err(_) => {
                return Ok(AssistantRun {
                    outcome: AssistantOutcome::TimedOut,
                    duration: started.elapsed(),
                });
            }
            Ok(result) => result.context("assistant cli process failed")?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let outcome = if output.status.success() {
            AssistantOutcome::Completed {
                stdout_summary: truncate_for_log(stdout.trim()),
            }
        } else if stderr.to_lowercase().contains("permission") {
            AssistantOutcome::PermissionDenied
        } else {
            AssistantOutcome::Failed {
                summary: summarize_process_failure(&stderr, &stdout),
            }
        };

        Ok(AssistantRun {
            outcome,
            duration: started.elapsed(),
        })
    }
}

fn summarize_process_failure(stderr: &str, stdout: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return truncate_for_log(stderr);
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return truncate_for_log(stdout);
    }
    "no error output".to_string()
}

fn truncate_for_log(text: &str) -> String {
    const MAX_CHARS: usize = 240;
    if text.chars().count() <= MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_CHARS).collect::<String>() + "..."
}
