//! External command execution.
//!
//! [`CommandRunner`] runs rendered commands as child processes with a
//! scrubbed environment, an optional timeout and a cooperative kill signal.
//! [`CommandRunner::run_plan`] drives the steps of one attempt:
//!
//! 1. `down`, when the attempt re-runs an already produced interval;
//! 2. `check`, and stop there if it succeeds;
//! 3. `up`, then `check` again to confirm.
//!
//! The runner captures stdout and stderr of every step. A command that
//! cannot be spawned, exits non-zero or times out fails the attempt.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;

use crate::core::task::RenderedCommand;

/// Variables inherited from the engine's environment. Everything else is cleared.
pub const ENV_WHITELIST: &[&str] = &[
    "LANG",
    "HOSTNAME",
    "LOGNAME",
    "USER",
    "PATH",
    "HOME",
    "XDG_CONFIG_HOME",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "all_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "ALL_PROXY",
];

/// Errors from running a command or an attempt plan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The command exited with a non-zero status, or was terminated by a signal (`-1`).
    #[error("command failed with exit code {code}")]
    Failed { code: i32 },

    /// The command did not finish in time.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The command could not be started.
    #[error("failed to execute command: {0}")]
    Spawn(String),

    /// The attempt was killed on request.
    #[error("command killed")]
    Killed,

    /// `check` still failed after `up` succeeded.
    #[error("check failed after up succeeded")]
    CheckDisagrees,

    /// The command has no program.
    #[error("empty command")]
    Empty,
}

impl CommandError {
    /// Exit code to report for this error, if the process ran.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Failed { code } => Some(*code),
            _ => None,
        }
    }
}

/// Cooperative kill signal shared by every step of an attempt.
pub struct KillSignal {
    rx: Option<oneshot::Receiver<()>>,
    fired: bool,
}

impl KillSignal {
    /// A signal fired by sending on (not dropping) the paired sender.
    pub fn new(rx: oneshot::Receiver<()>) -> Self {
        Self {
            rx: Some(rx),
            fired: false,
        }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            rx: None,
            fired: false,
        }
    }

    /// Create a connected sender and signal.
    pub fn pair() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self::new(rx))
    }

    /// True once the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.fired
    }

    /// Resolve when the signal fires. Pends forever if the sender is dropped.
    pub async fn fired(&mut self) {
        if self.fired {
            return;
        }
        if let Some(rx) = self.rx.as_mut() {
            if rx.await.is_ok() {
                self.fired = true;
                return;
            }
        }
        self.rx = None;
        std::future::pending::<()>().await
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
}

/// The rendered steps of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptPlan {
    #[serde(default)]
    pub down: Option<RenderedCommand>,
    #[serde(default)]
    pub check: Option<RenderedCommand>,
    #[serde(default)]
    pub up: Option<RenderedCommand>,
}

/// What running an [`AttemptPlan`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanReport {
    pub result: Result<(), CommandError>,
    /// Exit code of the last step that ran.
    pub exit_code: Option<i32>,
    /// Output of every step that ran, each under a header.
    pub output: String,
    pub down_completed: bool,
    pub notes: Vec<String>,
}

impl PlanReport {
    fn new() -> Self {
        Self {
            result: Ok(()),
            exit_code: None,
            output: String::new(),
            down_completed: false,
            notes: Vec::new(),
        }
    }

    fn step(&mut self, name: &str, cmd: &RenderedCommand, out: CommandOutput) {
        self.exit_code = out.exit_code;
        self.output
            .push_str(&format!("--- {}: {}\n", name, cmd.display()));
        self.output.push_str(&out.output);
        if !out.output.is_empty() && !out.output.ends_with('\n') {
            self.output.push('\n');
        }
    }

    fn fail(mut self, err: CommandError) -> Self {
        self.result = Err(err);
        self
    }
}

/// Runs commands as child processes.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    base_env: BTreeMap<String, String>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::from_process_env()
    }
}

impl CommandRunner {
    /// A runner inheriting whitelisted variables from this process.
    pub fn from_process_env() -> Self {
        let base_env = std::env::vars()
            .filter(|(k, _)| ENV_WHITELIST.contains(&k.as_str()))
            .collect();
        Self { base_env }
    }

    /// A runner with an explicit base environment.
    pub fn with_base_env(base_env: BTreeMap<String, String>) -> Self {
        Self { base_env }
    }

    /// The environment every command starts from.
    pub fn base_env(&self) -> &BTreeMap<String, String> {
        &self.base_env
    }

    /// Run one command to completion, timeout or kill.
    pub async fn run(
        &self,
        cmd: &RenderedCommand,
        kill: &mut KillSignal,
    ) -> (Result<(), CommandError>, CommandOutput) {
        let Some((program, args)) = cmd.argv.split_first() else {
            return (Err(CommandError::Empty), CommandOutput::default());
        };
        if kill.is_fired() {
            return (Err(CommandError::Killed), CommandOutput::default());
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(&self.base_env)
            .envs(&cmd.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return (Err(CommandError::Spawn(e.to_string())), CommandOutput::default()),
        };
        debug!(command = %cmd.display(), "spawned command");

        let timeout = cmd.timeout_secs.map(Duration::from_secs);
        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Dropping the wait future drops the child, which kills it.
        tokio::select! {
            waited = child.wait_with_output() => match waited {
                Ok(out) => {
                    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
                    output.push_str(&String::from_utf8_lossy(&out.stderr));
                    let code = out.status.code().unwrap_or(-1);
                    let captured = CommandOutput { exit_code: Some(code), output };
                    if out.status.success() {
                        (Ok(()), captured)
                    } else {
                        (Err(CommandError::Failed { code }), captured)
                    }
                }
                Err(e) => (Err(CommandError::Spawn(e.to_string())), CommandOutput::default()),
            },
            _ = deadline => {
                let limit = timeout.unwrap_or_default();
                (Err(CommandError::Timeout(limit)), CommandOutput::default())
            }
            _ = kill.fired() => (Err(CommandError::Killed), CommandOutput::default()),
        }
    }

    /// Run the steps of an attempt.
    pub async fn run_plan(&self, plan: &AttemptPlan, kill: &mut KillSignal) -> PlanReport {
        let mut report = PlanReport::new();

        if let Some(down) = &plan.down {
            let (result, out) = self.run(down, kill).await;
            report.step("down", down, out);
            if let Err(e) = result {
                return report.fail(e);
            }
            report.down_completed = true;
            report.notes.push("down completed".to_string());
        }

        if let Some(check) = &plan.check {
            let (result, out) = self.run(check, kill).await;
            report.step("check", check, out);
            match result {
                Ok(()) => {
                    report.notes.push("check satisfied, up skipped".to_string());
                    return report;
                }
                Err(CommandError::Failed { .. }) => {
                    report.notes.push("check failed, running up".to_string());
                }
                Err(e) => return report.fail(e),
            }
        }

        if let Some(up) = &plan.up {
            let (result, out) = self.run(up, kill).await;
            report.step("up", up, out);
            if let Err(e) = result {
                return report.fail(e);
            }
        }

        if let Some(check) = &plan.check {
            let (result, out) = self.run(check, kill).await;
            report.step("check", check, out);
            match result {
                Ok(()) => report.notes.push("check confirmed up".to_string()),
                Err(CommandError::Failed { .. }) => return report.fail(CommandError::CheckDisagrees),
                Err(e) => return report.fail(e),
            }
        }

        report
    }
}
