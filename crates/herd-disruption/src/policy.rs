//! Disruption policies and the external manager capability.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use herd_core::DisruptionState;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DisruptionError, DisruptionResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Commands understood by a disruption manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisruptionCommand {
    Check,
    Request,
    Cancel,
}

impl DisruptionCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            DisruptionCommand::Check => "check",
            DisruptionCommand::Request => "request",
            DisruptionCommand::Cancel => "cancel",
        }
    }

    /// Request and cancel change the manager's view; check only observes it.
    pub fn is_mutating(self) -> bool {
        !matches!(self, DisruptionCommand::Check)
    }
}

impl fmt::Display for DisruptionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that decides whether disruption is permitted.
pub trait DisruptionManager: Send + Sync {
    fn run(&self, command: DisruptionCommand) -> BoxFuture<'_, DisruptionResult<DisruptionState>>;
}

/// Where disruption decisions come from.
#[derive(Clone)]
pub enum DisruptionPolicy {
    /// No policy configured: disruption is always allowed.
    AlwaysPermitted,
    External(Arc<dyn DisruptionManager>),
}

impl fmt::Debug for DisruptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisruptionPolicy::AlwaysPermitted => f.write_str("AlwaysPermitted"),
            DisruptionPolicy::External(_) => f.write_str("External"),
        }
    }
}

/// Runs `program [args..] <command>` and maps its exit code:
/// 0 → Permitted, 1 → Requested, 2 → Denied.
#[derive(Debug, Clone)]
pub struct CommandManager {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandManager {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    async fn execute(&self, command: DisruptionCommand) -> DisruptionResult<DisruptionState> {
        debug!(program = %self.program.display(), %command, "running disruption manager");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(command.as_str())
            .output()
            .await
            .map_err(|e| DisruptionError::Spawn(e.to_string()))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim().to_string();
        match output.status.code() {
            Some(0) => Ok(DisruptionState::Permitted),
            Some(1) => Ok(DisruptionState::Requested),
            Some(2) => Ok(DisruptionState::Denied),
            Some(code) => Err(DisruptionError::InvalidExitCode { code, output: text }),
            None => Err(DisruptionError::Killed { output: text }),
        }
    }
}

impl DisruptionManager for CommandManager {
    fn run(&self, command: DisruptionCommand) -> BoxFuture<'_, DisruptionResult<DisruptionState>> {
        Box::pin(self.execute(command))
    }
}
