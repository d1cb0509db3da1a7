//! Executing service actions.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::plan::ServiceAction;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reboot fallbacks, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootMethod {
    Graceful,
    Forced,
    Hard,
}

impl RebootMethod {
    pub const ESCALATION: [RebootMethod; 3] =
        [RebootMethod::Graceful, RebootMethod::Forced, RebootMethod::Hard];
}

/// Performs service and reboot actions on the host.
pub trait ServiceRunner: Send + Sync {
    /// Run `action` (start, stop, reload, restart) for `service`.
    fn service(&self, service: &str, action: &str) -> BoxFuture<'_, Result<(), String>>;

    /// Attempt a reboot. Returning at all means the attempt failed or is
    /// still pending.
    fn reboot(&self, method: RebootMethod) -> BoxFuture<'_, Result<(), String>>;
}

/// Runs `service <name> <action>` and `reboot` through the system's tools.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    /// Log actions without running them.
    pub dry_run: bool,
}

impl SystemRunner {
    async fn run_command(&self, program: &str, args: &[&str]) -> Result<(), String> {
        if self.dry_run {
            info!(%program, ?args, "disabled: would run");
            return Ok(());
        }
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("error running {program}: {e}"))?;
        if output.status.success() {
            return Ok(());
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(format!(
            "error running {program} {}: {}: {}",
            args.join(" "),
            output.status,
            text.trim()
        ))
    }
}

impl ServiceRunner for SystemRunner {
    fn service(&self, service: &str, action: &str) -> BoxFuture<'_, Result<(), String>> {
        let service = service.to_string();
        let action = action.to_string();
        Box::pin(async move { self.run_command("service", &[&service, &action]).await })
    }

    fn reboot(&self, method: RebootMethod) -> BoxFuture<'_, Result<(), String>> {
        let args: &'static [&'static str] = match method {
            RebootMethod::Graceful => &[],
            RebootMethod::Forced => &["-f"],
            RebootMethod::Hard => &["-f", "-f"],
        };
        Box::pin(self.run_command("reboot", args))
    }
}

/// Run `actions` in order and report whether any failed. A reboot is only
/// attempted if nothing before it failed; each fallback gets `reboot_timeout`
/// to take the host down before the next one is tried.
pub async fn execute_actions(
    runner: &dyn ServiceRunner,
    actions: &[ServiceAction],
    reboot_timeout: Duration,
) -> bool {
    let mut had_failures = false;
    for action in actions {
        match action {
            ServiceAction::Reboot => {
                if had_failures {
                    warn!("some triggers failed, will not reboot");
                    return true;
                }
                info!("rebooting");
                for method in RebootMethod::ESCALATION {
                    match tokio::time::timeout(reboot_timeout, runner.reboot(method)).await {
                        Ok(Ok(())) => {
                            // Still running: give the host time to go down.
                            tokio::time::sleep(reboot_timeout).await;
                            warn!(?method, "reboot did not take effect");
                        }
                        Ok(Err(e)) => error!(?method, error = %e, "reboot failed"),
                        Err(_) => warn!(?method, "reboot timed out"),
                    }
                }
                return true;
            }
            other => {
                let service = other.service().unwrap_or_default();
                info!(%service, action = other.verb(), "service action");
                if let Err(e) = runner.service(service, other.verb()).await {
                    error!(%service, action = other.verb(), error = %e, "service action failed");
                    had_failures = true;
                }
            }
        }
    }
    had_failures
}
