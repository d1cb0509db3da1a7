//! Disruption coordinator — one loop owning the current disruption state.
//!
//! The loop re-checks the manager on a timer whose interval grows by half
//! each time, capped low while a disruptive update is wanted and high when
//! none is. Any change of state or desire snaps the interval back down.
//! While disruption is wanted and the manager says Requested or Denied the
//! request is re-sent periodically; once nobody wants it, outstanding
//! permissions and requests are cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use herd_core::DisruptionState;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::policy::{CommandManager, DisruptionCommand, DisruptionManager, DisruptionPolicy};

/// Where to find the external disruption manager, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisruptionConfig {
    #[serde(default)]
    pub manager: Option<PathBuf>,
    #[serde(default)]
    pub manager_args: Vec<String>,
}

impl DisruptionConfig {
    pub fn policy(&self) -> DisruptionPolicy {
        match &self.manager {
            Some(program) => DisruptionPolicy::External(Arc::new(
                CommandManager::new(program).with_args(self.manager_args.clone()),
            )),
            None => DisruptionPolicy::AlwaysPermitted,
        }
    }
}

/// Cadence of checks, requests and cancels.
#[derive(Debug, Clone)]
pub struct DisruptionTiming {
    pub check_change_to_disrupt: Duration,
    pub check_change_to_non_disrupt: Duration,
    pub check_disrupt: Duration,
    pub check_non_disrupt: Duration,
    pub check_startup: Duration,
    pub cancel_when_permitted: Duration,
    pub cancel_when_requested: Duration,
    pub request_when_denied: Duration,
    pub request_when_requested: Duration,
    pub resend_minimum: Duration,
    pub resend_same_mutation: Duration,
    pub retry_failed_mutation: Duration,
}

impl Default for DisruptionTiming {
    fn default() -> Self {
        Self {
            check_change_to_disrupt: Duration::from_secs(1),
            check_change_to_non_disrupt: Duration::from_secs(5),
            check_disrupt: Duration::from_secs(15),
            check_non_disrupt: Duration::from_secs(5 * 60),
            check_startup: Duration::from_secs(10),
            cancel_when_permitted: Duration::from_secs(31 * 60),
            cancel_when_requested: Duration::from_secs(15 * 60),
            request_when_denied: Duration::from_secs(60),
            request_when_requested: Duration::from_secs(15 * 60),
            resend_minimum: Duration::from_secs(1),
            resend_same_mutation: Duration::from_secs(60),
            retry_failed_mutation: Duration::from_secs(60),
        }
    }
}

/// Cheap, cloneable access to a running coordinator.
#[derive(Clone)]
pub struct DisruptionHandle {
    state: watch::Receiver<DisruptionState>,
    want: Option<Arc<watch::Sender<bool>>>,
}

impl DisruptionHandle {
    /// A handle for subs with no disruption policy.
    pub fn always_permitted() -> Self {
        let (_tx, rx) = watch::channel(DisruptionState::Anytime);
        Self {
            state: rx,
            want: None,
        }
    }

    pub fn state(&self) -> DisruptionState {
        *self.state.borrow()
    }

    /// Signal that a disruptive update is wanted and return the state as
    /// currently known. Callers poll this until it allows disruption.
    pub fn request(&self) -> DisruptionState {
        match &self.want {
            None => DisruptionState::Anytime,
            Some(want) => {
                let state = self.state();
                want.send_replace(true);
                state
            }
        }
    }

    /// Signal that no disruptive update is wanted any more.
    pub fn cancel(&self) {
        if let Some(want) = &self.want {
            want.send_replace(false);
        }
    }
}

/// Start the coordinator for `policy`. The background tasks stop when
/// `shutdown` flips to true or its sender is dropped.
pub fn start_coordinator(
    policy: DisruptionPolicy,
    timing: DisruptionTiming,
    shutdown: watch::Receiver<bool>,
) -> DisruptionHandle {
    let manager = match policy {
        DisruptionPolicy::AlwaysPermitted => return DisruptionHandle::always_permitted(),
        DisruptionPolicy::External(manager) => manager,
    };
    let (state_tx, state_rx) = watch::channel(DisruptionState::Anytime);
    let (want_tx, want_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_queue(
        manager,
        command_rx,
        result_tx,
        timing.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(run_loop(
        timing, want_rx, state_tx, command_tx, result_rx, shutdown,
    ));

    DisruptionHandle {
        state: state_rx,
        want: Some(Arc::new(want_tx)),
    }
}

fn since(t: Option<Instant>) -> Duration {
    t.map_or(Duration::MAX, |t| t.elapsed())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_loop(
    timing: DisruptionTiming,
    mut want_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<DisruptionState>,
    command_tx: mpsc::UnboundedSender<DisruptionCommand>,
    mut result_rx: mpsc::UnboundedReceiver<(DisruptionCommand, DisruptionState)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut check_interval = timing.check_startup;
    let mut check_at = Instant::now();
    let mut initial_cancel_at = Some(Instant::now() + timing.cancel_when_permitted);
    let mut current = DisruptionState::Anytime;
    let mut last_command: Option<Instant> = None;
    let mut allow_cancels = false;
    let mut want = false;

    loop {
        let mut reset_interval = false;
        tokio::select! {
            changed = want_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let new_want = *want_rx.borrow_and_update();
                allow_cancels = true;
                initial_cancel_at = None;
                if new_want != want {
                    last_command = None;
                    reset_interval = true;
                }
                want = new_want;
            }
            _ = sleep_until(check_at) => {
                check_interval += check_interval / 2;
                let cap = if want { timing.check_disrupt } else { timing.check_non_disrupt };
                check_interval = check_interval.min(cap);
                let _ = command_tx.send(DisruptionCommand::Check);
                check_at = Instant::now() + check_interval;
            }
            _ = sleep_until_opt(initial_cancel_at) => {
                initial_cancel_at = None;
                if !allow_cancels {
                    allow_cancels = true;
                    last_command = None;
                    reset_interval = true;
                }
            }
            result = result_rx.recv() => {
                let Some((command, state)) = result else { break };
                if state != current {
                    info!(%command, from = %current, to = %state, "disruption state changed");
                    state_tx.send_replace(state);
                    current = state;
                    last_command = None;
                    reset_interval = true;
                } else {
                    debug!(%command, %state, "disruption manager ran");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        if want {
            let resend_after = match current {
                DisruptionState::Requested => Some(timing.request_when_requested),
                DisruptionState::Denied => Some(timing.request_when_denied),
                _ => None,
            };
            if resend_after.is_some_and(|after| since(last_command) > after) {
                let _ = command_tx.send(DisruptionCommand::Request);
                last_command = Some(Instant::now());
            }
            if reset_interval {
                check_interval = timing.check_change_to_disrupt;
                check_at = Instant::now() + check_interval;
            }
        } else if allow_cancels {
            let cancel_after = match current {
                DisruptionState::Permitted => Some(timing.cancel_when_permitted),
                DisruptionState::Requested => Some(timing.cancel_when_requested),
                _ => None,
            };
            if cancel_after.is_some_and(|after| since(last_command) > after) {
                let _ = command_tx.send(DisruptionCommand::Cancel);
                last_command = Some(Instant::now());
            }
            if reset_interval {
                check_interval = timing.check_change_to_non_disrupt;
                check_at = Instant::now() + check_interval;
            }
        }
    }
    debug!("disruption coordinator stopped");
}

type RunResult = (DisruptionCommand, Result<DisruptionState, String>);

/// Runs manager commands one at a time, at least `resend_minimum` apart.
async fn run_queue(
    manager: Arc<dyn DisruptionManager>,
    mut command_rx: mpsc::UnboundedReceiver<DisruptionCommand>,
    result_tx: mpsc::UnboundedSender<(DisruptionCommand, DisruptionState)>,
    timing: DisruptionTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    let (run_tx, mut run_rx) = mpsc::channel::<RunResult>(1);
    let mut running = false;
    let mut delay_until: Option<Instant> = None;
    let mut last_command_time: Option<Instant> = None;
    let mut last_mutation: Option<(DisruptionCommand, Instant)> = None;
    let mut next: Option<DisruptionCommand> = None;

    loop {
        tokio::select! {
            _ = sleep_until_opt(delay_until) => {
                delay_until = None;
                if running {
                    continue;
                }
                if let Some(command) = next.take() {
                    running = true;
                    let manager = Arc::clone(&manager);
                    let run_tx = run_tx.clone();
                    tokio::spawn(async move {
                        let result = manager.run(command).await.map_err(|e| e.to_string());
                        let _ = run_tx.send((command, result)).await;
                    });
                }
            }
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                if command.is_mutating()
                    && last_mutation.is_some_and(|(c, at)| {
                        c == command && at.elapsed() < timing.resend_same_mutation
                    })
                {
                    continue;
                }
                let wait = timing.resend_minimum.saturating_sub(since(last_command_time));
                delay_until = Some(Instant::now() + wait);
                if command.is_mutating() || next.is_none() {
                    next = Some(command);
                }
            }
            Some((command, result)) = run_rx.recv() => {
                running = false;
                let now = Instant::now();
                last_command_time = Some(now);
                match result {
                    Err(e) => {
                        warn!(%command, error = %e, "error running disruption manager");
                        if command.is_mutating() && next.is_none() {
                            next = Some(command);
                            delay_until = Some(now + timing.retry_failed_mutation);
                        }
                    }
                    Ok(state) => {
                        if command.is_mutating() {
                            last_mutation = Some((command, now));
                        }
                        if result_tx.send((command, state)).is_err() {
                            break;
                        }
                    }
                }
                if next.is_some() && delay_until.is_none() {
                    delay_until = Some(now + timing.resend_minimum);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
