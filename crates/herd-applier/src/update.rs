//! The sub-side update sequence: stop, mutate, start.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use herd_core::{
    DisruptionState, ERROR_DISRUPTION_DENIED, ERROR_DISRUPTION_PENDING, Filter, Trigger, Triggers,
    UpdateRequest,
};
use herd_disruption::DisruptionHandle;
use tracing::{info, warn};

use crate::error::{ApplyError, ApplyResult};
use crate::matcher::match_triggers;
use crate::mutate::{MutationReport, Mutator};
use crate::plan::{plan_start, plan_stop};
use crate::runner::{ServiceRunner, execute_actions};

/// Disruption checks made before a high-impact stop.
pub trait DisruptionGate: Send + Sync {
    fn request(&self) -> DisruptionState;
    fn cancel(&self);
}

impl DisruptionGate for DisruptionHandle {
    fn request(&self) -> DisruptionState {
        DisruptionHandle::request(self)
    }

    fn cancel(&self) {
        DisruptionHandle::cancel(self)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub root: PathBuf,
    pub objects_dir: PathBuf,
    /// Triggers of the previous update, merged with each new request's.
    pub old_triggers_file: Option<PathBuf>,
    pub skip_filter: Filter,
    pub set_ownership: bool,
    pub reboot_timeout: Duration,
}

impl UpdateOptions {
    pub fn new(root: impl Into<PathBuf>, objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            objects_dir: objects_dir.into(),
            old_triggers_file: None,
            skip_filter: Filter::default(),
            set_ownership: true,
            reboot_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub had_trigger_failures: bool,
    /// Time between the first and last file-system mutation.
    pub change_window: Duration,
    pub last_error: Option<String>,
}

pub struct Updater {
    mutator: Mutator,
    old_triggers_file: Option<PathBuf>,
    reboot_timeout: Duration,
    runner: Arc<dyn ServiceRunner>,
    disruption: Option<Arc<dyn DisruptionGate>>,
}

impl Updater {
    pub fn new(options: UpdateOptions, runner: Arc<dyn ServiceRunner>) -> Self {
        let mut mutator = Mutator::new(options.root, options.objects_dir);
        mutator.skip_filter = options.skip_filter;
        mutator.set_ownership = options.set_ownership;
        Self {
            mutator,
            old_triggers_file: options.old_triggers_file,
            reboot_timeout: options.reboot_timeout,
            runner,
            disruption: None,
        }
    }

    pub fn with_disruption(mut self, gate: Arc<dyn DisruptionGate>) -> Self {
        self.disruption = Some(gate);
        self
    }

    /// Load the previous triggers, record this request's, then apply.
    pub async fn update(&self, request: UpdateRequest) -> ApplyResult<UpdateOutcome> {
        let old = match &self.old_triggers_file {
            Some(path) => {
                let old = load_triggers(path).merge(&request.triggers);
                if !request.triggers.is_empty() {
                    if let Err(e) = save_triggers(path, &request.triggers) {
                        warn!(path = %path.display(), error = %e, "failed to save triggers");
                    }
                }
                old
            }
            None => Triggers::default(),
        };
        self.apply(request, old).await
    }

    /// Run the update with `old` as the currently installed triggers.
    pub async fn apply(&self, request: UpdateRequest, old: Triggers) -> ApplyResult<UpdateOutcome> {
        let start = Instant::now();
        let request = Arc::new(request);
        let mut had_trigger_failures = false;

        let (mut report, touched) = self
            .blocking(&request, |mutator, request| {
                let mut report = MutationReport::default();
                mutator.prepare_cache(request, &mut report);
                let touched = owned(mutator.touched_paths(request));
                (report, touched)
            })
            .await?;

        let mut stopped = Vec::new();
        if !old.is_empty() {
            let matched_old = match_triggers(&old, touched.iter().map(String::as_str));
            self.check_disruption(&matched_old, request.force_disruption)?;
            stopped = plan_stop(&matched_old);
            if execute_actions(self.runner.as_ref(), &stopped, self.reboot_timeout).await {
                had_trigger_failures = true;
            }
        }

        let (mutated, touched, change_window) = self
            .blocking(&request, |mutator, request| {
                let touched = owned(mutator.touched_paths(request));
                let begin = Instant::now();
                let mut report = MutationReport::default();
                mutator.apply(request, &mut report);
                (report, touched, begin.elapsed())
            })
            .await?;
        report.errors += mutated.errors;
        if mutated.last_error.is_some() {
            report.last_error = mutated.last_error;
        }

        let matched_new = match_triggers(&request.triggers, touched.iter().map(String::as_str));
        let started = plan_start(&matched_new, &stopped);
        if execute_actions(self.runner.as_ref(), &started, self.reboot_timeout).await {
            had_trigger_failures = true;
        }

        info!(
            image = %request.image_name,
            elapsed = ?start.elapsed(),
            change_window = ?change_window,
            errors = report.errors,
            "update completed"
        );
        Ok(UpdateOutcome {
            had_trigger_failures,
            change_window,
            last_error: report.last_error,
        })
    }

    fn check_disruption(&self, matched: &[&Trigger], force: bool) -> ApplyResult<()> {
        let Some(gate) = &self.disruption else {
            return Ok(());
        };
        if !matched.iter().any(|t| t.high_impact) {
            gate.cancel();
            return Ok(());
        }
        if force {
            return Ok(());
        }
        match gate.request() {
            DisruptionState::Requested => Err(ApplyError::Disruption(ERROR_DISRUPTION_PENDING)),
            DisruptionState::Denied => Err(ApplyError::Disruption(ERROR_DISRUPTION_DENIED)),
            DisruptionState::Anytime | DisruptionState::Permitted => Ok(()),
        }
    }

    async fn blocking<T, F>(&self, request: &Arc<UpdateRequest>, f: F) -> ApplyResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Mutator, &UpdateRequest) -> T + Send + 'static,
    {
        let mutator = self.mutator.clone();
        let request = Arc::clone(request);
        tokio::task::spawn_blocking(move || f(&mutator, &request))
            .await
            .map_err(|e| ApplyError::Task(e.to_string()))
    }
}

fn owned(paths: Vec<&str>) -> Vec<String> {
    paths.into_iter().map(str::to_string).collect()
}

fn load_triggers(path: &std::path::Path) -> Triggers {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "error decoding old triggers");
            Triggers::default()
        }),
        Err(_) => Triggers::default(),
    }
}

fn save_triggers(path: &std::path::Path, triggers: &Triggers) -> ApplyResult<()> {
    let data = serde_json::to_vec_pretty(triggers)
        .map_err(|e| ApplyError::io(path, std::io::Error::other(e)))?;
    std::fs::write(path, data).map_err(|e| ApplyError::io(path, e))
}
