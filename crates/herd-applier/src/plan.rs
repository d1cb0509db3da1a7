//! Turning matched triggers into service actions.
//!
//! Rules:
//! * if any matched trigger reboots, the stop phase does nothing and the
//!   start phase starts only rebooting services, then reboots;
//! * reload-only triggers are not stopped; at start they reload, unless the
//!   service was stopped or also has a restart trigger matched, in which
//!   case it is started;
//! * the sub's own service is never stopped and is restarted after every
//!   other service has been started.

use std::collections::BTreeSet;

use herd_core::Trigger;

use crate::SELF_SERVICE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAction {
    Stop(String),
    Start(String),
    Reload(String),
    Restart(String),
    Reboot,
}

impl ServiceAction {
    pub fn service(&self) -> Option<&str> {
        match self {
            ServiceAction::Stop(s)
            | ServiceAction::Start(s)
            | ServiceAction::Reload(s)
            | ServiceAction::Restart(s) => Some(s),
            ServiceAction::Reboot => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ServiceAction::Stop(_) => "stop",
            ServiceAction::Start(_) => "start",
            ServiceAction::Reload(_) => "reload",
            ServiceAction::Restart(_) => "restart",
            ServiceAction::Reboot => "reboot",
        }
    }
}

fn any_reboot(triggers: &[&Trigger]) -> bool {
    triggers.iter().any(|t| t.do_reboot)
}

/// Actions for the matched old triggers, before any mutation.
pub fn plan_stop(matched_old: &[&Trigger]) -> Vec<ServiceAction> {
    if any_reboot(matched_old) {
        return Vec::new();
    }
    let mut seen = BTreeSet::new();
    matched_old
        .iter()
        .filter(|t| !t.do_reload && t.service != SELF_SERVICE)
        .filter(|t| seen.insert(t.service.as_str()))
        .map(|t| ServiceAction::Stop(t.service.clone()))
        .collect()
}

/// Actions for the matched new triggers, after mutation. `stopped` are the
/// services stopped in the stop phase.
pub fn plan_start(matched_new: &[&Trigger], stopped: &[ServiceAction]) -> Vec<ServiceAction> {
    if any_reboot(matched_new) {
        let mut seen = BTreeSet::new();
        let mut actions: Vec<_> = matched_new
            .iter()
            .filter(|t| t.do_reboot && t.service != SELF_SERVICE)
            .filter(|t| seen.insert(t.service.as_str()))
            .map(|t| ServiceAction::Start(t.service.clone()))
            .collect();
        actions.push(ServiceAction::Reboot);
        return actions;
    }
    let stopped: BTreeSet<&str> = stopped
        .iter()
        .filter_map(|a| match a {
            ServiceAction::Stop(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    let restarting: BTreeSet<&str> = matched_new
        .iter()
        .filter(|t| !t.do_reload)
        .map(|t| t.service.as_str())
        .chain(stopped.iter().copied())
        .collect();

    let mut seen = BTreeSet::new();
    let mut actions = Vec::new();
    let mut restart_self = false;
    for trigger in matched_new {
        if trigger.service == SELF_SERVICE {
            restart_self = true;
            continue;
        }
        if !seen.insert(trigger.service.as_str()) {
            continue;
        }
        if restarting.contains(trigger.service.as_str()) {
            actions.push(ServiceAction::Start(trigger.service.clone()));
        } else {
            actions.push(ServiceAction::Reload(trigger.service.clone()));
        }
    }
    if restart_self {
        actions.push(ServiceAction::Restart(SELF_SERVICE.to_string()));
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(service: &str, reload: bool, reboot: bool) -> Trigger {
        let mut t = Trigger::new(service, &["/x"]).unwrap();
        t.do_reload = reload;
        t.do_reboot = reboot;
        t
    }

    #[test]
    fn stop_then_start_for_recreated_path() {
        let a = trigger("a", false, false);
        let stop = plan_stop(&[&a]);
        assert_eq!(stop, vec![ServiceAction::Stop("a".into())]);
        let start = plan_start(&[&a], &stop);
        assert_eq!(start, vec![ServiceAction::Start("a".into())]);
    }

    #[test]
    fn reload_only_service_is_reloaded() {
        let a = trigger("a", true, false);
        assert!(plan_stop(&[&a]).is_empty());
        assert_eq!(plan_start(&[&a], &[]), vec![ServiceAction::Reload("a".into())]);
    }

    #[test]
    fn stopped_service_is_started_not_reloaded() {
        let restart = trigger("a", false, false);
        let reload = trigger("a", true, false);
        let stop = plan_stop(&[&restart]);
        assert_eq!(
            plan_start(&[&reload], &stop),
            vec![ServiceAction::Start("a".into())]
        );
        assert_eq!(
            plan_start(&[&reload, &restart], &[]),
            vec![ServiceAction::Start("a".into())]
        );
    }

    #[test]
    fn self_service_restarts_last_and_never_stops() {
        let me = trigger(SELF_SERVICE, false, false);
        let other = trigger("zz", false, false);
        assert_eq!(plan_stop(&[&me, &other]), vec![ServiceAction::Stop("zz".into())]);
        assert_eq!(
            plan_start(&[&me, &other], &[]),
            vec![
                ServiceAction::Start("zz".into()),
                ServiceAction::Restart(SELF_SERVICE.into())
            ]
        );
    }

    #[test]
    fn reboot_skips_everything_else() {
        let kernel = trigger("kernel", false, true);
        let web = trigger("web", false, false);
        let me = trigger(SELF_SERVICE, false, false);
        assert!(plan_stop(&[&kernel, &web]).is_empty());
        assert_eq!(
            plan_start(&[&kernel, &web, &me], &[]),
            vec![ServiceAction::Start("kernel".into()), ServiceAction::Reboot]
        );
    }
}
