//! Triggers — path patterns mapped to service actions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::filter::PathPattern;

/// A rule: when a path matching any of `match_lines` changes, act on `service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub match_lines: Vec<PathPattern>,
    pub service: String,
    /// Controls the order triggers are run in. Defaults to the service name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sort_name: String,
    #[serde(default)]
    pub do_reboot: bool,
    #[serde(default)]
    pub do_reload: bool,
    #[serde(default)]
    pub high_impact: bool,
}

impl Trigger {
    pub fn new(service: &str, match_lines: &[&str]) -> Result<Self, crate::CoreError> {
        Ok(Self {
            match_lines: match_lines
                .iter()
                .map(|l| PathPattern::new(l))
                .collect::<Result<_, _>>()?,
            service: service.to_string(),
            sort_name: String::new(),
            do_reboot: false,
            do_reload: false,
            high_impact: false,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.match_lines.iter().any(|p| p.is_match(path))
    }

    fn sort_key(&self) -> (&str, &str) {
        let name = if self.sort_name.is_empty() {
            &self.service
        } else {
            &self.sort_name
        };
        (name, &self.service)
    }
}

/// An ordered list of triggers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Triggers {
    pub triggers: Vec<Trigger>,
}

impl Triggers {
    pub fn new(mut triggers: Vec<Trigger>) -> Self {
        triggers.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self { triggers }
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// `(any high impact, any reboot)` over this set.
    pub fn check_impact(&self) -> (bool, bool) {
        let high_impact = self.triggers.iter().any(|t| t.high_impact);
        let reboot = self.triggers.iter().any(|t| t.do_reboot);
        (high_impact, reboot)
    }

    /// Merge `other` into `self`. Triggers sharing a service and reload flag
    /// have their match lines unioned and their reboot/impact flags or'ed.
    pub fn merge(&self, other: &Triggers) -> Triggers {
        let mut merged: BTreeMap<(bool, String), (BTreeSet<String>, bool, bool)> =
            BTreeMap::new();
        for trigger in self.triggers.iter().chain(other.triggers.iter()) {
            let entry = merged
                .entry((trigger.do_reload, trigger.service.clone()))
                .or_default();
            entry
                .0
                .extend(trigger.match_lines.iter().map(|p| p.as_str().to_string()));
            entry.1 |= trigger.do_reboot;
            entry.2 |= trigger.high_impact;
        }
        let triggers = merged
            .into_iter()
            .filter_map(|((do_reload, service), (lines, do_reboot, high_impact))| {
                let match_lines = lines
                    .iter()
                    .map(|l| PathPattern::new(l))
                    .collect::<Result<Vec<_>, _>>()
                    .ok()?;
                Some(Trigger {
                    match_lines,
                    service,
                    sort_name: String::new(),
                    do_reboot,
                    do_reload,
                    high_impact,
                })
            })
            .collect();
        Triggers::new(triggers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unions_match_lines_per_service() {
        let mut a = Trigger::new("nginx", &["/etc/nginx/.*"]).unwrap();
        a.high_impact = true;
        let b = Trigger::new("nginx", &["/usr/sbin/nginx"]).unwrap();
        let mut c = Trigger::new("nginx", &["/etc/nginx/mime.types"]).unwrap();
        c.do_reload = true;
        let merged = Triggers::new(vec![a]).merge(&Triggers::new(vec![b, c]));
        assert_eq!(merged.len(), 2);
        let restart = merged.triggers.iter().find(|t| !t.do_reload).unwrap();
        assert!(restart.high_impact);
        assert_eq!(restart.match_lines.len(), 2);
        assert!(restart.is_match("/usr/sbin/nginx"));
    }

    #[test]
    fn check_impact_reports_flags() {
        let mut t = Trigger::new("kernel", &["/boot/.*"]).unwrap();
        assert_eq!(Triggers::new(vec![t.clone()]).check_impact(), (false, false));
        t.do_reboot = true;
        assert_eq!(Triggers::new(vec![t]).check_impact(), (false, true));
    }

    #[test]
    fn sorted_by_sort_name() {
        let mut a = Trigger::new("zeta", &["/z"]).unwrap();
        a.sort_name = "00".into();
        let b = Trigger::new("alpha", &["/a"]).unwrap();
        let t = Triggers::new(vec![b, a]);
        assert_eq!(t.triggers[0].service, "zeta");
    }

    #[test]
    fn json_field_names() {
        let json = r#"[{"match_lines":["/etc/ssh/.*"],"service":"sshd","do_reload":true}]"#;
        let t: Triggers = serde_json::from_str(json).unwrap();
        assert!(t.triggers[0].do_reload);
        assert!(t.triggers[0].is_match("/etc/ssh/sshd_config"));
    }
}
