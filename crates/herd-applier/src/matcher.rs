//! Pure trigger matching.

use std::collections::BTreeSet;

use herd_core::{Trigger, Triggers, UpdateRequest};

/// Triggers in `triggers` matched by any of `paths`, in trigger order.
pub fn match_triggers<'t, 'p>(
    triggers: &'t Triggers,
    paths: impl IntoIterator<Item = &'p str>,
) -> Vec<&'t Trigger> {
    let mut matched = BTreeSet::new();
    for path in paths {
        for (index, trigger) in triggers.triggers.iter().enumerate() {
            if !matched.contains(&index) && trigger.is_match(path) {
                matched.insert(index);
            }
        }
        if matched.len() == triggers.len() {
            break;
        }
    }
    matched.into_iter().map(|i| &triggers.triggers[i]).collect()
}

/// Triggers of `request` matched by the paths it touches. With no
/// file-system to compare against, every metadata change counts.
pub fn matched_in_update(request: &UpdateRequest) -> Vec<&Trigger> {
    match_triggers(&request.triggers, request.touched_paths())
}
