use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use super::types::EksClusterStatus;

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_SYNCED: &str = "Synced";

pub const REASON_CREATING: &str = "Creating";
pub const REASON_AVAILABLE: &str = "Available";
pub const REASON_DELETING: &str = "Deleting";
pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";

/// The control plane and its dependents are being provisioned.
pub fn creating() -> Condition {
    condition(CONDITION_TYPE_READY, "False", REASON_CREATING, "cluster is being provisioned")
}

/// Control plane active, workers up, auth synced, connection secret published.
pub fn available() -> Condition {
    condition(CONDITION_TYPE_READY, "True", REASON_AVAILABLE, "cluster is available")
}

/// Teardown in progress or complete.
pub fn deleting() -> Condition {
    condition(CONDITION_TYPE_READY, "False", REASON_DELETING, "cluster is being deleted")
}

/// The last reconcile pass finished without error.
pub fn reconcile_success() -> Condition {
    condition(
        CONDITION_TYPE_SYNCED,
        "True",
        REASON_RECONCILE_SUCCESS,
        "last reconcile completed without error",
    )
}

/// The last reconcile pass failed; the message carries the error.
pub fn reconcile_error(err: impl std::fmt::Display) -> Condition {
    condition(CONDITION_TYPE_SYNCED, "False", REASON_RECONCILE_ERROR, &err.to_string())
}

fn condition(type_: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

impl EksClusterStatus {
    /// Upserts each condition by type, leaving conditions of other types in place.
    pub fn set_conditions<I>(&mut self, conditions: I)
    where
        I: IntoIterator<Item = Condition>,
    {
        for new_condition in conditions {
            let (next, _) = set_status_condition(&self.conditions, new_condition);
            self.conditions = next;
        }
    }
}

/// Sets the corresponding condition in conditions to new_condition and returns
/// a tuple containing the new conditions vector and whether it was changed.
///
/// 1. If the condition of the specified type already exists, all fields of the existing condition
///    are updated to new_condition. LastTransitionTime is set to now if the new status differs
///    from the old status
/// 2. If a condition of the specified type does not exist, LastTransitionTime is set to now()
///    if unset, and new_condition is appended
pub fn set_status_condition(
    conditions: &[Condition],
    mut new_condition: Condition,
) -> (Vec<Condition>, bool) {
    let mut new_conditions = Vec::from(conditions);
    let mut changed = false;

    if let Some(index) = new_conditions.iter().position(|c| c.type_ == new_condition.type_) {
        // Update existing condition
        let existing = &mut new_conditions[index];

        if existing.status != new_condition.status {
            existing.status = new_condition.status;
            existing.last_transition_time = Time(Utc::now());
            changed = true;
        }

        if existing.reason != new_condition.reason {
            existing.reason = new_condition.reason;
            changed = true;
        }

        if existing.message != new_condition.message {
            existing.message = new_condition.message;
            changed = true;
        }

        if existing.observed_generation != new_condition.observed_generation {
            existing.observed_generation = new_condition.observed_generation;
            changed = true;
        }
    } else {
        // Add new condition
        new_condition.last_transition_time = Time(Utc::now());
        new_conditions.push(new_condition);
        changed = true;
    }

    (new_conditions, changed)
}

/// Finds the condition_type in conditions.
pub fn find_status_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|condition| condition.type_ == condition_type)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    is_status_condition_present_and_equal(conditions, condition_type, "True")
}

/// Returns true when condition_type is present and equal to status.
pub fn is_status_condition_present_and_equal(
    conditions: &[Condition],
    condition_type: &str,
    status: &str,
) -> bool {
    conditions
        .iter()
        .any(|condition| condition.type_ == condition_type && condition.status == status)
}
