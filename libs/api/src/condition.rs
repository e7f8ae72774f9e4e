//! Typed conditions and the wire strings of the condition contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition status, after `metav1.ConditionStatus`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A typed condition on a hub object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Wire string of the condition type, e.g.
    /// `ClusterResourcePlacementScheduled`.
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// The object generation this condition was computed against. Never
    /// larger than the object's current generation.
    pub observed_generation: i64,

    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: String::new(),
            observed_generation,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }
}

/// Find a condition by type in a condition list.
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Condition type wire strings.
pub mod condition_types {
    /// Top-level CRP chain.
    pub const CRP_SCHEDULED: &str = "ClusterResourcePlacementScheduled";
    pub const CRP_ROLLOUT_STARTED: &str = "ClusterResourcePlacementRolloutStarted";
    pub const CRP_OVERRIDDEN: &str = "ClusterResourcePlacementOverridden";
    pub const CRP_WORK_SYNCHRONIZED: &str = "ClusterResourcePlacementWorkSynchronized";
    pub const CRP_APPLIED: &str = "ClusterResourcePlacementApplied";
    pub const CRP_AVAILABLE: &str = "ClusterResourcePlacementAvailable";

    /// Per-cluster placement chain, mirrored under the `Resource` prefix.
    pub const RESOURCE_SCHEDULED: &str = "ResourceScheduled";
    pub const RESOURCE_ROLLOUT_STARTED: &str = "ResourceRolloutStarted";
    pub const RESOURCE_OVERRIDDEN: &str = "ResourceOverridden";
    pub const RESOURCE_WORK_SYNCHRONIZED: &str = "ResourceWorkSynchronized";
    pub const RESOURCE_APPLIED: &str = "ResourceApplied";
    pub const RESOURCE_AVAILABLE: &str = "ResourceAvailable";

    /// Binding-level chain (no Scheduled stage; a binding exists because the
    /// scheduler selected its cluster).
    pub const BINDING_ROLLOUT_STARTED: &str = "RolloutStarted";
    pub const BINDING_OVERRIDDEN: &str = "Overridden";
    pub const BINDING_WORK_SYNCHRONIZED: &str = "WorkSynchronized";
    pub const BINDING_APPLIED: &str = "Applied";
    pub const BINDING_AVAILABLE: &str = "Available";

    /// Work-level conditions, reported by the apply agent.
    pub const WORK_APPLIED: &str = "Applied";
    pub const WORK_AVAILABLE: &str = "Available";

    /// Policy-snapshot scheduling outcome.
    pub const POLICY_SNAPSHOT_SCHEDULED: &str = "Scheduled";
}

/// Reason wire strings. These are part of the external contract.
pub mod reasons {
    // Scheduling.
    pub const FULLY_SCHEDULED: &str = "FullyScheduled";
    pub const NOT_FULLY_SCHEDULED: &str = "NotFullyScheduled";
    pub const SCHEDULE_SUCCEEDED: &str = "ScheduleSucceeded";
    pub const RESOURCE_SCHEDULE_FAILED: &str = "ResourceScheduleFailed";

    // Rollout.
    pub const ROLLOUT_STARTED: &str = "RolloutStarted";
    pub const ROLLOUT_NOT_STARTED_YET: &str = "RolloutNotStartedYet";

    // Overrides.
    pub const OVERRIDE_NOT_SPECIFIED: &str = "OverrideNotSpecified";
    pub const OVERRIDDEN_SUCCEEDED: &str = "OverriddenSucceeded";
    pub const OVERRIDDEN_FAILED: &str = "OverriddenFailed";

    // Work synchronization.
    pub const WORK_SYNCHRONIZED: &str = "WorkSynchronized";
    pub const WORK_NOT_SYNCHRONIZED_YET: &str = "WorkNotSynchronizedYet";
    pub const SYNC_WORK_FAILED: &str = "SyncWorkFailed";
    pub const ALL_WORK_SYNCED: &str = "AllWorkSynced";

    // Apply.
    pub const APPLY_SUCCEEDED: &str = "ApplySucceeded";
    pub const APPLY_FAILED: &str = "ApplyFailed";
    pub const ALL_WORK_APPLIED: &str = "AllWorkApplied";
    pub const WORK_NOT_APPLIED: &str = "WorkNotApplied";

    // Availability.
    pub const AVAILABLE: &str = "AvailableReason";
    pub const NOT_AVAILABLE_YET: &str = "NotAvailableYet";
    pub const ALL_WORK_AVAILABLE: &str = "AllWorkAvailable";
    pub const WORK_NOT_AVAILABLE: &str = "WorkNotAvailable";
    pub const WORK_NOT_TRACKABLE: &str = "WorkNotTrackable";
}
