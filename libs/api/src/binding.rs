//! Per-cluster resource bindings.

use serde::{Deserialize, Serialize};

use crate::{
    Condition, ClusterDecision, FailedResourcePlacement, HubObject, ObjectMeta, PlacementOverrides,
};

/// The intent to place a specific resource snapshot on a specific cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceBinding {
    pub metadata: ObjectMeta,
    pub spec: BindingSpec,
    #[serde(default)]
    pub status: BindingStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub state: BindingState,

    pub target_cluster: String,

    /// Name of the bound master resource snapshot. Empty until the binding
    /// is admitted by the rollout controller.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_snapshot_name: String,

    /// Policy snapshot observed when the binding was scheduled.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_snapshot_name: String,

    /// The scheduler's decision for the target cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_decision: Option<ClusterDecision>,

    /// Overrides to apply when generating Works.
    #[serde(default, skip_serializing_if = "PlacementOverrides::is_empty")]
    pub overrides: PlacementOverrides,
}

/// Binding lifecycle.
///
/// ```text
/// Scheduled --(admit)--> Bound --(target cluster lost)--> Unscheduled
///               ^                                              |
///               +---------------(rescheduled)------------------+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    /// Cluster selected; waiting for rollout admission.
    #[default]
    Scheduled,
    /// Bound to a resource snapshot; Works are generated.
    Bound,
    /// Cluster no longer selected; retained for graceful drain.
    Unscheduled,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Bound => "bound",
            Self::Unscheduled => "unscheduled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Manifests that failed to apply or become available, capped by the
    /// work generator; order is not guaranteed once truncated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_placements: Vec<FailedResourcePlacement>,
}

impl HubObject for ClusterResourceBinding {
    const KIND: &'static str = "ClusterResourceBinding";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}
