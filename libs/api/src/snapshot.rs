//! Immutable policy and resource snapshots.

use serde::{Deserialize, Serialize};

use crate::{labels, Condition, HubObject, ObjectMeta, PlacementPolicy};

/// Immutable copy of a placement policy at a particular CRP generation.
///
/// Keyed `(crpName, policyIndex)`; exactly one snapshot per CRP carries the
/// latest-snapshot label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSchedulingPolicySnapshot {
    pub metadata: ObjectMeta,
    pub spec: PolicySnapshotSpec,
    #[serde(default)]
    pub status: PolicySnapshotStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshotSpec {
    /// The policy at snapshot time. Absent means PickAll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PlacementPolicy>,

    /// Content hash of the canonicalized policy.
    pub policy_hash: String,

    /// Monotone per-CRP index.
    pub policy_index: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshotStatus {
    /// CRP generation the decisions were computed against.
    #[serde(default)]
    pub observed_crp_generation: i64,

    /// Ordered by (-score, clusterName).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_decisions: Vec<ClusterDecision>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HubObject for ClusterSchedulingPolicySnapshot {
    const KIND: &'static str = "ClusterSchedulingPolicySnapshot";

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

impl ClusterSchedulingPolicySnapshot {
    pub fn is_latest(&self) -> bool {
        self.metadata
            .has_label(labels::IS_LATEST_SNAPSHOT_LABEL, "true")
    }

    /// Selected cluster names, in decision order.
    pub fn selected_clusters(&self) -> Vec<&str> {
        self.status
            .cluster_decisions
            .iter()
            .filter(|d| d.selected)
            .map(|d| d.cluster_name.as_str())
            .collect()
    }
}

/// One scheduling decision for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterDecision {
    pub cluster_name: String,
    pub selected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_score: Option<ClusterScore>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Normalized per-plugin score components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterScore {
    pub affinity_score: i64,
    pub topology_spread_score: i64,
}

impl ClusterScore {
    pub fn total(&self) -> i64 {
        self.affinity_score + self.topology_spread_score
    }
}

/// Immutable, content-addressed copy of selected resource manifests.
///
/// A logical snapshot splits into a master plus subindexed children when the
/// content exceeds the size budget; the master is always written last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceSnapshot {
    pub metadata: ObjectMeta,
    pub spec: ResourceSnapshotSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshotSpec {
    /// Decoded manifest documents, ordered by `ClusterWideKey`.
    pub selected_resources: Vec<serde_json::Value>,
}

impl HubObject for ClusterResourceSnapshot {
    const KIND: &'static str = "ClusterResourceSnapshot";

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

impl ClusterResourceSnapshot {
    pub fn is_latest(&self) -> bool {
        self.metadata
            .has_label(labels::IS_LATEST_SNAPSHOT_LABEL, "true")
    }

    /// Whether this is a master snapshot (carries the total-count
    /// annotation) as opposed to a subindexed child.
    pub fn is_master(&self) -> bool {
        self.metadata
            .annotations
            .contains_key(labels::NUMBER_OF_RESOURCE_SNAPSHOTS_ANNOTATION)
    }

    /// Total number of snapshots in the group, from the master annotation.
    pub fn number_of_resource_snapshots(&self) -> Option<usize> {
        self.metadata
            .annotations
            .get(labels::NUMBER_OF_RESOURCE_SNAPSHOTS_ANNOTATION)?
            .parse()
            .ok()
    }
}
