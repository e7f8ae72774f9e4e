//! `ClusterResourcePlacement` and its policy, strategy, and status types.

use serde::{Deserialize, Serialize};

use crate::{
    Condition, FailedResourcePlacement, HubObject, IntOrPercent, LabelSelector, ObjectMeta,
    ResourceIdentifier, Toleration,
};

/// Default number of retired snapshots kept per CRP.
pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 10;

/// Default dwell window after a binding turns available, in seconds.
pub const DEFAULT_UNAVAILABLE_PERIOD_SECONDS: i64 = 60;

/// The user's declared placement intent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourcePlacement {
    pub metadata: ObjectMeta,
    pub spec: PlacementSpec,
    #[serde(default)]
    pub status: PlacementStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementSpec {
    /// Which resources to propagate.
    pub resource_selectors: Vec<ResourceSelector>,

    /// Which clusters to propagate to. Absent means PickAll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PlacementPolicy>,

    #[serde(default)]
    pub strategy: RolloutStrategy,

    /// Overrides copied onto bindings at admission and applied by the work
    /// generator, cluster-resource level before resource level.
    #[serde(default, skip_serializing_if = "PlacementOverrides::is_empty")]
    pub overrides: PlacementOverrides,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
}

impl HubObject for ClusterResourcePlacement {
    const KIND: &'static str = "ClusterResourcePlacement";

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

impl ClusterResourcePlacement {
    /// The effective policy; an absent policy means PickAll.
    pub fn effective_policy(&self) -> PlacementPolicy {
        self.spec.policy.clone().unwrap_or(PlacementPolicy::PickAll)
    }

    pub fn revision_history_limit(&self) -> i32 {
        self.spec
            .revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
            .max(1)
    }
}

/// Selects resources by group/version/kind plus an optional name or label
/// selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSelector {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

/// The three placement policy variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "placement_type")]
pub enum PlacementPolicy {
    /// Place on every cluster that passes the filters.
    PickAll,

    /// Place on the `n` best-scoring clusters.
    PickN {
        n: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        affinity: Option<ClusterAffinity>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        topology_spread: Vec<TopologySpreadConstraint>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tolerations: Vec<Toleration>,
    },

    /// Place on exactly the named clusters.
    PickFixed { cluster_names: Vec<String> },
}

/// Cluster affinity: required terms filter, preferred terms score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterAffinity {
    /// A cluster must match at least one required term (OR across terms).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_selector_terms: Vec<ClusterSelectorTerm>,

    /// Weighted preferences; weights may be negative.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_selector_terms: Vec<PreferredClusterSelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSelectorTerm {
    pub label_selector: LabelSelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferredClusterSelector {
    pub weight: i32,
    pub selector: ClusterSelectorTerm,
}

/// Spread constraint over a topology label key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    pub max_skew: u32,
    pub topology_key: String,
    #[serde(default)]
    pub when_unsatisfiable: UnsatisfiableConstraintAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsatisfiableConstraintAction {
    #[default]
    DoNotSchedule,
    ScheduleAnyway,
}

/// How bindings advance to new resource snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RolloutStrategy {
    RollingUpdate {
        #[serde(default = "default_max_surge")]
        max_surge: IntOrPercent,
        #[serde(default = "default_max_unavailable")]
        max_unavailable: IntOrPercent,
        #[serde(default = "default_unavailable_period_seconds")]
        unavailable_period_seconds: i64,
    },

    /// Rollout driven by an external controller; the hub never promotes
    /// bindings on its own.
    External,
}

fn default_max_surge() -> IntOrPercent {
    IntOrPercent::Percent(25)
}

fn default_max_unavailable() -> IntOrPercent {
    IntOrPercent::Percent(25)
}

fn default_unavailable_period_seconds() -> i64 {
    DEFAULT_UNAVAILABLE_PERIOD_SECONDS
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        RolloutStrategy::RollingUpdate {
            max_surge: default_max_surge(),
            max_unavailable: default_max_unavailable(),
            unavailable_period_seconds: default_unavailable_period_seconds(),
        }
    }
}

/// Override rules, applied by the work generator as JSON patches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementOverrides {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_resource_overrides: Vec<OverrideRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_overrides: Vec<OverrideRule>,
}

impl PlacementOverrides {
    pub fn is_empty(&self) -> bool {
        self.cluster_resource_overrides.is_empty() && self.resource_overrides.is_empty()
    }
}

/// One override: a JSON patch applied to the manifests a selector matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideRule {
    pub name: String,
    pub resource_selector: ResourceSelector,
    pub json_patch: Vec<JsonPatchOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonPatchOp {
    pub op: JsonPatchVerb,
    /// JSON pointer, e.g. `/spec/replicas`.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonPatchVerb {
    Add,
    Replace,
    Remove,
}

/// Observed state of a CRP, produced by the placement aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementStatus {
    /// Union of resource identifiers across the latest master's children.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_resources: Vec<ResourceIdentifier>,

    /// Resource index string of the latest master snapshot.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed_resource_index: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub placement_statuses: Vec<ResourcePlacementStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Per-cluster placement status inside the CRP status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePlacementStatus {
    /// Empty for a PickN entry that could not be satisfied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_placements: Vec<FailedResourcePlacement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_policy_defaults_to_pick_all() {
        let crp = ClusterResourcePlacement::default();
        assert_eq!(crp.effective_policy(), PlacementPolicy::PickAll);
    }

    #[test]
    fn test_revision_history_limit_floor() {
        let mut crp = ClusterResourcePlacement::default();
        assert_eq!(crp.revision_history_limit(), DEFAULT_REVISION_HISTORY_LIMIT);
        crp.spec.revision_history_limit = Some(0);
        assert_eq!(crp.revision_history_limit(), 1);
    }

    #[test]
    fn test_policy_serde_roundtrip() {
        let policy = PlacementPolicy::PickN {
            n: 3,
            affinity: None,
            topology_spread: vec![TopologySpreadConstraint {
                max_skew: 1,
                topology_key: "region".to_string(),
                when_unsatisfiable: UnsatisfiableConstraintAction::ScheduleAnyway,
            }],
            tolerations: Vec::new(),
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"placement_type\":\"pick_n\""));
        let parsed: PlacementPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }
}
