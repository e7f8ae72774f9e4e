//! Built-in scheduling plugins.

use std::collections::BTreeMap;

use fleet_api::{MemberCluster, PlacementPolicy, Toleration};

use super::{HookResult, SchedulerPlugin, SchedulingContext, NORMALIZED_SCORE_RANGE};

pub const CLUSTER_ELIGIBILITY_PLUGIN: &str = "cluster-eligibility";
pub const PICK_FIXED_PLUGIN: &str = "pick-fixed";
pub const TAINT_TOLERATION_PLUGIN: &str = "taint-toleration";
pub const CLUSTER_AFFINITY_PLUGIN: &str = "cluster-affinity";
pub const TOPOLOGY_SPREAD_PLUGIN: &str = "topology-spread";

/// Min-max rescale into `[0, NORMALIZED_SCORE_RANGE]`. Equal scores all
/// normalize to zero.
fn normalize_min_max(scores: &mut BTreeMap<String, i64>) {
    let Some(&min) = scores.values().min() else {
        return;
    };
    let Some(&max) = scores.values().max() else {
        return;
    };
    if max == min {
        for value in scores.values_mut() {
            *value = 0;
        }
        return;
    }
    for value in scores.values_mut() {
        *value = (*value - min) * NORMALIZED_SCORE_RANGE / (max - min);
    }
}

/// Rejects clusters whose member agent has not joined.
pub struct ClusterEligibilityPlugin;

impl SchedulerPlugin for ClusterEligibilityPlugin {
    fn name(&self) -> &'static str {
        CLUSTER_ELIGIBILITY_PLUGIN
    }

    fn filter(&self, _ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<()> {
        if cluster.status.joined {
            HookResult::Success(())
        } else {
            HookResult::Unschedulable {
                reason: "cluster has not joined the fleet".to_string(),
            }
        }
    }

    fn pre_score(&self, _ctx: &SchedulingContext<'_>) -> HookResult<()> {
        HookResult::Skip
    }
}

/// Restricts PickFixed placements to the user's cluster list.
pub struct PickFixedPlugin;

impl SchedulerPlugin for PickFixedPlugin {
    fn name(&self) -> &'static str {
        PICK_FIXED_PLUGIN
    }

    fn pre_filter(&self, ctx: &SchedulingContext<'_>) -> HookResult<()> {
        match ctx.policy {
            PlacementPolicy::PickFixed { .. } => HookResult::Success(()),
            _ => HookResult::Skip,
        }
    }

    fn filter(&self, ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<()> {
        let PlacementPolicy::PickFixed { cluster_names } = ctx.policy else {
            return HookResult::Skip;
        };
        if cluster_names.contains(&cluster.metadata.name) {
            HookResult::Success(())
        } else {
            HookResult::Unschedulable {
                reason: "cluster is not in the target cluster list".to_string(),
            }
        }
    }

    fn pre_score(&self, _ctx: &SchedulingContext<'_>) -> HookResult<()> {
        HookResult::Skip
    }
}

/// Rejects clusters carrying taints the policy does not tolerate.
///
/// PickFixed placements skip the taint check: naming a cluster explicitly
/// overrides its taints.
pub struct TaintTolerationPlugin;

impl TaintTolerationPlugin {
    fn tolerations_of(policy: &PlacementPolicy) -> &[Toleration] {
        match policy {
            PlacementPolicy::PickN { tolerations, .. } => tolerations,
            _ => &[],
        }
    }
}

impl SchedulerPlugin for TaintTolerationPlugin {
    fn name(&self) -> &'static str {
        TAINT_TOLERATION_PLUGIN
    }

    fn pre_filter(&self, ctx: &SchedulingContext<'_>) -> HookResult<()> {
        match ctx.policy {
            PlacementPolicy::PickFixed { .. } => HookResult::Skip,
            _ => HookResult::Success(()),
        }
    }

    fn filter(&self, ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<()> {
        let tolerations = Self::tolerations_of(ctx.policy);
        for taint in &cluster.spec.taints {
            if !tolerations.iter().any(|t| t.tolerates(taint)) {
                return HookResult::Unschedulable {
                    reason: format!("cluster has untolerated taint {}", taint.key),
                };
            }
        }
        HookResult::Success(())
    }

    fn pre_score(&self, _ctx: &SchedulingContext<'_>) -> HookResult<()> {
        HookResult::Skip
    }
}

/// Cluster affinity: required terms filter, preferred terms score.
pub struct ClusterAffinityPlugin;

impl ClusterAffinityPlugin {
    fn affinity_of(policy: &PlacementPolicy) -> Option<&fleet_api::ClusterAffinity> {
        match policy {
            PlacementPolicy::PickN { affinity, .. } => affinity.as_ref(),
            _ => None,
        }
    }
}

impl SchedulerPlugin for ClusterAffinityPlugin {
    fn name(&self) -> &'static str {
        CLUSTER_AFFINITY_PLUGIN
    }

    fn pre_filter(&self, ctx: &SchedulingContext<'_>) -> HookResult<()> {
        match Self::affinity_of(ctx.policy) {
            Some(affinity) if !affinity.required_selector_terms.is_empty() => {
                HookResult::Success(())
            }
            _ => HookResult::Skip,
        }
    }

    fn filter(&self, ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<()> {
        let Some(affinity) = Self::affinity_of(ctx.policy) else {
            return HookResult::Skip;
        };
        if affinity.required_selector_terms.is_empty() {
            return HookResult::Skip;
        }
        // OR across terms.
        let matched = affinity
            .required_selector_terms
            .iter()
            .any(|term| term.label_selector.matches(&cluster.metadata.labels));
        if matched {
            HookResult::Success(())
        } else {
            HookResult::Unschedulable {
                reason: "cluster does not match required affinity terms".to_string(),
            }
        }
    }

    fn pre_score(&self, ctx: &SchedulingContext<'_>) -> HookResult<()> {
        match Self::affinity_of(ctx.policy) {
            Some(affinity) if !affinity.preferred_selector_terms.is_empty() => {
                HookResult::Success(())
            }
            _ => HookResult::Skip,
        }
    }

    fn score(&self, ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<i64> {
        let Some(affinity) = Self::affinity_of(ctx.policy) else {
            return HookResult::Skip;
        };
        let score: i64 = affinity
            .preferred_selector_terms
            .iter()
            .filter(|p| p.selector.label_selector.matches(&cluster.metadata.labels))
            .map(|p| i64::from(p.weight))
            .sum();
        HookResult::Success(score)
    }

    fn normalize_score(
        &self,
        _ctx: &SchedulingContext<'_>,
        scores: &mut BTreeMap<String, i64>,
    ) -> HookResult<()> {
        normalize_min_max(scores);
        HookResult::Success(())
    }
}

/// Topology spread: filters placements that would violate the max skew of a
/// DoNotSchedule constraint and scores clusters toward emptier domains.
pub struct TopologySpreadPlugin;

impl TopologySpreadPlugin {
    fn constraints_of(
        policy: &PlacementPolicy,
    ) -> &[fleet_api::TopologySpreadConstraint] {
        match policy {
            PlacementPolicy::PickN {
                topology_spread, ..
            } => topology_spread,
            _ => &[],
        }
    }

    /// Placements per topology domain among already-placed clusters. Every
    /// domain value present in the inventory participates, so empty domains
    /// pull the skew down.
    fn domain_counts(
        ctx: &SchedulingContext<'_>,
        topology_key: &str,
    ) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for cluster in ctx.clusters {
            let domain = Self::domain_of(cluster, topology_key);
            counts.entry(domain).or_insert(0);
        }
        for cluster in ctx.clusters {
            if ctx.placed_clusters.contains(&cluster.metadata.name) {
                let domain = Self::domain_of(cluster, topology_key);
                *counts.entry(domain).or_insert(0) += 1;
            }
        }
        counts
    }

    /// A cluster without the topology label forms the unnamed domain.
    fn domain_of(cluster: &MemberCluster, topology_key: &str) -> String {
        cluster
            .metadata
            .labels
            .get(topology_key)
            .cloned()
            .unwrap_or_default()
    }
}

impl SchedulerPlugin for TopologySpreadPlugin {
    fn name(&self) -> &'static str {
        TOPOLOGY_SPREAD_PLUGIN
    }

    fn pre_filter(&self, ctx: &SchedulingContext<'_>) -> HookResult<()> {
        if Self::constraints_of(ctx.policy).is_empty() {
            HookResult::Skip
        } else {
            HookResult::Success(())
        }
    }

    fn filter(&self, ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<()> {
        for constraint in Self::constraints_of(ctx.policy) {
            if constraint.when_unsatisfiable
                != fleet_api::UnsatisfiableConstraintAction::DoNotSchedule
            {
                continue;
            }
            let mut counts = Self::domain_counts(ctx, &constraint.topology_key);
            let domain = Self::domain_of(cluster, &constraint.topology_key);
            *counts.entry(domain).or_insert(0) += 1;

            let max = counts.values().max().copied().unwrap_or(0);
            let min = counts.values().min().copied().unwrap_or(0);
            let skew = max - min;
            if skew > constraint.max_skew as usize {
                return HookResult::Unschedulable {
                    reason: format!(
                        "placing on cluster would violate topology spread over {}",
                        constraint.topology_key
                    ),
                };
            }
        }
        HookResult::Success(())
    }

    fn pre_score(&self, ctx: &SchedulingContext<'_>) -> HookResult<()> {
        if Self::constraints_of(ctx.policy).is_empty() {
            HookResult::Skip
        } else {
            HookResult::Success(())
        }
    }

    fn score(&self, ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<i64> {
        let mut score = 0i64;
        for constraint in Self::constraints_of(ctx.policy) {
            let counts = Self::domain_counts(ctx, &constraint.topology_key);
            let domain = Self::domain_of(cluster, &constraint.topology_key);
            score -= counts.get(&domain).copied().unwrap_or(0) as i64;
        }
        HookResult::Success(score)
    }

    fn normalize_score(
        &self,
        _ctx: &SchedulingContext<'_>,
        scores: &mut BTreeMap<String, i64>,
    ) -> HookResult<()> {
        normalize_min_max(scores);
        HookResult::Success(())
    }
}
