//! Plugin-shaped scheduling framework.
//!
//! A scheduler is a fixed pipeline of extension points invoked per
//! (snapshot, cluster) pair:
//!
//! ```text
//! PostBatch -> PreFilter -> Filter -> PostFilter -> PreScore -> Score -> NormalizeScore
//! ```
//!
//! Plugins implement any subset of hooks; each hook returns a tagged
//! [`HookResult`] rather than using error control flow, and the scheduling
//! cycle is a fold over the hooks. Tie-breaking is strictly lexical on
//! cluster name after score equality, so repeated cycles over identical
//! inputs produce identical decision order.

pub mod plugins;
mod reconciler;

pub use reconciler::SchedulerReconciler;

use std::collections::{BTreeMap, BTreeSet};

use fleet_api::{ClusterDecision, ClusterScore, MemberCluster, PlacementPolicy};

/// Plugin scores are clamped to this range before normalization.
pub const MIN_PLUGIN_SCORE: i64 = -100;
pub const MAX_PLUGIN_SCORE: i64 = 100;

/// Normalized plugin scores land in `[0, NORMALIZED_SCORE_RANGE]`.
pub const NORMALIZED_SCORE_RANGE: i64 = 100;

/// Outcome of one plugin hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult<T = ()> {
    Success(T),
    /// The plugin opts out for this cycle.
    Skip,
    /// The cluster is rejected; short-circuits the remaining filter hooks.
    Unschedulable { reason: String },
    Error { retryable: bool, message: String },
}

/// A failed scheduling cycle.
#[derive(Debug, Clone)]
pub struct ScheduleError {
    pub retryable: bool,
    pub message: String,
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Inputs of one scheduling cycle.
pub struct SchedulingContext<'a> {
    pub crp_name: &'a str,
    pub policy: &'a PlacementPolicy,
    pub clusters: &'a [MemberCluster],
    /// Clusters already holding a live (scheduled or bound) binding.
    pub placed_clusters: &'a BTreeSet<String>,
    pub max_batch_per_cycle: u32,
}

/// A scheduling plugin. Default hook implementations opt out.
pub trait SchedulerPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute a cap on new selections this cycle.
    fn post_batch(&self, _ctx: &SchedulingContext<'_>) -> HookResult<u32> {
        HookResult::Skip
    }

    /// Decide whether the filter hook runs this cycle; return `Skip` to opt
    /// out.
    fn pre_filter(&self, _ctx: &SchedulingContext<'_>) -> HookResult<()> {
        HookResult::Success(())
    }

    fn filter(&self, _ctx: &SchedulingContext<'_>, _cluster: &MemberCluster) -> HookResult<()> {
        HookResult::Skip
    }

    /// Observe the feasible set after filtering.
    fn post_filter(
        &self,
        _ctx: &SchedulingContext<'_>,
        _feasible: &[&MemberCluster],
    ) -> HookResult<()> {
        HookResult::Skip
    }

    /// Decide whether the score hook runs this cycle; return `Skip` to opt
    /// out.
    fn pre_score(&self, _ctx: &SchedulingContext<'_>) -> HookResult<()> {
        HookResult::Success(())
    }

    fn score(&self, _ctx: &SchedulingContext<'_>, _cluster: &MemberCluster) -> HookResult<i64> {
        HookResult::Skip
    }

    /// Rescale this plugin's raw scores into `[0, NORMALIZED_SCORE_RANGE]`.
    fn normalize_score(
        &self,
        _ctx: &SchedulingContext<'_>,
        _scores: &mut BTreeMap<String, i64>,
    ) -> HookResult<()> {
        HookResult::Skip
    }
}

/// Result of one scheduling cycle.
#[derive(Debug, Clone)]
pub struct SchedulingOutput {
    /// Ordered by (selected, -score, clusterName).
    pub decisions: Vec<ClusterDecision>,
    /// Whether the policy's target was fully met.
    pub satisfied: bool,
    /// Human-readable detail for the unsatisfied case.
    pub detail: String,
}

impl SchedulingOutput {
    pub fn selected_count(&self) -> usize {
        self.decisions.iter().filter(|d| d.selected).count()
    }
}

/// The framework: an ordered plugin registry plus the cycle fold.
pub struct SchedulerFramework {
    plugins: Vec<Box<dyn SchedulerPlugin>>,
}

impl SchedulerFramework {
    /// Framework with the standard plugin set.
    pub fn new() -> Self {
        Self {
            plugins: vec![
                Box::new(plugins::ClusterEligibilityPlugin),
                Box::new(plugins::PickFixedPlugin),
                Box::new(plugins::TaintTolerationPlugin),
                Box::new(plugins::ClusterAffinityPlugin),
                Box::new(plugins::TopologySpreadPlugin),
            ],
        }
    }

    /// Framework with a custom plugin set, in invocation order.
    pub fn with_plugins(plugins: Vec<Box<dyn SchedulerPlugin>>) -> Self {
        Self { plugins }
    }

    /// Run one scheduling cycle.
    pub fn schedule(&self, ctx: &SchedulingContext<'_>) -> Result<SchedulingOutput, ScheduleError> {
        let batch = self.compute_batch(ctx)?;
        let (feasible, rejected) = self.filter_clusters(ctx)?;

        for plugin in &self.plugins {
            if let HookResult::Error { retryable, message } = plugin.post_filter(ctx, &feasible) {
                return Err(ScheduleError {
                    retryable,
                    message: format!("{}: post-filter: {message}", plugin.name()),
                });
            }
        }

        let scores = self.score_clusters(ctx, &feasible)?;
        Ok(self.pick(ctx, batch, &feasible, rejected, &scores))
    }

    /// Fold PostBatch hooks into the admission cap for new selections.
    fn compute_batch(&self, ctx: &SchedulingContext<'_>) -> Result<u32, ScheduleError> {
        let mut batch = match ctx.policy {
            PlacementPolicy::PickN { n, .. } => {
                let already = ctx
                    .placed_clusters
                    .iter()
                    .filter(|placed| ctx.clusters.iter().any(|c| &&c.metadata.name == placed))
                    .count() as u32;
                n.saturating_sub(already)
            }
            _ => u32::MAX,
        };
        batch = batch.min(ctx.max_batch_per_cycle);

        for plugin in &self.plugins {
            match plugin.post_batch(ctx) {
                HookResult::Success(cap) => batch = batch.min(cap),
                HookResult::Skip | HookResult::Unschedulable { .. } => {}
                HookResult::Error { retryable, message } => {
                    return Err(ScheduleError {
                        retryable,
                        message: format!("{}: post-batch: {message}", plugin.name()),
                    })
                }
            }
        }
        Ok(batch)
    }

    /// Run the filter chain; returns feasible clusters and per-cluster
    /// rejection reasons.
    #[allow(clippy::type_complexity)]
    fn filter_clusters<'c>(
        &self,
        ctx: &SchedulingContext<'c>,
    ) -> Result<(Vec<&'c MemberCluster>, BTreeMap<String, String>), ScheduleError> {
        let active: Vec<&Box<dyn SchedulerPlugin>> = self
            .plugins
            .iter()
            .filter(|p| !matches!(p.pre_filter(ctx), HookResult::Skip))
            .collect();

        let mut feasible = Vec::new();
        let mut rejected = BTreeMap::new();

        'clusters: for cluster in ctx.clusters {
            for plugin in &active {
                match plugin.filter(ctx, cluster) {
                    HookResult::Success(()) | HookResult::Skip => {}
                    HookResult::Unschedulable { reason } => {
                        rejected.insert(cluster.metadata.name.clone(), reason);
                        continue 'clusters;
                    }
                    HookResult::Error { retryable, message } => {
                        return Err(ScheduleError {
                            retryable,
                            message: format!("{}: filter: {message}", plugin.name()),
                        })
                    }
                }
            }
            feasible.push(cluster);
        }
        Ok((feasible, rejected))
    }

    /// Score, clamp, normalize, and sum per-plugin scores.
    fn score_clusters(
        &self,
        ctx: &SchedulingContext<'_>,
        feasible: &[&MemberCluster],
    ) -> Result<BTreeMap<&'static str, BTreeMap<String, i64>>, ScheduleError> {
        let mut per_plugin: BTreeMap<&'static str, BTreeMap<String, i64>> = BTreeMap::new();

        for plugin in &self.plugins {
            match plugin.pre_score(ctx) {
                HookResult::Skip => continue,
                HookResult::Error { retryable, message } => {
                    return Err(ScheduleError {
                        retryable,
                        message: format!("{}: pre-score: {message}", plugin.name()),
                    })
                }
                _ => {}
            }

            let mut scores = BTreeMap::new();
            for cluster in feasible {
                match plugin.score(ctx, cluster) {
                    HookResult::Success(score) => {
                        scores.insert(
                            cluster.metadata.name.clone(),
                            score.clamp(MIN_PLUGIN_SCORE, MAX_PLUGIN_SCORE),
                        );
                    }
                    HookResult::Skip | HookResult::Unschedulable { .. } => {}
                    HookResult::Error { retryable, message } => {
                        return Err(ScheduleError {
                            retryable,
                            message: format!("{}: score: {message}", plugin.name()),
                        })
                    }
                }
            }
            if scores.is_empty() {
                continue;
            }

            if let HookResult::Error { retryable, message } =
                plugin.normalize_score(ctx, &mut scores)
            {
                return Err(ScheduleError {
                    retryable,
                    message: format!("{}: normalize: {message}", plugin.name()),
                });
            }
            per_plugin.insert(plugin.name(), scores);
        }
        Ok(per_plugin)
    }

    fn pick(
        &self,
        ctx: &SchedulingContext<'_>,
        batch: u32,
        feasible: &[&MemberCluster],
        rejected: BTreeMap<String, String>,
        scores: &BTreeMap<&'static str, BTreeMap<String, i64>>,
    ) -> SchedulingOutput {
        let score_of = |name: &str| -> ClusterScore {
            ClusterScore {
                affinity_score: scores
                    .get(plugins::CLUSTER_AFFINITY_PLUGIN)
                    .and_then(|m| m.get(name))
                    .copied()
                    .unwrap_or(0),
                topology_spread_score: scores
                    .get(plugins::TOPOLOGY_SPREAD_PLUGIN)
                    .and_then(|m| m.get(name))
                    .copied()
                    .unwrap_or(0),
            }
        };

        // Sort feasible clusters by (-total score, clusterName).
        let mut ranked: Vec<(&MemberCluster, ClusterScore)> = feasible
            .iter()
            .map(|c| (*c, score_of(&c.metadata.name)))
            .collect();
        ranked.sort_by(|(a, sa), (b, sb)| {
            sb.total()
                .cmp(&sa.total())
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });

        let mut decisions = Vec::new();
        let mut satisfied = true;
        let mut detail = String::new();

        match ctx.policy {
            PlacementPolicy::PickAll => {
                for (cluster, score) in &ranked {
                    decisions.push(ClusterDecision {
                        cluster_name: cluster.metadata.name.clone(),
                        selected: true,
                        cluster_score: Some(*score),
                        reason: "picked by scheduling policy".to_string(),
                    });
                }
            }
            PlacementPolicy::PickFixed { cluster_names } => {
                let feasible_names: BTreeSet<&str> =
                    ranked.iter().map(|(c, _)| c.metadata.name.as_str()).collect();
                let mut missing = 0usize;
                for name in cluster_names {
                    if feasible_names.contains(name.as_str()) {
                        decisions.push(ClusterDecision {
                            cluster_name: name.clone(),
                            selected: true,
                            cluster_score: None,
                            reason: "picked by the target cluster list".to_string(),
                        });
                    } else {
                        missing += 1;
                        let reason = rejected
                            .get(name)
                            .cloned()
                            .unwrap_or_else(|| "cluster is not in the inventory".to_string());
                        decisions.push(ClusterDecision {
                            cluster_name: name.clone(),
                            selected: false,
                            cluster_score: None,
                            reason,
                        });
                    }
                }
                if missing > 0 {
                    satisfied = false;
                    detail = format!("{missing} target cluster(s) cannot be placed on");
                }
                // Fixed placements report only the user's list.
                return finish(decisions, satisfied, detail);
            }
            PlacementPolicy::PickN { n, .. } => {
                let target = *n as usize;
                // Keep already-placed clusters first for stability, then
                // fill by rank, bounded by the batch cap.
                let mut selected: Vec<(&MemberCluster, ClusterScore)> = Vec::new();
                let mut remaining: Vec<(&MemberCluster, ClusterScore)> = Vec::new();
                for (cluster, score) in ranked {
                    if selected.len() < target && ctx.placed_clusters.contains(&cluster.metadata.name)
                    {
                        selected.push((cluster, score));
                    } else {
                        remaining.push((cluster, score));
                    }
                }
                let mut new_picks = 0u32;
                let mut not_picked = Vec::new();
                for (cluster, score) in remaining {
                    if selected.len() < target && new_picks < batch {
                        new_picks += 1;
                        selected.push((cluster, score));
                    } else {
                        not_picked.push((cluster, score));
                    }
                }

                if selected.len() < target {
                    satisfied = false;
                    detail = format!(
                        "could only select {} of the requested {} clusters",
                        selected.len(),
                        target
                    );
                }

                for (cluster, score) in selected {
                    decisions.push(ClusterDecision {
                        cluster_name: cluster.metadata.name.clone(),
                        selected: true,
                        cluster_score: Some(score),
                        reason: "picked by scheduling policy".to_string(),
                    });
                }
                for (cluster, score) in not_picked {
                    decisions.push(ClusterDecision {
                        cluster_name: cluster.metadata.name.clone(),
                        selected: false,
                        cluster_score: Some(score),
                        reason: "cluster is not picked by scoring".to_string(),
                    });
                }
            }
        }

        for (name, reason) in rejected {
            decisions.push(ClusterDecision {
                cluster_name: name,
                selected: false,
                cluster_score: None,
                reason,
            });
        }

        finish(decisions, satisfied, detail)
    }
}

impl Default for SchedulerFramework {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(mut decisions: Vec<ClusterDecision>, satisfied: bool, detail: String) -> SchedulingOutput {
    decisions.sort_by(|a, b| {
        b.selected
            .cmp(&a.selected)
            .then_with(|| {
                let sa = a.cluster_score.map(|s| s.total()).unwrap_or(i64::MIN);
                let sb = b.cluster_score.map(|s| s.total()).unwrap_or(i64::MIN);
                sb.cmp(&sa)
            })
            .then_with(|| a.cluster_name.cmp(&b.cluster_name))
    });
    SchedulingOutput {
        decisions,
        satisfied,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::ObjectMeta;

    fn cluster(name: &str) -> MemberCluster {
        let mut c = MemberCluster {
            metadata: ObjectMeta::named(name),
            ..Default::default()
        };
        c.status.joined = true;
        c
    }

    struct RejectPlugin {
        reject: &'static str,
    }

    impl SchedulerPlugin for RejectPlugin {
        fn name(&self) -> &'static str {
            "reject"
        }

        fn pre_filter(&self, _ctx: &SchedulingContext<'_>) -> HookResult<()> {
            HookResult::Success(())
        }

        fn filter(&self, _ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<()> {
            if cluster.metadata.name == self.reject {
                HookResult::Unschedulable {
                    reason: "rejected by test".to_string(),
                }
            } else {
                HookResult::Success(())
            }
        }
    }

    struct FixedScorePlugin;

    impl SchedulerPlugin for FixedScorePlugin {
        fn name(&self) -> &'static str {
            plugins::CLUSTER_AFFINITY_PLUGIN
        }

        fn score(&self, _ctx: &SchedulingContext<'_>, cluster: &MemberCluster) -> HookResult<i64> {
            // Longer names score higher, far beyond the clamp range.
            HookResult::Success(cluster.metadata.name.len() as i64 * 1000)
        }
    }

    fn run(
        framework: &SchedulerFramework,
        policy: &PlacementPolicy,
        clusters: &[MemberCluster],
    ) -> SchedulingOutput {
        let placed = BTreeSet::new();
        let ctx = SchedulingContext {
            crp_name: "demo",
            policy,
            clusters,
            placed_clusters: &placed,
            max_batch_per_cycle: 100,
        };
        framework.schedule(&ctx).unwrap()
    }

    #[test]
    fn test_pick_all_selects_all_feasible() {
        let framework =
            SchedulerFramework::with_plugins(vec![Box::new(RejectPlugin { reject: "west" })]);
        let clusters = vec![cluster("east"), cluster("west"), cluster("north")];
        let output = run(&framework, &PlacementPolicy::PickAll, &clusters);

        assert_eq!(output.selected_count(), 2);
        assert!(output.satisfied);
        let rejected: Vec<_> = output.decisions.iter().filter(|d| !d.selected).collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].cluster_name, "west");
        assert_eq!(rejected[0].reason, "rejected by test");
    }

    #[test]
    fn test_pick_n_underfill_reports_unsatisfied() {
        let framework = SchedulerFramework::with_plugins(vec![]);
        let clusters = vec![cluster("a"), cluster("b"), cluster("c")];
        let policy = PlacementPolicy::PickN {
            n: 5,
            affinity: None,
            topology_spread: Vec::new(),
            tolerations: Vec::new(),
        };
        let output = run(&framework, &policy, &clusters);
        assert_eq!(output.selected_count(), 3);
        assert!(!output.satisfied);
    }

    #[test]
    fn test_pick_fixed_exact_intersection() {
        let framework = SchedulerFramework::with_plugins(vec![]);
        let clusters = vec![cluster("a"), cluster("b")];
        let policy = PlacementPolicy::PickFixed {
            cluster_names: vec!["a".to_string(), "absent".to_string()],
        };
        let output = run(&framework, &policy, &clusters);

        assert_eq!(output.selected_count(), 1);
        assert!(!output.satisfied);
        let absent = output
            .decisions
            .iter()
            .find(|d| d.cluster_name == "absent")
            .unwrap();
        assert!(!absent.selected);
        // Feasible clusters outside the user list are not reported.
        assert_eq!(output.decisions.len(), 2);
    }

    #[test]
    fn test_deterministic_tie_break_on_name() {
        let framework = SchedulerFramework::with_plugins(vec![]);
        let clusters = vec![cluster("zeta"), cluster("alpha"), cluster("mid")];
        let policy = PlacementPolicy::PickN {
            n: 2,
            affinity: None,
            topology_spread: Vec::new(),
            tolerations: Vec::new(),
        };

        let first = run(&framework, &policy, &clusters);
        let second = run(&framework, &policy, &clusters);
        let names =
            |o: &SchedulingOutput| o.decisions.iter().map(|d| d.cluster_name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), names(&second));

        let selected: Vec<_> = first
            .decisions
            .iter()
            .filter(|d| d.selected)
            .map(|d| d.cluster_name.as_str())
            .collect();
        assert_eq!(selected, vec!["alpha", "mid"]);
    }

    #[test]
    fn test_scores_are_clamped() {
        let framework = SchedulerFramework::with_plugins(vec![Box::new(FixedScorePlugin)]);
        let clusters = vec![cluster("aa"), cluster("bbbb")];
        let output = run(&framework, &PlacementPolicy::PickAll, &clusters);

        for decision in &output.decisions {
            let score = decision.cluster_score.unwrap();
            assert!(score.affinity_score <= MAX_PLUGIN_SCORE);
            assert!(score.affinity_score >= MIN_PLUGIN_SCORE);
        }
    }

    #[test]
    fn test_batch_caps_new_picks() {
        let framework = SchedulerFramework::with_plugins(vec![]);
        let clusters = vec![cluster("a"), cluster("b"), cluster("c"), cluster("d")];
        let policy = PlacementPolicy::PickN {
            n: 4,
            affinity: None,
            topology_spread: Vec::new(),
            tolerations: Vec::new(),
        };
        let placed = BTreeSet::new();
        let ctx = SchedulingContext {
            crp_name: "demo",
            policy: &policy,
            clusters: &clusters,
            placed_clusters: &placed,
            max_batch_per_cycle: 2,
        };
        let output = framework.schedule(&ctx).unwrap();
        assert_eq!(output.selected_count(), 2);
        assert!(!output.satisfied);
    }

    #[test]
    fn test_error_propagates_retryability() {
        struct ErrPlugin;
        impl SchedulerPlugin for ErrPlugin {
            fn name(&self) -> &'static str {
                "err"
            }
            fn pre_filter(&self, _ctx: &SchedulingContext<'_>) -> HookResult<()> {
                HookResult::Success(())
            }
            fn filter(
                &self,
                _ctx: &SchedulingContext<'_>,
                _cluster: &MemberCluster,
            ) -> HookResult<()> {
                HookResult::Error {
                    retryable: false,
                    message: "bad plugin config".to_string(),
                }
            }
        }

        let framework = SchedulerFramework::with_plugins(vec![Box::new(ErrPlugin)]);
        let clusters = vec![cluster("a")];
        let placed = BTreeSet::new();
        let ctx = SchedulingContext {
            crp_name: "demo",
            policy: &PlacementPolicy::PickAll,
            clusters: &clusters,
            placed_clusters: &placed,
            max_batch_per_cycle: 100,
        };
        let err = framework.schedule(&ctx).unwrap_err();
        assert!(!err.retryable);
    }
}
