//! Condition algebra for the six-stage placement chain.
//!
//! This library provides the pure rules for ranking, combining, and
//! propagating typed conditions across the nested levels of a placement
//! (CRP, per-cluster placement, binding, Work). Key concepts:
//!
//! - **Rank**: every stage has a fixed position in the chain; a failure at a
//!   lower rank masks everything above it.
//! - **Rollup**: a parent condition at rank r is a pure function of its
//!   children's conditions at rank r and the parent generation.
//! - **Monotonicity**: recomputing a condition preserves its transition time
//!   unless (status, reason) actually changed.
//!
//! # Invariants
//!
//! - `observed_generation` never exceeds the owning object's generation
//! - A child condition only counts toward a rollup when it is fresh, i.e.
//!   `observed_generation >= child generation`
//! - If the condition at rank r is False, conditions at rank > r are absent

use fleet_api::{condition_types, reasons, Condition, ConditionStatus};

/// The six stages of the placement chain, in rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PlacementStage {
    Scheduled = 0,
    RolloutStarted = 1,
    Overridden = 2,
    WorkSynchronized = 3,
    Applied = 4,
    Available = 5,
}

impl PlacementStage {
    /// All stages in rank order.
    pub const ALL: [PlacementStage; 6] = [
        PlacementStage::Scheduled,
        PlacementStage::RolloutStarted,
        PlacementStage::Overridden,
        PlacementStage::WorkSynchronized,
        PlacementStage::Applied,
        PlacementStage::Available,
    ];

    pub fn rank(self) -> usize {
        self as usize
    }
}

/// The level of the chain a condition list belongs to. Each level uses its
/// own wire strings for the same stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLevel {
    /// Top-level CRP conditions (`ClusterResourcePlacement...`).
    Crp,
    /// Per-cluster placement statuses (`Resource...`).
    ClusterPlacement,
    /// Binding conditions. There is no Scheduled stage at this level: a
    /// binding exists because its cluster was selected.
    Binding,
}

impl ChainLevel {
    /// Wire string for a stage at this level, when the stage exists here.
    pub fn condition_type(self, stage: PlacementStage) -> Option<&'static str> {
        use PlacementStage::*;
        let s = match self {
            ChainLevel::Crp => match stage {
                Scheduled => condition_types::CRP_SCHEDULED,
                RolloutStarted => condition_types::CRP_ROLLOUT_STARTED,
                Overridden => condition_types::CRP_OVERRIDDEN,
                WorkSynchronized => condition_types::CRP_WORK_SYNCHRONIZED,
                Applied => condition_types::CRP_APPLIED,
                Available => condition_types::CRP_AVAILABLE,
            },
            ChainLevel::ClusterPlacement => match stage {
                Scheduled => condition_types::RESOURCE_SCHEDULED,
                RolloutStarted => condition_types::RESOURCE_ROLLOUT_STARTED,
                Overridden => condition_types::RESOURCE_OVERRIDDEN,
                WorkSynchronized => condition_types::RESOURCE_WORK_SYNCHRONIZED,
                Applied => condition_types::RESOURCE_APPLIED,
                Available => condition_types::RESOURCE_AVAILABLE,
            },
            ChainLevel::Binding => match stage {
                Scheduled => return None,
                RolloutStarted => condition_types::BINDING_ROLLOUT_STARTED,
                Overridden => condition_types::BINDING_OVERRIDDEN,
                WorkSynchronized => condition_types::BINDING_WORK_SYNCHRONIZED,
                Applied => condition_types::BINDING_APPLIED,
                Available => condition_types::BINDING_AVAILABLE,
            },
        };
        Some(s)
    }

    /// The stage a wire string belongs to at this level.
    pub fn stage_of(self, condition_type: &str) -> Option<PlacementStage> {
        PlacementStage::ALL
            .into_iter()
            .find(|s| self.condition_type(*s) == Some(condition_type))
    }
}

/// Merge a recomputed condition into a condition list.
///
/// Preserves `last_transition_time` when `(status, reason)` are unchanged,
/// and refuses to regress `observed_generation`.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        Some(existing) => {
            if new.observed_generation < existing.observed_generation {
                return;
            }
            let transition_time = if existing.status == new.status && existing.reason == new.reason
            {
                existing.last_transition_time
            } else {
                new.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..new
            };
        }
        None => conditions.push(new),
    }
}

/// Drop every condition ranked strictly above the first False in the chain.
///
/// Lower-rank failures mask higher-rank reports; a chain that reads
/// `Scheduled=False, Applied=True` is a contract violation.
pub fn truncate_after_failure(conditions: &mut Vec<Condition>, level: ChainLevel) {
    let failed_rank = conditions
        .iter()
        .filter(|c| c.is_false())
        .filter_map(|c| level.stage_of(&c.condition_type))
        .map(PlacementStage::rank)
        .min();

    if let Some(rank) = failed_rank {
        conditions.retain(|c| match level.stage_of(&c.condition_type) {
            Some(stage) => stage.rank() <= rank,
            None => true,
        });
    }
}

/// One child's report into a rollup: the condition found at the rolled-up
/// stage (if any) and the child's own generation, used for freshness.
#[derive(Debug, Clone)]
pub struct ChildReport<'a> {
    pub name: &'a str,
    pub condition: Option<&'a Condition>,
    pub generation: i64,
}

impl<'a> ChildReport<'a> {
    /// Fresh means the condition reports on the child's current generation.
    fn is_fresh(&self) -> bool {
        self.condition
            .is_some_and(|c| c.observed_generation >= self.generation)
    }
}

/// Outcome of combining N children at one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupVerdict {
    /// Every child is fresh and True. `untrackable` is set when any child
    /// reported True with the not-trackable reason.
    AllTrue { untrackable: bool },
    /// At least one child is False.
    AnyFalse { offender: String },
    /// No child is False, but some child is Unknown, stale, or missing the
    /// condition entirely.
    Pending { offender: String },
}

/// Combine children at one rank: all-true iff every child is fresh and
/// True; any-false if some child is False; otherwise pending. How a pending
/// verdict reads on the wire depends on the rollup kind, see
/// [`rollup_condition`].
pub fn rollup(children: &[ChildReport<'_>]) -> RollupVerdict {
    let mut untrackable = false;
    let mut pending: Option<&str> = None;

    for child in children {
        match child.condition {
            Some(c) if c.is_false() => {
                return RollupVerdict::AnyFalse {
                    offender: child.name.to_string(),
                }
            }
            Some(c) if c.is_true() && child.is_fresh() => {
                if c.reason == reasons::WORK_NOT_TRACKABLE {
                    untrackable = true;
                }
            }
            _ => pending = pending.or(Some(child.name)),
        }
    }

    match pending {
        Some(name) => RollupVerdict::Pending {
            offender: name.to_string(),
        },
        None => RollupVerdict::AllTrue { untrackable },
    }
}

/// Fixed reason table for rollups onto a binding (children are Works).
fn work_rollup_reason(stage: PlacementStage, verdict: &RollupVerdict) -> &'static str {
    use PlacementStage::*;
    use RollupVerdict::*;
    match (stage, verdict) {
        (WorkSynchronized, AllTrue { .. }) => reasons::ALL_WORK_SYNCED,
        (WorkSynchronized, AnyFalse { .. }) => reasons::SYNC_WORK_FAILED,
        (WorkSynchronized, Pending { .. }) => reasons::WORK_NOT_SYNCHRONIZED_YET,
        (Applied, AllTrue { .. }) => reasons::ALL_WORK_APPLIED,
        (Applied, _) => reasons::WORK_NOT_APPLIED,
        (Available, AllTrue { untrackable: true }) => reasons::WORK_NOT_TRACKABLE,
        (Available, AllTrue { .. }) => reasons::ALL_WORK_AVAILABLE,
        (Available, _) => reasons::WORK_NOT_AVAILABLE,
        // Works report nothing below WorkSynchronized.
        (_, AllTrue { .. }) => reasons::ALL_WORK_SYNCED,
        (_, AnyFalse { .. }) => reasons::SYNC_WORK_FAILED,
        (_, Pending { .. }) => reasons::WORK_NOT_SYNCHRONIZED_YET,
    }
}

/// Fixed reason table for rollups onto a CRP or per-cluster placement
/// (children are bindings or per-cluster chains).
fn placement_rollup_reason(stage: PlacementStage, verdict: &RollupVerdict) -> &'static str {
    use PlacementStage::*;
    use RollupVerdict::*;
    match (stage, verdict) {
        (Scheduled, AllTrue { .. }) => reasons::FULLY_SCHEDULED,
        (Scheduled, _) => reasons::NOT_FULLY_SCHEDULED,
        (RolloutStarted, AllTrue { .. }) => reasons::ROLLOUT_STARTED,
        (RolloutStarted, _) => reasons::ROLLOUT_NOT_STARTED_YET,
        (Overridden, AllTrue { .. }) => reasons::OVERRIDDEN_SUCCEEDED,
        (Overridden, _) => reasons::OVERRIDDEN_FAILED,
        (WorkSynchronized, AllTrue { .. }) => reasons::WORK_SYNCHRONIZED,
        (WorkSynchronized, AnyFalse { .. }) => reasons::SYNC_WORK_FAILED,
        (WorkSynchronized, Pending { .. }) => reasons::WORK_NOT_SYNCHRONIZED_YET,
        (Applied, AllTrue { .. }) => reasons::APPLY_SUCCEEDED,
        (Applied, AnyFalse { .. }) => reasons::APPLY_FAILED,
        (Applied, Pending { .. }) => reasons::WORK_NOT_APPLIED,
        (Available, AllTrue { untrackable: true }) => reasons::WORK_NOT_TRACKABLE,
        (Available, AllTrue { .. }) => reasons::AVAILABLE,
        (Available, _) => reasons::NOT_AVAILABLE_YET,
    }
}

/// Which reason table a rollup uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupKind {
    /// Works rolling up onto their binding.
    WorksOntoBinding,
    /// Bindings or per-cluster chains rolling up onto the placement.
    PlacementChain,
}

/// Produce the parent condition of one stage from its children.
///
/// `level` selects the wire string for the parent condition; `kind` selects
/// the reason table and the status a pending verdict reads as. A Work whose
/// report is missing, stale, or Unknown has not applied its manifests, so
/// the binding-level rollup reports False for it; the placement chain keeps
/// Unknown for in-flight children. Panics never: a stage missing at the
/// level falls back to the cluster-placement string.
pub fn rollup_condition(
    stage: PlacementStage,
    level: ChainLevel,
    kind: RollupKind,
    children: &[ChildReport<'_>],
    parent_generation: i64,
) -> Condition {
    let verdict = rollup(children);

    let status = match (&verdict, kind) {
        (RollupVerdict::AllTrue { .. }, _) => ConditionStatus::True,
        (RollupVerdict::AnyFalse { .. }, _) => ConditionStatus::False,
        (RollupVerdict::Pending { .. }, RollupKind::WorksOntoBinding) => ConditionStatus::False,
        (RollupVerdict::Pending { .. }, RollupKind::PlacementChain) => ConditionStatus::Unknown,
    };

    let reason = match kind {
        RollupKind::WorksOntoBinding => work_rollup_reason(stage, &verdict),
        RollupKind::PlacementChain => placement_rollup_reason(stage, &verdict),
    };

    let condition_type = level
        .condition_type(stage)
        .or_else(|| ChainLevel::ClusterPlacement.condition_type(stage))
        .unwrap_or(condition_types::RESOURCE_SCHEDULED);

    let message = match &verdict {
        RollupVerdict::AllTrue { .. } => String::new(),
        RollupVerdict::AnyFalse { offender } => format!("{offender} reported a failure"),
        RollupVerdict::Pending { offender } => format!("waiting for {offender}"),
    };

    Condition::new(condition_type, status, reason, parent_generation).with_message(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn cond(ctype: &str, status: ConditionStatus, reason: &str, observed: i64) -> Condition {
        Condition::new(ctype, status, reason, observed)
    }

    #[test]
    fn test_stage_rank_order() {
        let ranks: Vec<usize> = PlacementStage::ALL.iter().map(|s| s.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_level_round_trips_types() {
        for level in [ChainLevel::Crp, ChainLevel::ClusterPlacement, ChainLevel::Binding] {
            for stage in PlacementStage::ALL {
                if let Some(t) = level.condition_type(stage) {
                    assert_eq!(level.stage_of(t), Some(stage));
                }
            }
        }
        // Bindings have no Scheduled stage.
        assert_eq!(
            ChainLevel::Binding.condition_type(PlacementStage::Scheduled),
            None
        );
    }

    #[test]
    fn test_set_condition_preserves_transition_time_when_unchanged() {
        let earlier = Utc::now() - Duration::seconds(300);
        let mut first = cond("Applied", ConditionStatus::True, "AllWorkApplied", 1);
        first.last_transition_time = earlier;
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            cond("Applied", ConditionStatus::True, "AllWorkApplied", 2),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].observed_generation, 2);
        assert_eq!(conditions[0].last_transition_time, earlier);
    }

    #[test]
    fn test_set_condition_bumps_transition_time_on_change() {
        let earlier = Utc::now() - Duration::seconds(300);
        let mut first = cond("Applied", ConditionStatus::True, "AllWorkApplied", 1);
        first.last_transition_time = earlier;
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            cond("Applied", ConditionStatus::False, "WorkNotApplied", 2),
        );

        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert!(conditions[0].last_transition_time > earlier);
    }

    #[test]
    fn test_set_condition_refuses_generation_regress() {
        let mut conditions = vec![cond("Applied", ConditionStatus::True, "AllWorkApplied", 5)];
        set_condition(
            &mut conditions,
            cond("Applied", ConditionStatus::False, "WorkNotApplied", 3),
        );
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[0].observed_generation, 5);
    }

    #[test]
    fn test_truncate_after_failure() {
        let level = ChainLevel::Crp;
        let mut conditions = vec![
            cond(
                condition_types::CRP_SCHEDULED,
                ConditionStatus::True,
                "FullyScheduled",
                1,
            ),
            cond(
                condition_types::CRP_ROLLOUT_STARTED,
                ConditionStatus::False,
                "RolloutNotStartedYet",
                1,
            ),
            cond(
                condition_types::CRP_APPLIED,
                ConditionStatus::True,
                "AllWorkApplied",
                1,
            ),
        ];
        truncate_after_failure(&mut conditions, level);

        let types: Vec<&str> = conditions.iter().map(|c| c.condition_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                condition_types::CRP_SCHEDULED,
                condition_types::CRP_ROLLOUT_STARTED
            ]
        );
    }

    #[test]
    fn test_rollup_all_true() {
        let c1 = cond("Applied", ConditionStatus::True, "any", 3);
        let c2 = cond("Applied", ConditionStatus::True, "any", 7);
        let children = vec![
            ChildReport {
                name: "work1",
                condition: Some(&c1),
                generation: 3,
            },
            ChildReport {
                name: "work2",
                condition: Some(&c2),
                generation: 7,
            },
        ];
        assert_eq!(
            rollup(&children),
            RollupVerdict::AllTrue { untrackable: false }
        );
    }

    #[test]
    fn test_stale_work_report_reads_not_applied() {
        // True, but not at the child's latest generation.
        let stale = cond("Applied", ConditionStatus::True, "any", 2);
        let children = vec![ChildReport {
            name: "work1",
            condition: Some(&stale),
            generation: 3,
        }];
        assert_eq!(
            rollup(&children),
            RollupVerdict::Pending {
                offender: "work1".to_string()
            }
        );

        let parent = rollup_condition(
            PlacementStage::Applied,
            ChainLevel::Binding,
            RollupKind::WorksOntoBinding,
            &children,
            1,
        );
        assert_eq!(parent.status, ConditionStatus::False);
        assert_eq!(parent.reason, reasons::WORK_NOT_APPLIED);
    }

    #[test]
    fn test_rollup_false_wins_over_pending() {
        let f = cond("Applied", ConditionStatus::False, "any", 1);
        let children = vec![
            ChildReport {
                name: "missing",
                condition: None,
                generation: 1,
            },
            ChildReport {
                name: "failed",
                condition: Some(&f),
                generation: 1,
            },
        ];
        assert_eq!(
            rollup(&children),
            RollupVerdict::AnyFalse {
                offender: "failed".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_work_applied_reads_false() {
        let u = cond("Applied", ConditionStatus::Unknown, "any", 1);
        let children = vec![ChildReport {
            name: "work1",
            condition: Some(&u),
            generation: 1,
        }];

        let parent = rollup_condition(
            PlacementStage::Applied,
            ChainLevel::Binding,
            RollupKind::WorksOntoBinding,
            &children,
            1,
        );
        assert_eq!(parent.status, ConditionStatus::False);
        assert_eq!(parent.reason, reasons::WORK_NOT_APPLIED);
    }

    #[test]
    fn test_unknown_work_available_reads_false() {
        let t = cond("Available", ConditionStatus::True, "any", 1);
        let u = cond("Available", ConditionStatus::Unknown, "any", 1);
        let children = vec![
            ChildReport {
                name: "work1",
                condition: Some(&t),
                generation: 1,
            },
            ChildReport {
                name: "work2",
                condition: Some(&u),
                generation: 1,
            },
        ];

        let parent = rollup_condition(
            PlacementStage::Available,
            ChainLevel::Binding,
            RollupKind::WorksOntoBinding,
            &children,
            1,
        );
        assert_eq!(parent.status, ConditionStatus::False);
        assert_eq!(parent.reason, reasons::WORK_NOT_AVAILABLE);
    }

    #[test]
    fn test_missing_work_report_reads_not_applied() {
        let t = cond("Applied", ConditionStatus::True, "any", 1);
        let children = vec![
            ChildReport {
                name: "work1",
                condition: Some(&t),
                generation: 1,
            },
            ChildReport {
                name: "work2",
                condition: None,
                generation: 1,
            },
        ];

        let parent = rollup_condition(
            PlacementStage::Applied,
            ChainLevel::Binding,
            RollupKind::WorksOntoBinding,
            &children,
            1,
        );
        assert_eq!(parent.status, ConditionStatus::False);
        assert_eq!(parent.reason, reasons::WORK_NOT_APPLIED);
    }

    #[test]
    fn test_pending_placement_chain_stays_unknown() {
        // The placement chain keeps Unknown for in-flight children; only
        // the work rollup hardens pending into False.
        let children = vec![ChildReport {
            name: "cluster-1",
            condition: None,
            generation: 1,
        }];

        let parent = rollup_condition(
            PlacementStage::Applied,
            ChainLevel::Crp,
            RollupKind::PlacementChain,
            &children,
            1,
        );
        assert_eq!(parent.status, ConditionStatus::Unknown);
        assert_eq!(parent.reason, reasons::WORK_NOT_APPLIED);
    }

    #[test]
    fn test_rollup_untrackable_propagates() {
        let trackable = cond("Available", ConditionStatus::True, "any", 1);
        let untrackable = cond(
            "Available",
            ConditionStatus::True,
            reasons::WORK_NOT_TRACKABLE,
            1,
        );
        let children = vec![
            ChildReport {
                name: "work1",
                condition: Some(&trackable),
                generation: 1,
            },
            ChildReport {
                name: "work2",
                condition: Some(&untrackable),
                generation: 1,
            },
        ];

        let parent = rollup_condition(
            PlacementStage::Available,
            ChainLevel::Binding,
            RollupKind::WorksOntoBinding,
            &children,
            4,
        );
        assert_eq!(parent.status, ConditionStatus::True);
        assert_eq!(parent.reason, reasons::WORK_NOT_TRACKABLE);
        assert_eq!(parent.observed_generation, 4);
    }

    #[test]
    fn test_rollup_condition_applied_reason_table() {
        let t = cond("Applied", ConditionStatus::True, "any", 1);
        let f = cond("Applied", ConditionStatus::False, "any", 1);

        let ok = rollup_condition(
            PlacementStage::Applied,
            ChainLevel::Binding,
            RollupKind::WorksOntoBinding,
            &[ChildReport {
                name: "w",
                condition: Some(&t),
                generation: 1,
            }],
            1,
        );
        assert_eq!(ok.reason, reasons::ALL_WORK_APPLIED);

        let bad = rollup_condition(
            PlacementStage::Applied,
            ChainLevel::Binding,
            RollupKind::WorksOntoBinding,
            &[ChildReport {
                name: "w",
                condition: Some(&f),
                generation: 1,
            }],
            1,
        );
        assert_eq!(bad.status, ConditionStatus::False);
        assert_eq!(bad.reason, reasons::WORK_NOT_APPLIED);
    }

    #[test]
    fn test_rollup_condition_placement_chain_reasons() {
        let t = cond("Available", ConditionStatus::True, "any", 2);
        let children = vec![ChildReport {
            name: "cluster-1",
            condition: Some(&t),
            generation: 2,
        }];
        let parent = rollup_condition(
            PlacementStage::Available,
            ChainLevel::Crp,
            RollupKind::PlacementChain,
            &children,
            9,
        );
        assert_eq!(parent.condition_type, condition_types::CRP_AVAILABLE);
        assert_eq!(parent.reason, reasons::AVAILABLE);
        assert_eq!(parent.observed_generation, 9);
    }

    #[test]
    fn test_empty_children_roll_up_true() {
        // No children means nothing to wait for; callers special-case the
        // empty-decision contract before rolling up.
        assert_eq!(rollup(&[]), RollupVerdict::AllTrue { untrackable: false });
    }
}
