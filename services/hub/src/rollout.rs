//! Rollout controller: converges the binding set onto the latest scheduling
//! decisions and admits bindings to the latest resource snapshot under the
//! surge and unavailability budgets.
//!
//! Binding lifecycle:
//!
//! ```text
//! Scheduled --(admit)--> Bound --(target cluster lost)--> Unscheduled
//!               ^                                              |
//!               +---------------(rescheduled)------------------+
//! ```
//!
//! Unscheduled bindings are deleted once their Works are gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use fleet_api::{
    condition_types, find_condition, labels, names, reasons, BindingSpec, BindingState,
    ClusterResourceBinding, ClusterResourcePlacement, ClusterResourceSnapshot,
    ClusterSchedulingPolicySnapshot, Condition, ConditionStatus, HubObject, IntOrPercent,
    ObjectMeta, RolloutStrategy, Rounding, Work,
};
use fleet_condition::set_condition;
use fleet_store::{HubStore, StoreError, StoreEvent};

use crate::controller::{with_conflict_retry, ControllerResult, Reconciler};
use crate::snapshot::{latest_policy_snapshot, latest_resource_master};

/// Resolve a maxUnavailable value: percentages round down, and anything
/// that resolves to zero is floored to one unless it was the literal zero.
fn resolve_max_unavailable(value: &IntOrPercent, target: u32) -> u32 {
    let resolved = value.resolve(target, Rounding::Down);
    if resolved == 0 && !value.is_explicit_zero() {
        1
    } else {
        resolved
    }
}

/// Resolve a maxSurge value: percentages round up.
fn resolve_max_surge(value: &IntOrPercent, target: u32) -> u32 {
    value.resolve(target, Rounding::Up)
}

/// The rollout reconciler, one pass per CRP key.
pub struct RolloutReconciler {
    store: Arc<HubStore>,
    stuck_threshold: Duration,
    /// Last time any binding of a CRP made progress.
    last_progress: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
}

impl RolloutReconciler {
    pub fn new(store: Arc<HubStore>, stuck_threshold: Duration) -> Self {
        Self {
            store,
            stuck_threshold,
            last_progress: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self), fields(crp = %crp_name))]
    async fn reconcile_crp(&self, crp_name: &str) -> ControllerResult<()> {
        let Some(crp) = self.store.placements.get(crp_name).await else {
            return Ok(());
        };
        if crp.metadata.is_deleting() {
            return Ok(());
        }
        let Some(snapshot) = latest_policy_snapshot(&self.store, crp_name).await else {
            return Ok(());
        };

        let selected: Vec<String> = snapshot
            .selected_clusters()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut progressed = self.sync_bindings(&crp, &snapshot, &selected).await?;

        if let Some(master) = latest_resource_master(&self.store, crp_name).await {
            progressed |= self.admit(&crp, &snapshot, &master, &selected).await?;
        }

        self.track_progress(crp_name, progressed);
        Ok(())
    }

    /// Converge the binding set onto the decision set.
    async fn sync_bindings(
        &self,
        crp: &ClusterResourcePlacement,
        snapshot: &ClusterSchedulingPolicySnapshot,
        selected: &[String],
    ) -> ControllerResult<bool> {
        let crp_name = &crp.metadata.name;
        let bindings = self
            .store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await;
        let mut progressed = false;

        for cluster in selected {
            let existing = bindings.iter().find(|b| &b.spec.target_cluster == cluster);
            match existing {
                None => {
                    let decision = snapshot
                        .status
                        .cluster_decisions
                        .iter()
                        .find(|d| &d.cluster_name == cluster)
                        .cloned();
                    let mut metadata = ObjectMeta::named(format!("{crp_name}-{cluster}"));
                    metadata
                        .labels
                        .insert(labels::CRP_TRACKING_LABEL.to_string(), crp_name.clone());
                    let binding = ClusterResourceBinding {
                        metadata,
                        spec: BindingSpec {
                            state: BindingState::Scheduled,
                            target_cluster: cluster.clone(),
                            resource_snapshot_name: String::new(),
                            policy_snapshot_name: snapshot.metadata.name.clone(),
                            cluster_decision: decision,
                            overrides: crp.spec.overrides.clone(),
                        },
                        status: Default::default(),
                    };
                    match self.store.bindings.create(binding).await {
                        Ok(_) => {
                            info!(crp = %crp_name, cluster = %cluster, "Created binding");
                            progressed = true;
                        }
                        Err(StoreError::AlreadyExists { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(binding) if binding.spec.state == BindingState::Unscheduled => {
                    // The cluster was selected again while draining.
                    self.mutate_binding(&binding.metadata.store_key(), |b| {
                        b.spec.state = BindingState::Scheduled;
                        b.spec.policy_snapshot_name = snapshot.metadata.name.clone();
                    })
                    .await?;
                    info!(crp = %crp_name, cluster = %cluster, "Rescheduled draining binding");
                    progressed = true;
                }
                Some(_) => {}
            }
        }

        for binding in &bindings {
            let still_selected = selected.contains(&binding.spec.target_cluster);
            if !still_selected && binding.spec.state != BindingState::Unscheduled {
                self.mutate_binding(&binding.metadata.store_key(), |b| {
                    b.spec.state = BindingState::Unscheduled;
                })
                .await?;
                info!(
                    crp = %crp_name,
                    cluster = %binding.spec.target_cluster,
                    "Unscheduled binding for deselected cluster"
                );
                progressed = true;
            }

            if !still_selected && binding.spec.state == BindingState::Unscheduled {
                let works = self
                    .store
                    .works
                    .list_by_label(labels::PARENT_BINDING_LABEL, &binding.metadata.name)
                    .await;
                if works.is_empty() {
                    match self.store.bindings.delete(&binding.metadata.store_key()).await {
                        Ok(()) => {
                            info!(crp = %crp_name, binding = %binding.metadata.name, "Deleted drained binding");
                            progressed = true;
                        }
                        Err(StoreError::NotFound { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(progressed)
    }

    /// Admit waiting bindings to the latest resource snapshot under the
    /// rollout budgets.
    async fn admit(
        &self,
        crp: &ClusterResourcePlacement,
        snapshot: &ClusterSchedulingPolicySnapshot,
        master: &ClusterResourceSnapshot,
        selected: &[String],
    ) -> ControllerResult<bool> {
        let crp_name = &crp.metadata.name;
        let RolloutStrategy::RollingUpdate {
            max_surge,
            max_unavailable,
            unavailable_period_seconds,
        } = &crp.spec.strategy
        else {
            // External rollout: the hub never promotes bindings on its own.
            return Ok(false);
        };

        let target = selected.len() as u32;
        if target == 0 {
            // A shrink to zero leaves percentage budgets unresolved; no
            // advancement until the target is re-established.
            return Ok(false);
        }
        let max_unavailable = resolve_max_unavailable(max_unavailable, target);
        let max_surge = resolve_max_surge(max_surge, target);
        let dwell = chrono::Duration::seconds(*unavailable_period_seconds);

        let bindings = self
            .store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await;
        let total = bindings.len() as u32;

        let now = Utc::now();
        let mut unavailable = 0u32;
        let mut waiting: Vec<&ClusterResourceBinding> = Vec::new();

        for binding in &bindings {
            match binding.spec.state {
                BindingState::Unscheduled => {}
                BindingState::Scheduled => waiting.push(binding),
                BindingState::Bound => {
                    let available = find_condition(
                        &binding.status.conditions,
                        condition_types::BINDING_AVAILABLE,
                    )
                    .filter(|c| c.observed_generation >= binding.metadata.generation);

                    match available {
                        Some(c) if c.is_true() => {
                            // Recently rolled bindings still count against
                            // the budget to bound the blast radius.
                            if now < c.last_transition_time + dwell {
                                unavailable += 1;
                            }
                        }
                        _ => unavailable += 1,
                    }

                    if binding.spec.resource_snapshot_name != master.metadata.name {
                        waiting.push(binding);
                    }
                }
            }
        }

        waiting.sort_by(|a, b| a.spec.target_cluster.cmp(&b.spec.target_cluster));

        let mut in_flight = 0u32;
        let mut progressed = false;
        for binding in waiting {
            let within_unavailable = unavailable + in_flight < max_unavailable;
            let within_surge = total <= target + max_surge;
            if within_unavailable && within_surge {
                self.promote(binding, snapshot, master).await?;
                in_flight += 1;
                progressed = true;
            }
            // Blocked bindings keep their current conditions: one still
            // serving the previous snapshot stays Available and must not be
            // double-counted against the budget. The aggregator reports the
            // pending state on the placement status.
        }

        debug!(
            crp = %crp_name,
            target,
            total,
            unavailable,
            promoted = in_flight,
            max_unavailable,
            max_surge,
            "Rollout admission pass"
        );
        Ok(progressed)
    }

    /// Bind to the latest snapshot and mark the rollout started.
    async fn promote(
        &self,
        binding: &ClusterResourceBinding,
        snapshot: &ClusterSchedulingPolicySnapshot,
        master: &ClusterResourceSnapshot,
    ) -> ControllerResult<()> {
        let key = binding.metadata.store_key();
        let updated = self
            .mutate_binding(&key, |b| {
                b.spec.state = BindingState::Bound;
                b.spec.resource_snapshot_name = master.metadata.name.clone();
                b.spec.policy_snapshot_name = snapshot.metadata.name.clone();
            })
            .await?;
        info!(
            binding = %binding.metadata.name,
            snapshot = %master.metadata.name,
            "Promoted binding to latest resource snapshot"
        );

        let generation = updated
            .as_ref()
            .map(|b| b.metadata.generation)
            .unwrap_or(binding.metadata.generation);
        self.mark_rollout_started(&key, generation).await
    }

    async fn mark_rollout_started(&self, key: &str, generation: i64) -> ControllerResult<()> {
        let store = &self.store;
        with_conflict_retry(|| async move {
            let Some(mut binding) = store.bindings.get(key).await else {
                return Ok(());
            };
            let condition = Condition::new(
                condition_types::BINDING_ROLLOUT_STARTED,
                ConditionStatus::True,
                reasons::ROLLOUT_STARTED,
                generation,
            );
            set_condition(&mut binding.status.conditions, condition);
            store.bindings.update_status(binding).await.map(|_| ())
        })
        .await
    }

    async fn mutate_binding(
        &self,
        key: &str,
        mutate: impl Fn(&mut ClusterResourceBinding) + Send + Sync,
    ) -> ControllerResult<Option<ClusterResourceBinding>> {
        let store = &self.store;
        let mutate = &mutate;
        with_conflict_retry(|| async move {
            let Some(mut binding) = store.bindings.get(key).await else {
                return Ok(None);
            };
            mutate(&mut binding);
            store.bindings.update(binding).await.map(Some)
        })
        .await
    }

    fn track_progress(&self, crp_name: &str, progressed: bool) {
        let mut last = self.last_progress.lock().expect("progress lock");
        let now = Utc::now();
        let entry = last.entry(crp_name.to_string()).or_insert(now);
        if progressed {
            *entry = now;
        } else if now.signed_duration_since(*entry)
            > chrono::Duration::from_std(self.stuck_threshold).unwrap_or(chrono::Duration::MAX)
        {
            warn!(crp = %crp_name, "Rollout has made no progress within the stuck threshold");
        }
    }
}

#[async_trait]
impl Reconciler for RolloutReconciler {
    fn name(&self) -> &'static str {
        "rollout"
    }

    async fn map_event(&self, event: &StoreEvent) -> Vec<String> {
        let crp = match event.kind {
            ClusterResourcePlacement::KIND => Some(event.key.clone()),
            ClusterSchedulingPolicySnapshot::KIND => {
                match self.store.policy_snapshots.get(&event.key).await {
                    Some(s) => s.metadata.labels.get(labels::CRP_TRACKING_LABEL).cloned(),
                    None => names::crp_of_policy_snapshot(&event.key).map(str::to_string),
                }
            }
            ClusterResourceSnapshot::KIND => {
                match self.store.resource_snapshots.get(&event.key).await {
                    Some(s) => s.metadata.labels.get(labels::CRP_TRACKING_LABEL).cloned(),
                    None => names::crp_of_resource_snapshot(&event.key).map(str::to_string),
                }
            }
            ClusterResourceBinding::KIND => match self.store.bindings.get(&event.key).await {
                Some(b) => b.metadata.labels.get(labels::CRP_TRACKING_LABEL).cloned(),
                None => None,
            },
            Work::KIND => match self.store.works.get(&event.key).await {
                Some(w) => w.metadata.labels.get(labels::CRP_TRACKING_LABEL).cloned(),
                None => event
                    .key
                    .rsplit_once('/')
                    .and_then(|(_, name)| names::crp_of_work_name(name))
                    .map(str::to_string),
            },
            _ => None,
        };
        crp.map(|c| vec![c]).unwrap_or_default()
    }

    async fn resync_keys(&self) -> Vec<String> {
        self.store
            .placements
            .list()
            .await
            .into_iter()
            .map(|c| c.metadata.store_key())
            .collect()
    }

    async fn reconcile(&self, key: &str) -> ControllerResult<()> {
        self.reconcile_crp(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use fleet_api::{
        ClusterDecision, PlacementSpec, PolicySnapshotSpec, PolicySnapshotStatus,
        ResourceSnapshotSpec,
    };

    async fn seed_crp(store: &HubStore, name: &str, strategy: RolloutStrategy) {
        store
            .placements
            .create(ClusterResourcePlacement {
                metadata: ObjectMeta::named(name),
                spec: PlacementSpec {
                    strategy,
                    ..Default::default()
                },
                status: Default::default(),
            })
            .await
            .unwrap();
    }

    async fn seed_decisions(store: &HubStore, crp: &str, clusters: &[&str]) {
        let mut metadata = ObjectMeta::named(names::policy_snapshot_name(crp, 0));
        metadata
            .labels
            .insert(labels::CRP_TRACKING_LABEL.to_string(), crp.to_string());
        metadata.labels.insert(
            labels::IS_LATEST_SNAPSHOT_LABEL.to_string(),
            "true".to_string(),
        );
        store
            .policy_snapshots
            .create(ClusterSchedulingPolicySnapshot {
                metadata,
                spec: PolicySnapshotSpec::default(),
                status: PolicySnapshotStatus {
                    observed_crp_generation: 1,
                    cluster_decisions: clusters
                        .iter()
                        .map(|c| ClusterDecision {
                            cluster_name: c.to_string(),
                            selected: true,
                            cluster_score: None,
                            reason: "picked by scheduling policy".to_string(),
                        })
                        .collect(),
                    conditions: Vec::new(),
                },
            })
            .await
            .unwrap();
    }

    async fn seed_master(store: &HubStore, crp: &str, index: i64) {
        let mut metadata = ObjectMeta::named(names::resource_snapshot_master_name(crp, index));
        metadata
            .labels
            .insert(labels::CRP_TRACKING_LABEL.to_string(), crp.to_string());
        metadata.labels.insert(
            labels::RESOURCE_INDEX_LABEL.to_string(),
            index.to_string(),
        );
        metadata.labels.insert(
            labels::IS_LATEST_SNAPSHOT_LABEL.to_string(),
            "true".to_string(),
        );
        metadata.annotations.insert(
            labels::NUMBER_OF_RESOURCE_SNAPSHOTS_ANNOTATION.to_string(),
            "1".to_string(),
        );
        store
            .resource_snapshots
            .create(ClusterResourceSnapshot {
                metadata,
                spec: ResourceSnapshotSpec::default(),
            })
            .await
            .unwrap();
    }

    async fn mark_available(store: &HubStore, key: &str, transition_offset: ChronoDuration) {
        let mut binding = store.bindings.get(key).await.unwrap();
        let mut condition = Condition::new(
            condition_types::BINDING_AVAILABLE,
            ConditionStatus::True,
            reasons::ALL_WORK_AVAILABLE,
            binding.metadata.generation,
        );
        condition.last_transition_time = Utc::now() - transition_offset;
        binding.status.conditions = vec![condition];
        store.bindings.update_status(binding).await.unwrap();
    }

    fn strategy(max_surge: u32, max_unavailable: u32, dwell: i64) -> RolloutStrategy {
        RolloutStrategy::RollingUpdate {
            max_surge: IntOrPercent::Int(max_surge),
            max_unavailable: IntOrPercent::Int(max_unavailable),
            unavailable_period_seconds: dwell,
        }
    }

    fn reconciler(store: Arc<HubStore>) -> RolloutReconciler {
        RolloutReconciler::new(store, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_creates_bindings_for_selected_clusters() {
        let store = HubStore::new();
        seed_crp(&store, "demo", strategy(1, 1, 0)).await;
        seed_decisions(&store, "demo", &["east", "west"]).await;

        reconciler(store.clone()).reconcile("demo").await.unwrap();

        let bindings = store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, "demo")
            .await;
        assert_eq!(bindings.len(), 2);
        assert!(bindings
            .iter()
            .all(|b| b.spec.state == BindingState::Scheduled));
    }

    #[tokio::test]
    async fn test_promotes_within_unavailability_budget() {
        let store = HubStore::new();
        seed_crp(&store, "demo", strategy(0, 1, 0)).await;
        seed_decisions(&store, "demo", &["a", "b", "c"]).await;
        seed_master(&store, "demo", 0).await;

        let rollout = reconciler(store.clone());
        rollout.reconcile("demo").await.unwrap();

        let bindings = store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, "demo")
            .await;
        let bound: Vec<_> = bindings
            .iter()
            .filter(|b| b.spec.state == BindingState::Bound)
            .collect();
        assert_eq!(bound.len(), 1);
        // Lexically first cluster goes first.
        assert_eq!(bound[0].spec.target_cluster, "a");

        let blocked: Vec<_> = bindings
            .iter()
            .filter(|b| b.spec.state == BindingState::Scheduled)
            .collect();
        assert_eq!(blocked.len(), 2);
        // Blocked bindings keep their conditions untouched; the pending
        // state is reported on the placement status, not the binding.
        for binding in blocked {
            assert!(find_condition(
                &binding.status.conditions,
                condition_types::BINDING_ROLLOUT_STARTED,
            )
            .is_none());
        }
    }

    #[tokio::test]
    async fn test_wave_advances_as_bindings_become_available() {
        let store = HubStore::new();
        seed_crp(&store, "demo", strategy(0, 1, 60)).await;
        seed_decisions(&store, "demo", &["a", "b"]).await;
        seed_master(&store, "demo", 0).await;

        let rollout = reconciler(store.clone());
        rollout.reconcile("demo").await.unwrap();

        // "a" bound; report it available past the dwell window.
        mark_available(&store, "demo-a", ChronoDuration::seconds(120)).await;
        rollout.reconcile("demo").await.unwrap();

        let b = store.bindings.get("demo-b").await.unwrap();
        assert_eq!(b.spec.state, BindingState::Bound);
    }

    #[tokio::test]
    async fn test_dwell_window_counts_against_budget() {
        let store = HubStore::new();
        seed_crp(&store, "demo", strategy(0, 1, 600)).await;
        seed_decisions(&store, "demo", &["a", "b"]).await;
        seed_master(&store, "demo", 0).await;

        let rollout = reconciler(store.clone());
        rollout.reconcile("demo").await.unwrap();

        // "a" is available but transitioned just now; it dwells.
        mark_available(&store, "demo-a", ChronoDuration::seconds(0)).await;
        rollout.reconcile("demo").await.unwrap();

        let b = store.bindings.get("demo-b").await.unwrap();
        assert_eq!(b.spec.state, BindingState::Scheduled);
    }

    #[tokio::test]
    async fn test_explicit_zero_max_unavailable_blocks_all() {
        let store = HubStore::new();
        seed_crp(&store, "demo", strategy(1, 0, 0)).await;
        seed_decisions(&store, "demo", &["a"]).await;
        seed_master(&store, "demo", 0).await;

        reconciler(store.clone()).reconcile("demo").await.unwrap();

        let a = store.bindings.get("demo-a").await.unwrap();
        assert_eq!(a.spec.state, BindingState::Scheduled);
    }

    #[tokio::test]
    async fn test_deselected_cluster_drains_and_binding_is_deleted() {
        let store = HubStore::new();
        seed_crp(&store, "demo", strategy(1, 1, 0)).await;
        seed_decisions(&store, "demo", &["a", "b"]).await;
        seed_master(&store, "demo", 0).await;

        let rollout = reconciler(store.clone());
        rollout.reconcile("demo").await.unwrap();

        // Reschedule with only "a" selected.
        let mut snapshot = store.policy_snapshots.get("demo-0").await.unwrap();
        snapshot.status.cluster_decisions.retain(|d| d.cluster_name == "a");
        store.policy_snapshots.update_status(snapshot).await.unwrap();

        rollout.reconcile("demo").await.unwrap();
        let b = store.bindings.get("demo-b").await.unwrap();
        assert_eq!(b.spec.state, BindingState::Unscheduled);

        // No works exist for it, so the next pass deletes it.
        rollout.reconcile("demo").await.unwrap();
        assert!(store.bindings.get("demo-b").await.is_none());
    }

    #[tokio::test]
    async fn test_external_strategy_never_promotes() {
        let store = HubStore::new();
        seed_crp(&store, "demo", RolloutStrategy::External).await;
        seed_decisions(&store, "demo", &["a"]).await;
        seed_master(&store, "demo", 0).await;

        reconciler(store.clone()).reconcile("demo").await.unwrap();

        let a = store.bindings.get("demo-a").await.unwrap();
        assert_eq!(a.spec.state, BindingState::Scheduled);
    }

    #[test]
    fn test_budget_resolution_rules() {
        // 25% of 3 rounds down to 0, floored to 1.
        assert_eq!(resolve_max_unavailable(&IntOrPercent::Percent(25), 3), 1);
        // Explicit zero stays zero.
        assert_eq!(resolve_max_unavailable(&IntOrPercent::Int(0), 3), 0);
        // Surge rounds up.
        assert_eq!(resolve_max_surge(&IntOrPercent::Percent(25), 3), 1);
        assert_eq!(resolve_max_surge(&IntOrPercent::Percent(50), 4), 2);
    }
}
