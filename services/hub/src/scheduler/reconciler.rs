//! Scheduler reconciler: runs the framework against the latest policy
//! snapshot and writes the decisions into its status.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use fleet_api::{
    condition_types, find_condition, labels, names, reasons, BindingState,
    ClusterResourceBinding, ClusterSchedulingPolicySnapshot, Condition, ConditionStatus,
    HubObject, MemberCluster,
};
use fleet_condition::set_condition;
use fleet_store::{HubStore, StoreEvent};

use crate::controller::{with_conflict_retry, ControllerError, ControllerResult, Reconciler};
use crate::hash::ContentHash;
use crate::snapshot::latest_policy_snapshot;

use super::{SchedulerFramework, SchedulingContext};

/// The scheduler reconciler, one cycle per CRP key.
pub struct SchedulerReconciler {
    store: Arc<HubStore>,
    framework: SchedulerFramework,
    max_batch_per_cycle: u32,
    /// Context hash of the last completed cycle per snapshot, so unchanged
    /// inputs no-op.
    observed: Mutex<HashMap<String, String>>,
}

impl SchedulerReconciler {
    pub fn new(store: Arc<HubStore>, framework: SchedulerFramework, max_batch_per_cycle: u32) -> Self {
        Self {
            store,
            framework,
            max_batch_per_cycle,
            observed: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self), fields(crp = %crp_name))]
    async fn reconcile_crp(&self, crp_name: &str) -> ControllerResult<()> {
        let Some(snapshot) = latest_policy_snapshot(&self.store, crp_name).await else {
            return Ok(());
        };

        let clusters = self.store.clusters.list().await;
        let bindings = self
            .store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await;
        let placed: BTreeSet<String> = bindings
            .iter()
            .filter(|b| b.spec.state != BindingState::Unscheduled)
            .map(|b| b.spec.target_cluster.clone())
            .collect();

        let context_hash = self.context_hash(&snapshot, &clusters, &placed);
        if self.already_scheduled(&snapshot, &context_hash) {
            debug!(snapshot = %snapshot.metadata.name, "Inputs unchanged, skipping cycle");
            return Ok(());
        }

        let policy = snapshot
            .spec
            .policy
            .clone()
            .unwrap_or(fleet_api::PlacementPolicy::PickAll);
        let ctx = SchedulingContext {
            crp_name,
            policy: &policy,
            clusters: &clusters,
            placed_clusters: &placed,
            max_batch_per_cycle: self.max_batch_per_cycle,
        };

        let output = match self.framework.schedule(&ctx) {
            Ok(output) => output,
            Err(err) if err.retryable => {
                return Err(ControllerError::Transient(format!(
                    "scheduling cycle failed: {err}"
                )));
            }
            Err(err) => {
                warn!(snapshot = %snapshot.metadata.name, error = %err, "Snapshot permanently failed");
                self.write_status(&snapshot, Vec::new(), false, format!("permanently failed: {err}"))
                    .await?;
                self.remember(&snapshot, context_hash);
                return Ok(());
            }
        };

        info!(
            snapshot = %snapshot.metadata.name,
            selected = output.selected_count(),
            decisions = output.decisions.len(),
            satisfied = output.satisfied,
            "Scheduling cycle complete"
        );

        self.write_status(&snapshot, output.decisions, output.satisfied, output.detail)
            .await?;
        self.remember(&snapshot, context_hash);
        Ok(())
    }

    fn context_hash(
        &self,
        snapshot: &ClusterSchedulingPolicySnapshot,
        clusters: &[MemberCluster],
        placed: &BTreeSet<String>,
    ) -> String {
        let inventory: Vec<serde_json::Value> = clusters
            .iter()
            .map(|c| {
                json!({
                    "name": c.metadata.name,
                    "labels": c.metadata.labels,
                    "taints": c.spec.taints,
                    "joined": c.status.joined,
                })
            })
            .collect();
        ContentHash::of_value(&json!({
            "snapshot": snapshot.metadata.name,
            "policy_hash": snapshot.spec.policy_hash,
            "inventory": inventory,
            "placed": placed,
        }))
        .as_str()
        .to_string()
    }

    fn already_scheduled(
        &self,
        snapshot: &ClusterSchedulingPolicySnapshot,
        context_hash: &str,
    ) -> bool {
        let fresh = find_condition(
            &snapshot.status.conditions,
            condition_types::POLICY_SNAPSHOT_SCHEDULED,
        )
        .is_some_and(|c| c.observed_generation >= snapshot.metadata.generation);
        fresh
            && self
                .observed
                .lock()
                .expect("observed lock")
                .get(&snapshot.metadata.name)
                .is_some_and(|h| h == context_hash)
    }

    fn remember(&self, snapshot: &ClusterSchedulingPolicySnapshot, context_hash: String) {
        self.observed
            .lock()
            .expect("observed lock")
            .insert(snapshot.metadata.name.clone(), context_hash);
    }

    async fn write_status(
        &self,
        snapshot: &ClusterSchedulingPolicySnapshot,
        decisions: Vec<fleet_api::ClusterDecision>,
        satisfied: bool,
        detail: String,
    ) -> ControllerResult<()> {
        let store = &self.store;
        let name = snapshot.metadata.name.clone();
        let crp_generation = snapshot
            .metadata
            .annotations
            .get(labels::CRP_GENERATION_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        with_conflict_retry(|| {
            let decisions = decisions.clone();
            let detail = detail.clone();
            let name = name.clone();
            async move {
                let Some(mut snapshot) = store.policy_snapshots.get(&name).await else {
                    return Ok(());
                };
                snapshot.status.cluster_decisions = decisions;
                snapshot.status.observed_crp_generation = crp_generation;

                let (status, reason) = if satisfied {
                    (ConditionStatus::True, reasons::FULLY_SCHEDULED)
                } else {
                    (ConditionStatus::False, reasons::NOT_FULLY_SCHEDULED)
                };
                let condition = Condition::new(
                    condition_types::POLICY_SNAPSHOT_SCHEDULED,
                    status,
                    reason,
                    snapshot.metadata.generation,
                )
                .with_message(detail);
                set_condition(&mut snapshot.status.conditions, condition);

                store.policy_snapshots.update_status(snapshot).await.map(|_| ())
            }
        })
        .await
    }

    async fn crp_keys_of_event(&self, event: &StoreEvent) -> Vec<String> {
        match event.kind {
            ClusterSchedulingPolicySnapshot::KIND => {
                if let Some(snapshot) = self.store.policy_snapshots.get(&event.key).await {
                    if let Some(crp) = snapshot.metadata.labels.get(labels::CRP_TRACKING_LABEL) {
                        return vec![crp.clone()];
                    }
                }
                names::crp_of_policy_snapshot(&event.key)
                    .map(|c| vec![c.to_string()])
                    .unwrap_or_default()
            }
            ClusterResourceBinding::KIND => {
                if let Some(binding) = self.store.bindings.get(&event.key).await {
                    if let Some(crp) = binding.metadata.labels.get(labels::CRP_TRACKING_LABEL) {
                        return vec![crp.clone()];
                    }
                }
                // A deleted binding frees a PickN slot; reschedule broadly.
                self.resync_keys().await
            }
            MemberCluster::KIND => self.resync_keys().await,
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Reconciler for SchedulerReconciler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn map_event(&self, event: &StoreEvent) -> Vec<String> {
        self.crp_keys_of_event(event).await
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
