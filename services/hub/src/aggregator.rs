//! Placement aggregator: rolls per-manifest and per-binding conditions up
//! through per-cluster placement statuses into the top-level CRP status,
//! and drives teardown when a CRP is deleted.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use fleet_api::{
    condition_types, find_condition, labels, names, reasons, BindingState, ClusterDecision,
    ClusterResourceBinding, ClusterResourcePlacement, ClusterResourceSnapshot,
    ClusterSchedulingPolicySnapshot, ClusterWideKey, Condition, ConditionStatus, HubObject,
    PlacementPolicy, ResourceIdentifier, ResourcePlacementStatus, Work,
};
use fleet_condition::{
    rollup_condition, set_condition, truncate_after_failure, ChainLevel, ChildReport,
    PlacementStage, RollupKind,
};
use fleet_store::{HubStore, StoreError, StoreEvent};

use crate::controller::{with_conflict_retry, ControllerResult, Reconciler};
use crate::snapshot::{content_snapshots_of, latest_policy_snapshot, latest_resource_master};

/// The placement aggregation reconciler, one pass per CRP key.
pub struct PlacementAggregator {
    store: Arc<HubStore>,
}

impl PlacementAggregator {
    pub fn new(store: Arc<HubStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(crp = %crp_name))]
    async fn reconcile_crp(&self, crp_name: &str) -> ControllerResult<()> {
        let Some(crp) = self.store.placements.get(crp_name).await else {
            return Ok(());
        };
        if crp.metadata.is_deleting() {
            return self.teardown(&crp).await;
        }

        let Some(snapshot) = latest_policy_snapshot(&self.store, crp_name).await else {
            return Ok(());
        };
        let bindings = self
            .store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await;

        let latest_master = latest_resource_master(&self.store, crp_name).await;
        let (selected_resources, observed_resource_index) =
            self.selected_resources(crp_name, latest_master.as_ref()).await?;
        let latest_master_name = latest_master.as_ref().map(|m| m.metadata.name.as_str());

        let selected: Vec<&ClusterDecision> = snapshot
            .status
            .cluster_decisions
            .iter()
            .filter(|d| d.selected)
            .collect();

        let mut selected_entries = Vec::new();
        for decision in &selected {
            let binding = bindings
                .iter()
                .find(|b| b.spec.target_cluster == decision.cluster_name);
            selected_entries.push(cluster_entry(&crp, decision, binding, latest_master_name));
        }

        let conditions = top_level_conditions(&crp, &snapshot, &selected_entries);

        let mut placement_statuses = selected_entries;
        placement_statuses.extend(unselected_entries(&crp, &snapshot));
        placement_statuses.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));

        self.write_status(
            crp_name,
            selected_resources,
            observed_resource_index,
            placement_statuses,
            conditions,
        )
        .await
    }

    /// Union of resource identifiers across the latest master's children.
    async fn selected_resources(
        &self,
        crp_name: &str,
        master: Option<&ClusterResourceSnapshot>,
    ) -> ControllerResult<(Vec<ResourceIdentifier>, String)> {
        let Some(master) = master else {
            return Ok((Vec::new(), String::new()));
        };
        let index = master
            .metadata
            .labels
            .get(labels::RESOURCE_INDEX_LABEL)
            .cloned()
            .unwrap_or_default();

        let contents = match content_snapshots_of(&self.store, crp_name, &master).await {
            Ok(contents) => contents,
            // A rotation is in flight; report the previous view for now.
            Err(_) => return Ok((Vec::new(), index)),
        };

        let mut keys: Vec<ClusterWideKey> = contents
            .iter()
            .flat_map(|s| s.spec.selected_resources.iter())
            .filter_map(ClusterWideKey::for_manifest)
            .collect();
        keys.sort();
        keys.dedup();
        Ok((keys.iter().map(ClusterWideKey::to_identifier).collect(), index))
    }

    async fn write_status(
        &self,
        crp_name: &str,
        selected_resources: Vec<ResourceIdentifier>,
        observed_resource_index: String,
        placement_statuses: Vec<ResourcePlacementStatus>,
        conditions: Vec<Condition>,
    ) -> ControllerResult<()> {
        let store = &self.store;
        let selected_resources = &selected_resources;
        let observed_resource_index = &observed_resource_index;
        let placement_statuses = &placement_statuses;
        let conditions = &conditions;

        with_conflict_retry(|| async move {
            let Some(mut crp) = store.placements.get(crp_name).await else {
                return Ok(());
            };

            crp.status.selected_resources = selected_resources.clone();
            crp.status.observed_resource_index = observed_resource_index.clone();

            // Merge per-cluster chains against the previous entries so
            // unchanged conditions keep their transition times.
            let previous = std::mem::take(&mut crp.status.placement_statuses);
            let mut merged = Vec::with_capacity(placement_statuses.len());
            for entry in placement_statuses {
                let mut entry = entry.clone();
                let old = previous.iter().find(|p| {
                    !entry.cluster_name.is_empty() && p.cluster_name == entry.cluster_name
                });
                if let Some(old) = old {
                    let fresh = std::mem::take(&mut entry.conditions);
                    let mut conditions = old.conditions.clone();
                    for condition in &fresh {
                        set_condition(&mut conditions, condition.clone());
                    }
                    // Stages the fresh chain no longer reports are dropped.
                    conditions
                        .retain(|c| fresh.iter().any(|f| f.condition_type == c.condition_type));
                    entry.conditions = conditions;
                }
                merged.push(entry);
            }
            crp.status.placement_statuses = merged;

            let mut chain = std::mem::take(&mut crp.status.conditions);
            for condition in conditions {
                set_condition(&mut chain, condition.clone());
            }
            chain.retain(|c| {
                ChainLevel::Crp.stage_of(&c.condition_type).is_none()
                    || conditions
                        .iter()
                        .any(|n| n.condition_type == c.condition_type)
            });
            truncate_after_failure(&mut chain, ChainLevel::Crp);
            crp.status.conditions = chain;

            store.placements.update_status(crp).await.map(|_| ())
        })
        .await
    }

    /// Delete bindings, Works, and snapshots, then release the deletion
    /// blocker finalizer.
    async fn teardown(&self, crp: &ClusterResourcePlacement) -> ControllerResult<()> {
        let crp_name = &crp.metadata.name;
        let mut remaining = false;

        for binding in self
            .store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await
        {
            remaining = true;
            for work in self
                .store
                .works
                .list_by_label(labels::PARENT_BINDING_LABEL, &binding.metadata.name)
                .await
            {
                match self.store.works.delete(&work.metadata.store_key()).await {
                    Ok(()) | Err(StoreError::NotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            match self.store.bindings.delete(&binding.metadata.store_key()).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        for snapshot in self
            .store
            .policy_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await
        {
            remaining = true;
            match self.store.policy_snapshots.delete(&snapshot.metadata.name).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        for snapshot in self
            .store
            .resource_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await
        {
            remaining = true;
            match self.store.resource_snapshots.delete(&snapshot.metadata.name).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if remaining {
            // Deletions emit events that requeue this CRP; release the
            // finalizer once everything is observed gone.
            return Ok(());
        }

        info!(crp = %crp_name, "Placement torn down, releasing finalizer");
        let store = &self.store;
        with_conflict_retry(|| async move {
            let Some(mut crp) = store.placements.get(crp_name).await else {
                return Ok(());
            };
            crp.metadata
                .finalizers
                .retain(|f| f != labels::CRP_CLEANUP_FINALIZER);
            store.placements.update(crp).await.map(|_| ())
        })
        .await
    }
}

/// Build the per-cluster placement entry for one selected cluster.
///
/// A binding that is not yet bound to the latest resource snapshot keeps
/// its own conditions untouched (it may still be serving the previous
/// snapshot); here the entry reports the rollout as not started.
fn cluster_entry(
    crp: &ClusterResourcePlacement,
    decision: &ClusterDecision,
    binding: Option<&ClusterResourceBinding>,
    latest_master: Option<&str>,
) -> ResourcePlacementStatus {
    let generation = crp.metadata.generation;
    let mut conditions = vec![Condition::new(
        condition_types::RESOURCE_SCHEDULED,
        ConditionStatus::True,
        reasons::SCHEDULE_SUCCEEDED,
        generation,
    )
    .with_message(decision.reason.clone())];

    let rolled_out = binding.is_some_and(|b| {
        b.spec.state == BindingState::Bound
            && latest_master.is_some_and(|m| b.spec.resource_snapshot_name == m)
    });

    let mut failed_placements = Vec::new();
    match binding {
        Some(binding) if rolled_out => {
            for stage in PlacementStage::ALL.into_iter().skip(1) {
                let Some(binding_type) = ChainLevel::Binding.condition_type(stage) else {
                    continue;
                };
                let Some(source) = find_condition(&binding.status.conditions, binding_type)
                else {
                    continue;
                };
                if source.observed_generation < binding.metadata.generation {
                    continue;
                }
                let Some(mapped_type) = ChainLevel::ClusterPlacement.condition_type(stage)
                else {
                    continue;
                };
                conditions.push(Condition {
                    condition_type: mapped_type.to_string(),
                    observed_generation: generation,
                    ..source.clone()
                });
            }
            failed_placements = binding.status.failed_placements.clone();
        }
        _ => {
            conditions.push(
                Condition::new(
                    condition_types::RESOURCE_ROLLOUT_STARTED,
                    ConditionStatus::False,
                    reasons::ROLLOUT_NOT_STARTED_YET,
                    generation,
                )
                .with_message("waiting for the rollout to admit this cluster".to_string()),
            );
        }
    }

    truncate_after_failure(&mut conditions, ChainLevel::ClusterPlacement);
    ResourcePlacementStatus {
        cluster_name: decision.cluster_name.clone(),
        failed_placements,
        conditions,
    }
}

/// Entries explaining why some of the policy's target could not be placed:
/// one per missing PickN slot (empty cluster name), one per missing
/// PickFixed cluster.
fn unselected_entries(
    crp: &ClusterResourcePlacement,
    snapshot: &ClusterSchedulingPolicySnapshot,
) -> Vec<ResourcePlacementStatus> {
    let policy = snapshot
        .spec
        .policy
        .clone()
        .unwrap_or(PlacementPolicy::PickAll);
    let mut entries = Vec::new();

    match policy {
        PlacementPolicy::PickAll => {}
        PlacementPolicy::PickN { n, .. } => {
            let selected = snapshot.selected_clusters().len();
            for _ in selected..n as usize {
                entries.push(ResourcePlacementStatus {
                    cluster_name: String::new(),
                    failed_placements: Vec::new(),
                    conditions: vec![Condition::new(
                        condition_types::RESOURCE_SCHEDULED,
                        ConditionStatus::False,
                        reasons::RESOURCE_SCHEDULE_FAILED,
                        crp.metadata.generation,
                    )
                    .with_message("no cluster could fill this placement".to_string())],
                });
            }
        }
        PlacementPolicy::PickFixed { .. } => {
            for decision in snapshot.status.cluster_decisions.iter().filter(|d| !d.selected) {
                entries.push(ResourcePlacementStatus {
                    cluster_name: decision.cluster_name.clone(),
                    failed_placements: Vec::new(),
                    conditions: vec![Condition::new(
                        condition_types::RESOURCE_SCHEDULED,
                        ConditionStatus::False,
                        reasons::RESOURCE_SCHEDULE_FAILED,
                        crp.metadata.generation,
                    )
                    .with_message(decision.reason.clone())],
                });
            }
        }
    }
    entries
}

/// Compute the CRP's top-level chain by rolling up the per-cluster chains.
fn top_level_conditions(
    crp: &ClusterResourcePlacement,
    snapshot: &ClusterSchedulingPolicySnapshot,
    selected_entries: &[ResourcePlacementStatus],
) -> Vec<Condition> {
    let generation = crp.metadata.generation;
    let mut conditions = Vec::new();

    let Some(snapshot_scheduled) = find_condition(
        &snapshot.status.conditions,
        condition_types::POLICY_SNAPSHOT_SCHEDULED,
    ) else {
        // The scheduler has not reported yet.
        return conditions;
    };
    let scheduled = Condition {
        condition_type: condition_types::CRP_SCHEDULED.to_string(),
        observed_generation: generation,
        ..snapshot_scheduled.clone()
    };
    let scheduled_false = scheduled.is_false();
    conditions.push(scheduled);
    if scheduled_false {
        return conditions;
    }

    // An empty decision set emits only the Scheduled condition.
    if selected_entries.is_empty() {
        return conditions;
    }

    for stage in PlacementStage::ALL.into_iter().skip(1) {
        let Some(entry_type) = ChainLevel::ClusterPlacement.condition_type(stage) else {
            continue;
        };

        let children: Vec<ChildReport<'_>> = selected_entries
            .iter()
            .map(|entry| ChildReport {
                name: entry.cluster_name.as_str(),
                condition: find_condition(&entry.conditions, entry_type),
                generation,
            })
            .collect();

        let mut condition = rollup_condition(
            stage,
            ChainLevel::Crp,
            RollupKind::PlacementChain,
            &children,
            generation,
        );

        // When no cluster applied any override, surface that rather than a
        // generic success.
        if stage == PlacementStage::Overridden
            && condition.status == ConditionStatus::True
            && selected_entries.iter().all(|entry| {
                find_condition(&entry.conditions, condition_types::RESOURCE_OVERRIDDEN)
                    .is_some_and(|c| c.reason == reasons::OVERRIDE_NOT_SPECIFIED)
            })
        {
            condition.reason = reasons::OVERRIDE_NOT_SPECIFIED.to_string();
        }

        let stop = condition.status != ConditionStatus::True;
        conditions.push(condition);
        if stop {
            break;
        }
    }
    conditions
}

#[async_trait]
impl Reconciler for PlacementAggregator {
    fn name(&self) -> &'static str {
        "aggregator"
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
