//! Work generator: materializes per-cluster Work objects from bound
//! bindings and resource snapshots, and folds per-manifest apply status
//! back into the binding's condition chain.

mod overrides;

pub use overrides::{apply_overrides, OverrideError};

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use fleet_api::{
    condition_types, find_condition, labels, names, reasons, BindingState,
    ClusterResourceBinding, ClusterResourceSnapshot, Condition, ConditionStatus,
    EnvelopeIdentifier, FailedResourcePlacement, HubObject, Manifest, ClusterWideKey, ObjectMeta,
    Work, WorkSpec,
};
use fleet_condition::{
    rollup_condition, set_condition, truncate_after_failure, ChainLevel, ChildReport,
    PlacementStage, RollupKind,
};
use fleet_store::{HubStore, StoreError, StoreEvent};

use crate::controller::{with_conflict_retry, ControllerError, ControllerResult, Reconciler};
use crate::snapshot::content_snapshots_of;

/// Derive the Work name for one content snapshot: `<crp>-work` when the
/// group has a single snapshot, `<crp>-<subindex>` otherwise. A missing CRP
/// tracking label or an invalid subindex is an input invariant violation.
pub fn work_name_prefix(snapshot: &ClusterResourceSnapshot) -> ControllerResult<String> {
    let crp = snapshot
        .metadata
        .labels
        .get(labels::CRP_TRACKING_LABEL)
        .ok_or_else(|| {
            ControllerError::UnexpectedBehavior(format!(
                "resource snapshot {} has no CRP tracking label",
                snapshot.metadata.name
            ))
        })?;

    match snapshot
        .metadata
        .annotations
        .get(labels::SUBINDEX_OF_RESOURCE_SNAPSHOT_ANNOTATION)
    {
        None => Ok(format!("{crp}-work")),
        Some(raw) => {
            let subindex: i64 = raw.parse().map_err(|_| {
                ControllerError::UnexpectedBehavior(format!(
                    "resource snapshot {} has invalid subindex {raw:?}",
                    snapshot.metadata.name
                ))
            })?;
            if subindex < 0 {
                return Err(ControllerError::UnexpectedBehavior(format!(
                    "resource snapshot {} has negative subindex {subindex}",
                    snapshot.metadata.name
                )));
            }
            Ok(format!("{crp}-{subindex}"))
        }
    }
}

/// The work generation reconciler, one pass per binding key.
pub struct WorkGenerator {
    store: Arc<HubStore>,
    max_failed_placements: usize,
}

impl WorkGenerator {
    pub fn new(store: Arc<HubStore>, max_failed_placements: usize) -> Self {
        Self {
            store,
            max_failed_placements,
        }
    }

    #[instrument(skip(self), fields(binding = %binding_key))]
    async fn reconcile_binding(&self, binding_key: &str) -> ControllerResult<()> {
        let Some(binding) = self.store.bindings.get(binding_key).await else {
            // The binding is gone; its Works must not outlive it.
            self.delete_works_of(binding_key).await?;
            return Ok(());
        };

        if binding.metadata.is_deleting() || binding.spec.state == BindingState::Unscheduled {
            self.delete_works_of(&binding.metadata.name).await?;
            return Ok(());
        }
        if binding.spec.state != BindingState::Bound {
            return Ok(());
        }

        let crp_name = binding
            .metadata
            .labels
            .get(labels::CRP_TRACKING_LABEL)
            .cloned()
            .ok_or_else(|| {
                ControllerError::UnexpectedBehavior(format!(
                    "binding {} has no CRP tracking label",
                    binding.metadata.name
                ))
            })?;

        let Some(master) = self
            .store
            .resource_snapshots
            .get(&binding.spec.resource_snapshot_name)
            .await
        else {
            // A bound binding always references an existing master; a miss
            // here is a race with rotation.
            return Err(ControllerError::Transient(format!(
                "resource snapshot {} not found",
                binding.spec.resource_snapshot_name
            )));
        };

        let contents = content_snapshots_of(&self.store, &crp_name, &master).await?;

        match self.synthesize_works(&binding, &crp_name, &contents).await {
            Ok(sync_condition) => {
                self.update_binding_status(&binding.metadata.name, Some(sync_condition))
                    .await
            }
            Err(ControllerError::UserError(message)) => {
                warn!(binding = %binding.metadata.name, error = %message, "Override application failed");
                self.mark_override_failed(&binding.metadata.name, message)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Create or refresh the Works of one binding. Returns the
    /// WorkSynchronized condition to record.
    async fn synthesize_works(
        &self,
        binding: &ClusterResourceBinding,
        crp_name: &str,
        contents: &[ClusterResourceSnapshot],
    ) -> ControllerResult<Condition> {
        let namespace = names::cluster_namespace(&binding.spec.target_cluster);
        let mut desired_names = BTreeSet::new();

        let mut planned = Vec::new();
        for snapshot in contents {
            let name = work_name_prefix(snapshot)?;

            let mut manifests = snapshot.spec.selected_resources.clone();
            apply_overrides(&mut manifests, &binding.spec.overrides)
                .map_err(|e| ControllerError::UserError(e.to_string()))?;

            desired_names.insert(name.clone());
            planned.push((name, build_workload(manifests)));
        }

        for (name, workload) in planned {
            self.write_work(binding, crp_name, &namespace, &name, workload)
                .await?;
        }

        // Works for snapshots that no longer exist are torn down.
        let existing = self
            .store
            .works
            .list_by_label(labels::PARENT_BINDING_LABEL, &binding.metadata.name)
            .await;
        for work in existing {
            if !desired_names.contains(&work.metadata.name) {
                debug!(work = %work.metadata.name, "Deleting stale work");
                match self.store.works.delete(&work.metadata.store_key()).await {
                    Ok(()) | Err(StoreError::NotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(Condition::new(
            condition_types::BINDING_WORK_SYNCHRONIZED,
            ConditionStatus::True,
            reasons::ALL_WORK_SYNCED,
            binding.metadata.generation,
        ))
    }

    async fn write_work(
        &self,
        binding: &ClusterResourceBinding,
        crp_name: &str,
        namespace: &str,
        name: &str,
        workload: Vec<Manifest>,
    ) -> ControllerResult<()> {
        let mut metadata = ObjectMeta::named(name);
        metadata.namespace = namespace.to_string();
        metadata
            .labels
            .insert(labels::CRP_TRACKING_LABEL.to_string(), crp_name.to_string());
        metadata.labels.insert(
            labels::PARENT_BINDING_LABEL.to_string(),
            binding.metadata.name.clone(),
        );

        let desired = Work {
            metadata,
            spec: WorkSpec { workload },
            status: Default::default(),
        };
        let key = desired.metadata.store_key();

        match self.store.works.create(desired.clone()).await {
            Ok(_) => {
                info!(work = %key, "Created work");
                return Ok(());
            }
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let store = &self.store;
        let desired = &desired;
        let key = &key;
        with_conflict_retry(|| async move {
            let Some(mut work) = store.works.get(key).await else {
                return store.works.create(desired.clone()).await.map(|_| ());
            };
            if work.spec_eq(desired) && work.metadata.labels == desired.metadata.labels {
                return Ok(());
            }
            work.spec = desired.spec.clone();
            work.metadata.labels = desired.metadata.labels.clone();
            store.works.update(work).await.map(|_| ())
        })
        .await
    }

    async fn delete_works_of(&self, binding_name: &str) -> ControllerResult<()> {
        let works = self
            .store
            .works
            .list_by_label(labels::PARENT_BINDING_LABEL, binding_name)
            .await;
        for work in works {
            match self.store.works.delete(&work.metadata.store_key()).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Fold Work conditions up into the binding's chain and refresh the
    /// failed-placements list.
    async fn update_binding_status(
        &self,
        binding_name: &str,
        sync_condition: Option<Condition>,
    ) -> ControllerResult<()> {
        let store = &self.store;
        let max_failed = self.max_failed_placements;
        let sync_condition = &sync_condition;

        with_conflict_retry(|| async move {
            let Some(mut binding) = store.bindings.get(binding_name).await else {
                return Ok(());
            };
            let works = store
                .works
                .list_by_label(labels::PARENT_BINDING_LABEL, binding_name)
                .await;
            let generation = binding.metadata.generation;

            let overridden_reason = if binding.spec.overrides.is_empty() {
                reasons::OVERRIDE_NOT_SPECIFIED
            } else {
                reasons::OVERRIDDEN_SUCCEEDED
            };
            set_condition(
                &mut binding.status.conditions,
                Condition::new(
                    condition_types::BINDING_OVERRIDDEN,
                    ConditionStatus::True,
                    overridden_reason,
                    generation,
                ),
            );

            if let Some(sync) = sync_condition {
                set_condition(
                    &mut binding.status.conditions,
                    Condition {
                        observed_generation: generation,
                        ..sync.clone()
                    },
                );
            }

            let applied_children: Vec<ChildReport<'_>> = works
                .iter()
                .map(|w| ChildReport {
                    name: w.metadata.name.as_str(),
                    condition: find_condition(&w.status.conditions, condition_types::WORK_APPLIED),
                    generation: w.metadata.generation,
                })
                .collect();
            set_condition(
                &mut binding.status.conditions,
                rollup_condition(
                    PlacementStage::Applied,
                    ChainLevel::Binding,
                    RollupKind::WorksOntoBinding,
                    &applied_children,
                    generation,
                ),
            );

            let available_children: Vec<ChildReport<'_>> = works
                .iter()
                .map(|w| ChildReport {
                    name: w.metadata.name.as_str(),
                    condition: find_condition(
                        &w.status.conditions,
                        condition_types::WORK_AVAILABLE,
                    ),
                    generation: w.metadata.generation,
                })
                .collect();
            set_condition(
                &mut binding.status.conditions,
                rollup_condition(
                    PlacementStage::Available,
                    ChainLevel::Binding,
                    RollupKind::WorksOntoBinding,
                    &available_children,
                    generation,
                ),
            );

            let (failed, truncated) = extract_failed_placements(&works, max_failed);
            if truncated {
                warn!(
                    binding = %binding_name,
                    limit = max_failed,
                    "Failed placements exceed the limit, list truncated"
                );
            }
            binding.status.failed_placements = failed;

            truncate_after_failure(&mut binding.status.conditions, ChainLevel::Binding);
            store.bindings.update_status(binding).await.map(|_| ())
        })
        .await
    }

    /// Overrides conflicted: the chain stops at Overridden until the next
    /// spec change re-evaluates them.
    async fn mark_override_failed(
        &self,
        binding_name: &str,
        message: String,
    ) -> ControllerResult<()> {
        let store = &self.store;
        let message = &message;
        with_conflict_retry(|| async move {
            let Some(mut binding) = store.bindings.get(binding_name).await else {
                return Ok(());
            };
            let condition = Condition::new(
                condition_types::BINDING_OVERRIDDEN,
                ConditionStatus::False,
                reasons::OVERRIDDEN_FAILED,
                binding.metadata.generation,
            )
            .with_message(message.clone());
            set_condition(&mut binding.status.conditions, condition);
            truncate_after_failure(&mut binding.status.conditions, ChainLevel::Binding);
            binding.status.failed_placements.clear();
            store.bindings.update_status(binding).await.map(|_| ())
        })
        .await
    }
}

/// Sort by `ClusterWideKey` and assign stable ordinals.
fn build_workload(mut manifests: Vec<serde_json::Value>) -> Vec<Manifest> {
    manifests.sort_by_cached_key(|m| ClusterWideKey::for_manifest(m).unwrap_or_default());
    manifests
        .into_iter()
        .enumerate()
        .map(|(ordinal, raw)| Manifest { ordinal, raw })
        .collect()
}

/// Collect manifests that failed to apply or become available, preserving
/// envelope identity. The list is capped; order is not guaranteed once
/// truncated.
pub fn extract_failed_placements(
    works: &[Work],
    limit: usize,
) -> (Vec<FailedResourcePlacement>, bool) {
    let mut failed = Vec::new();

    for work in works {
        for manifest_condition in &work.status.manifest_conditions {
            let fresh = |c: &&Condition| c.observed_generation >= work.metadata.generation;
            let applied = find_condition(&manifest_condition.conditions, condition_types::WORK_APPLIED)
                .filter(fresh);
            let available =
                find_condition(&manifest_condition.conditions, condition_types::WORK_AVAILABLE)
                    .filter(fresh);

            let condition = match (applied, available) {
                (Some(applied), _) if applied.is_false() => applied.clone(),
                (Some(applied), Some(available)) if applied.is_true() && available.is_false() => {
                    available.clone()
                }
                _ => continue,
            };

            let mut identifier = manifest_condition.identifier.to_identifier();
            identifier.envelope = envelope_of_manifest(work, manifest_condition.identifier.ordinal);
            failed.push(FailedResourcePlacement {
                resource_identifier: identifier,
                condition,
            });
        }
    }

    let truncated = failed.len() > limit;
    failed.truncate(limit);
    (failed, truncated)
}

/// Envelope triple from the labels of the manifest at the given ordinal.
fn envelope_of_manifest(work: &Work, ordinal: usize) -> Option<EnvelopeIdentifier> {
    let manifest = work.spec.workload.iter().find(|m| m.ordinal == ordinal)?;
    let manifest_labels = manifest.raw.pointer("/metadata/labels")?.as_object()?;
    let get = |key: &str| {
        manifest_labels
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let name = get(labels::ENVELOPE_NAME_LABEL)?;
    Some(EnvelopeIdentifier {
        name,
        namespace: get(labels::ENVELOPE_NAMESPACE_LABEL).unwrap_or_default(),
        envelope_type: get(labels::ENVELOPE_TYPE_LABEL).unwrap_or_default(),
    })
}

#[async_trait]
impl Reconciler for WorkGenerator {
    fn name(&self) -> &'static str {
        "workgen"
    }

    async fn map_event(&self, event: &StoreEvent) -> Vec<String> {
        match event.kind {
            ClusterResourceBinding::KIND => vec![event.key.clone()],
            Work::KIND => {
                if let Some(work) = self.store.works.get(&event.key).await {
                    if let Some(binding) = work.metadata.labels.get(labels::PARENT_BINDING_LABEL) {
                        return vec![binding.clone()];
                    }
                }
                // Deleted work: recover `<crp>-<cluster>` from the key
                // `fleet-member-<cluster>/<workName>`.
                let Some((namespace, name)) = event.key.split_once('/') else {
                    return Vec::new();
                };
                let Some(cluster) = namespace.strip_prefix("fleet-member-") else {
                    return Vec::new();
                };
                names::crp_of_work_name(name)
                    .map(|crp| vec![format!("{crp}-{cluster}")])
                    .unwrap_or_default()
            }
            ClusterResourceSnapshot::KIND => {
                // New snapshot content may need regeneration for every
                // binding of the CRP.
                let crp = match self.store.resource_snapshots.get(&event.key).await {
                    Some(s) => s.metadata.labels.get(labels::CRP_TRACKING_LABEL).cloned(),
                    None => names::crp_of_resource_snapshot(&event.key).map(str::to_string),
                };
                match crp {
                    Some(crp) => self
                        .store
                        .bindings
                        .list_by_label(labels::CRP_TRACKING_LABEL, &crp)
                        .await
                        .into_iter()
                        .map(|b| b.metadata.store_key())
                        .collect(),
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    async fn resync_keys(&self) -> Vec<String> {
        self.store
            .bindings
            .list()
            .await
            .into_iter()
            .map(|b| b.metadata.store_key())
            .collect()
    }

    async fn reconcile(&self, key: &str) -> ControllerResult<()> {
        self.reconcile_binding(key).await
    }
}
