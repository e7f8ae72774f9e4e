//! Snapshot rotation: versioned, label-indexed, append-only captures of
//! placement policies and selected resources.
//!
//! The controller:
//! - Ensures the CRP carries the cleanup finalizer
//! - Rotates the policy snapshot when the effective policy hash changes
//! - Rotates resource snapshots when the selected manifest content changes,
//!   splitting into sub-snapshots under the size budget with the master
//!   written last
//! - Prunes retired snapshots beyond the revision history limit

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use fleet_api::{
    labels, names, ClusterResourcePlacement, ClusterResourceSnapshot,
    ClusterSchedulingPolicySnapshot, ClusterWideKey, HubObject, ObjectMeta, PlacementPolicy,
    PolicySnapshotSpec, ResourceSelector, ResourceSnapshotSpec,
};
use fleet_store::{HubStore, StoreError, StoreEvent};

use crate::controller::{with_conflict_retry, ControllerError, ControllerResult, Reconciler};
use crate::hash::ContentHash;

/// Source of the manifests a CRP's selectors match. The hub does not read
/// member API servers; the resource inventory behind this trait is fed by an
/// external watcher.
pub trait ManifestSource: Send + Sync {
    fn select(&self, selectors: &[ResourceSelector]) -> Vec<serde_json::Value>;
}

/// In-memory manifest catalog. Selection matches on group/version/kind plus
/// an optional name or label selector.
#[derive(Default)]
pub struct CatalogSource {
    manifests: std::sync::Mutex<Vec<serde_json::Value>>,
}

impl CatalogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, manifest: serde_json::Value) {
        self.manifests.lock().expect("catalog lock").push(manifest);
    }

    pub fn replace_all(&self, manifests: Vec<serde_json::Value>) {
        *self.manifests.lock().expect("catalog lock") = manifests;
    }
}

impl ManifestSource for CatalogSource {
    fn select(&self, selectors: &[ResourceSelector]) -> Vec<serde_json::Value> {
        let manifests = self.manifests.lock().expect("catalog lock");
        manifests
            .iter()
            .filter(|m| selectors.iter().any(|s| selector_matches(s, m)))
            .cloned()
            .collect()
    }
}

fn selector_matches(selector: &ResourceSelector, manifest: &serde_json::Value) -> bool {
    let Some(key) = ClusterWideKey::for_manifest(manifest) else {
        return false;
    };
    if key.group != selector.group || key.version != selector.version || key.kind != selector.kind
    {
        return false;
    }
    if let Some(name) = &selector.name {
        return &key.name == name;
    }
    if let Some(label_selector) = &selector.label_selector {
        let manifest_labels = manifest
            .pointer("/metadata/labels")
            .and_then(|l| l.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        return label_selector.matches(&manifest_labels);
    }
    true
}

/// The snapshot rotation controller.
pub struct SnapshotController {
    store: Arc<HubStore>,
    source: Arc<dyn ManifestSource>,
    size_budget_bytes: usize,
}

impl SnapshotController {
    pub fn new(
        store: Arc<HubStore>,
        source: Arc<dyn ManifestSource>,
        size_budget_bytes: usize,
    ) -> Self {
        Self {
            store,
            source,
            size_budget_bytes,
        }
    }

    #[instrument(skip(self), fields(crp = %crp_name))]
    async fn reconcile_crp(&self, crp_name: &str) -> ControllerResult<()> {
        let Some(crp) = self.store.placements.get(crp_name).await else {
            return Ok(());
        };
        if crp.metadata.is_deleting() {
            // Teardown is driven by the aggregator.
            return Ok(());
        }

        self.ensure_finalizer(crp_name).await?;
        self.rotate_policy(&crp).await?;

        let manifests = order_manifests(self.source.select(&crp.spec.resource_selectors));
        self.rotate_resources(&crp, manifests).await?;
        Ok(())
    }

    async fn ensure_finalizer(&self, crp_name: &str) -> ControllerResult<()> {
        let store = &self.store;
        with_conflict_retry(|| async move {
            let Some(mut crp) = store.placements.get(crp_name).await else {
                return Ok(());
            };
            let finalizer = labels::CRP_CLEANUP_FINALIZER.to_string();
            if crp.metadata.finalizers.contains(&finalizer) {
                return Ok(());
            }
            crp.metadata.finalizers.push(finalizer);
            store.placements.update(crp).await.map(|_| ())
        })
        .await
    }

    /// Create a new policy snapshot when the effective policy hash moved.
    /// Idempotent on an unchanged policy.
    async fn rotate_policy(&self, crp: &ClusterResourcePlacement) -> ControllerResult<()> {
        let crp_name = &crp.metadata.name;
        let policy = crp.effective_policy();
        let policy_value = serde_json::to_value(&policy)
            .map_err(|e| ControllerError::UnexpectedBehavior(format!("encode policy: {e}")))?;
        let hash = ContentHash::of_value(&policy_value);

        let snapshots = self.policy_snapshots(crp_name).await;
        let latest = snapshots.iter().find(|s| s.is_latest());

        if let Some(latest) = latest {
            if latest.spec.policy_hash == hash.as_str() {
                self.refresh_observed_generation(latest, crp).await?;
                return Ok(());
            }
        }

        let next_index = latest.map(|s| s.spec.policy_index + 1).unwrap_or(0);

        // Demote the previous latest before promoting the successor so there
        // is never more than one latest snapshot.
        if let Some(latest) = latest {
            self.demote_policy_snapshot(&latest.metadata.name).await?;
        }

        let mut metadata = ObjectMeta::named(names::policy_snapshot_name(crp_name, next_index));
        metadata
            .labels
            .insert(labels::CRP_TRACKING_LABEL.to_string(), crp_name.clone());
        metadata.labels.insert(
            labels::IS_LATEST_SNAPSHOT_LABEL.to_string(),
            "true".to_string(),
        );
        metadata.annotations.insert(
            labels::CRP_GENERATION_ANNOTATION.to_string(),
            crp.metadata.generation.to_string(),
        );
        if let PlacementPolicy::PickN { n, .. } = &policy {
            metadata.annotations.insert(
                labels::NUMBER_OF_CLUSTERS_ANNOTATION.to_string(),
                n.to_string(),
            );
        }

        let snapshot = ClusterSchedulingPolicySnapshot {
            metadata,
            spec: PolicySnapshotSpec {
                policy: crp.spec.policy.clone(),
                policy_hash: hash.as_str().to_string(),
                policy_index: next_index,
            },
            status: Default::default(),
        };

        match self.store.policy_snapshots.create(snapshot).await {
            Ok(_) => {
                info!(crp = %crp_name, index = next_index, "Rotated policy snapshot");
            }
            // A retry of a partially completed rotation.
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        self.prune_policy_snapshots(crp).await
    }

    /// The policy did not change but the CRP generation may have moved (for
    /// example a strategy-only edit); keep the annotation current.
    async fn refresh_observed_generation(
        &self,
        latest: &ClusterSchedulingPolicySnapshot,
        crp: &ClusterResourcePlacement,
    ) -> ControllerResult<()> {
        let wanted = crp.metadata.generation.to_string();
        if latest
            .metadata
            .annotations
            .get(labels::CRP_GENERATION_ANNOTATION)
            == Some(&wanted)
        {
            return Ok(());
        }
        let store = &self.store;
        let name = &latest.metadata.name;
        let wanted = &wanted;
        with_conflict_retry(|| async move {
            let Some(mut snapshot) = store.policy_snapshots.get(name).await else {
                return Ok(());
            };
            snapshot
                .metadata
                .annotations
                .insert(labels::CRP_GENERATION_ANNOTATION.to_string(), wanted.clone());
            store.policy_snapshots.update(snapshot).await.map(|_| ())
        })
        .await
    }

    async fn demote_policy_snapshot(&self, name: &str) -> ControllerResult<()> {
        let store = &self.store;
        with_conflict_retry(|| async move {
            let Some(mut snapshot) = store.policy_snapshots.get(name).await else {
                return Ok(());
            };
            if snapshot
                .metadata
                .labels
                .remove(labels::IS_LATEST_SNAPSHOT_LABEL)
                .is_none()
            {
                return Ok(());
            }
            store.policy_snapshots.update(snapshot).await.map(|_| ())
        })
        .await
    }

    async fn prune_policy_snapshots(&self, crp: &ClusterResourcePlacement) -> ControllerResult<()> {
        let limit = crp.revision_history_limit() as usize;
        let mut snapshots = self.policy_snapshots(&crp.metadata.name).await;
        snapshots.sort_by_key(|s| std::cmp::Reverse(s.spec.policy_index));
        if snapshots.len() <= limit {
            return Ok(());
        }

        let referenced: std::collections::HashSet<String> = self
            .store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, &crp.metadata.name)
            .await
            .into_iter()
            .map(|b| b.spec.policy_snapshot_name)
            .collect();

        for snapshot in &snapshots[limit..] {
            if referenced.contains(&snapshot.metadata.name) {
                continue;
            }
            debug!(snapshot = %snapshot.metadata.name, "Pruning policy snapshot");
            match self.store.policy_snapshots.delete(&snapshot.metadata.name).await {
                Ok(()) => {}
                Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Create a new resource snapshot group when the content hash moved.
    /// Children are written before the master so readers never observe a
    /// partial master.
    async fn rotate_resources(
        &self,
        crp: &ClusterResourcePlacement,
        manifests: Vec<serde_json::Value>,
    ) -> ControllerResult<()> {
        let crp_name = &crp.metadata.name;
        let hash = ContentHash::of_values(&manifests);

        let masters = self.resource_masters(crp_name).await;
        let latest = masters.iter().find(|s| s.is_latest());

        if let Some(latest) = latest {
            if latest.metadata.annotations.get(labels::SNAPSHOT_HASH_ANNOTATION)
                == Some(&hash.as_str().to_string())
            {
                return Ok(());
            }
        }

        let next_index = match latest {
            Some(latest) => resource_index_of(latest)? + 1,
            None => 0,
        };

        let chunks = split_by_budget(manifests, self.size_budget_bytes);

        if chunks.len() > 1 {
            for (subindex, chunk) in chunks.iter().enumerate() {
                let mut metadata = ObjectMeta::named(names::resource_snapshot_sub_name(
                    crp_name, next_index, subindex as i64,
                ));
                metadata
                    .labels
                    .insert(labels::CRP_TRACKING_LABEL.to_string(), crp_name.clone());
                metadata.labels.insert(
                    labels::RESOURCE_INDEX_LABEL.to_string(),
                    next_index.to_string(),
                );
                metadata.annotations.insert(
                    labels::SUBINDEX_OF_RESOURCE_SNAPSHOT_ANNOTATION.to_string(),
                    subindex.to_string(),
                );
                let child = ClusterResourceSnapshot {
                    metadata,
                    spec: ResourceSnapshotSpec {
                        selected_resources: chunk.clone(),
                    },
                };
                match self.store.resource_snapshots.create(child).await {
                    Ok(_) => {}
                    Err(StoreError::AlreadyExists { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if let Some(latest) = latest {
            self.demote_resource_master(&latest.metadata.name).await?;
        }

        let mut metadata =
            ObjectMeta::named(names::resource_snapshot_master_name(crp_name, next_index));
        metadata
            .labels
            .insert(labels::CRP_TRACKING_LABEL.to_string(), crp_name.clone());
        metadata.labels.insert(
            labels::RESOURCE_INDEX_LABEL.to_string(),
            next_index.to_string(),
        );
        metadata.labels.insert(
            labels::IS_LATEST_SNAPSHOT_LABEL.to_string(),
            "true".to_string(),
        );
        metadata.annotations.insert(
            labels::NUMBER_OF_RESOURCE_SNAPSHOTS_ANNOTATION.to_string(),
            chunks.len().max(1).to_string(),
        );
        metadata.annotations.insert(
            labels::SNAPSHOT_HASH_ANNOTATION.to_string(),
            hash.as_str().to_string(),
        );

        let master = ClusterResourceSnapshot {
            metadata,
            spec: ResourceSnapshotSpec {
                // A single-chunk group keeps its content on the master; a
                // split group's content lives on the children only.
                selected_resources: if chunks.len() == 1 {
                    chunks.into_iter().next().unwrap_or_default()
                } else {
                    Vec::new()
                },
            },
        };

        match self.store.resource_snapshots.create(master).await {
            Ok(_) => {
                info!(crp = %crp_name, index = next_index, "Rotated resource snapshot");
            }
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        self.prune_resource_snapshots(crp).await
    }

    async fn demote_resource_master(&self, name: &str) -> ControllerResult<()> {
        let store = &self.store;
        with_conflict_retry(|| async move {
            let Some(mut snapshot) = store.resource_snapshots.get(name).await else {
                return Ok(());
            };
            if snapshot
                .metadata
                .labels
                .remove(labels::IS_LATEST_SNAPSHOT_LABEL)
                .is_none()
            {
                return Ok(());
            }
            store.resource_snapshots.update(snapshot).await.map(|_| ())
        })
        .await
    }

    async fn prune_resource_snapshots(
        &self,
        crp: &ClusterResourcePlacement,
    ) -> ControllerResult<()> {
        let limit = crp.revision_history_limit() as usize;
        let mut masters = self.resource_masters(&crp.metadata.name).await;
        masters.sort_by_key(|s| std::cmp::Reverse(resource_index_of(s).unwrap_or(0)));
        if masters.len() <= limit {
            return Ok(());
        }

        let referenced: std::collections::HashSet<String> = self
            .store
            .bindings
            .list_by_label(labels::CRP_TRACKING_LABEL, &crp.metadata.name)
            .await
            .into_iter()
            .map(|b| b.spec.resource_snapshot_name)
            .collect();

        let all = self
            .store
            .resource_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, &crp.metadata.name)
            .await;

        for master in &masters[limit..] {
            if referenced.contains(&master.metadata.name) {
                continue;
            }
            let index = resource_index_of(master)?;
            for snapshot in all.iter().filter(|s| {
                resource_index_of(s).map(|i| i == index).unwrap_or(false)
            }) {
                debug!(snapshot = %snapshot.metadata.name, "Pruning resource snapshot");
                match self
                    .store
                    .resource_snapshots
                    .delete(&snapshot.metadata.name)
                    .await
                {
                    Ok(()) => {}
                    Err(StoreError::NotFound { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    async fn policy_snapshots(&self, crp_name: &str) -> Vec<ClusterSchedulingPolicySnapshot> {
        self.store
            .policy_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await
    }

    async fn resource_masters(&self, crp_name: &str) -> Vec<ClusterResourceSnapshot> {
        self.store
            .resource_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
            .await
            .into_iter()
            .filter(|s| s.is_master())
            .collect()
    }
}

#[async_trait]
impl Reconciler for SnapshotController {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn map_event(&self, event: &StoreEvent) -> Vec<String> {
        if event.kind == ClusterResourcePlacement::KIND {
            vec![event.key.clone()]
        } else {
            Vec::new()
        }
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

/// The resource index a master or sub-snapshot belongs to, from its label.
pub fn resource_index_of(snapshot: &ClusterResourceSnapshot) -> ControllerResult<i64> {
    snapshot
        .metadata
        .labels
        .get(labels::RESOURCE_INDEX_LABEL)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            ControllerError::UnexpectedBehavior(format!(
                "resource snapshot {} has no valid resource index label",
                snapshot.metadata.name
            ))
        })
}

/// The latest master resource snapshot of a CRP, if any.
pub async fn latest_resource_master(
    store: &HubStore,
    crp_name: &str,
) -> Option<ClusterResourceSnapshot> {
    store
        .resource_snapshots
        .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
        .await
        .into_iter()
        .find(|s| s.is_master() && s.is_latest())
}

/// The latest policy snapshot of a CRP, if any.
pub async fn latest_policy_snapshot(
    store: &HubStore,
    crp_name: &str,
) -> Option<ClusterSchedulingPolicySnapshot> {
    store
        .policy_snapshots
        .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
        .await
        .into_iter()
        .find(|s| s.is_latest())
}

/// All snapshots carrying content for a master: the master itself for a
/// single-chunk group, otherwise its subindexed children in order.
pub async fn content_snapshots_of(
    store: &HubStore,
    crp_name: &str,
    master: &ClusterResourceSnapshot,
) -> ControllerResult<Vec<ClusterResourceSnapshot>> {
    let total = master.number_of_resource_snapshots().ok_or_else(|| {
        ControllerError::UnexpectedBehavior(format!(
            "master snapshot {} has no valid snapshot count annotation",
            master.metadata.name
        ))
    })?;
    if total <= 1 {
        return Ok(vec![master.clone()]);
    }

    let index = resource_index_of(master)?;
    let mut children: Vec<ClusterResourceSnapshot> = store
        .resource_snapshots
        .list_by_label(labels::CRP_TRACKING_LABEL, crp_name)
        .await
        .into_iter()
        .filter(|s| !s.is_master())
        .filter(|s| resource_index_of(s).map(|i| i == index).unwrap_or(false))
        .collect();

    children.sort_by_key(|s| subindex_of(s).unwrap_or(i64::MAX));

    if children.len() != total {
        // The master is written last, so a complete group is always visible;
        // a short read here is a race with rotation.
        return Err(ControllerError::Transient(format!(
            "resource snapshot group {} incomplete: {}/{} children",
            master.metadata.name,
            children.len(),
            total
        )));
    }
    Ok(children)
}

/// The subindex annotation of a sub-snapshot. `-1` or garbage is an input
/// invariant violation.
pub fn subindex_of(snapshot: &ClusterResourceSnapshot) -> ControllerResult<i64> {
    let raw = snapshot
        .metadata
        .annotations
        .get(labels::SUBINDEX_OF_RESOURCE_SNAPSHOT_ANNOTATION)
        .ok_or_else(|| {
            ControllerError::UnexpectedBehavior(format!(
                "snapshot {} has no subindex annotation",
                snapshot.metadata.name
            ))
        })?;
    let subindex: i64 = raw.parse().map_err(|_| {
        ControllerError::UnexpectedBehavior(format!(
            "snapshot {} has invalid subindex {raw:?}",
            snapshot.metadata.name
        ))
    })?;
    if subindex < 0 {
        return Err(ControllerError::UnexpectedBehavior(format!(
            "snapshot {} has negative subindex {subindex}",
            snapshot.metadata.name
        )));
    }
    Ok(subindex)
}

/// Sort by `ClusterWideKey` and drop duplicates so hashing and ordinals are
/// deterministic.
fn order_manifests(mut manifests: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
    manifests.sort_by_cached_key(|m| ClusterWideKey::for_manifest(m).unwrap_or_default());
    manifests.dedup_by_key(|m| ClusterWideKey::for_manifest(m).unwrap_or_default());
    manifests
}

/// Greedy split into chunks whose serialized size stays under the budget.
/// A single oversized manifest still gets its own chunk.
fn split_by_budget(
    manifests: Vec<serde_json::Value>,
    budget_bytes: usize,
) -> Vec<Vec<serde_json::Value>> {
    let mut chunks: Vec<Vec<serde_json::Value>> = Vec::new();
    let mut current: Vec<serde_json::Value> = Vec::new();
    let mut current_size = 0usize;

    for manifest in manifests {
        let size = serde_json::to_string(&manifest).map(|s| s.len()).unwrap_or(0);
        if !current.is_empty() && current_size + size > budget_bytes {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(manifest);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::{PlacementSpec, PlacementStatus};
    use serde_json::json;

    fn crp_with_selector(name: &str) -> ClusterResourcePlacement {
        ClusterResourcePlacement {
            metadata: ObjectMeta::named(name),
            spec: PlacementSpec {
                resource_selectors: vec![ResourceSelector {
                    group: String::new(),
                    version: "v1".to_string(),
                    kind: "ConfigMap".to_string(),
                    name: None,
                    label_selector: None,
                }],
                ..Default::default()
            },
            status: PlacementStatus::default(),
        }
    }

    fn configmap(name: &str, payload: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": {"payload": payload},
        })
    }

    async fn controller_with_budget(
        budget: usize,
    ) -> (Arc<HubStore>, Arc<CatalogSource>, SnapshotController) {
        let store = HubStore::new();
        let source = Arc::new(CatalogSource::new());
        let controller = SnapshotController::new(store.clone(), source.clone(), budget);
        (store, source, controller)
    }

    #[tokio::test]
    async fn test_rotation_creates_policy_and_resource_snapshots() {
        let (store, source, controller) = controller_with_budget(1024 * 1024).await;
        source.insert(configmap("cm-1", "hello"));
        store
            .placements
            .create(crp_with_selector("demo"))
            .await
            .unwrap();

        controller.reconcile("demo").await.unwrap();

        let policy = latest_policy_snapshot(&store, "demo").await.unwrap();
        assert_eq!(policy.spec.policy_index, 0);
        assert_eq!(policy.metadata.name, "demo-0");

        let master = latest_resource_master(&store, "demo").await.unwrap();
        assert_eq!(master.metadata.name, "demo-0-snapshot");
        assert_eq!(master.number_of_resource_snapshots(), Some(1));
        assert_eq!(master.spec.selected_resources.len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_is_idempotent_on_unchanged_inputs() {
        let (store, source, controller) = controller_with_budget(1024 * 1024).await;
        source.insert(configmap("cm-1", "hello"));
        store
            .placements
            .create(crp_with_selector("demo"))
            .await
            .unwrap();

        controller.reconcile("demo").await.unwrap();
        controller.reconcile("demo").await.unwrap();
        controller.reconcile("demo").await.unwrap();

        let snapshots = store
            .resource_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, "demo")
            .await;
        assert_eq!(snapshots.len(), 1);
        let policies = store
            .policy_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, "demo")
            .await;
        assert_eq!(policies.len(), 1);
    }

    #[tokio::test]
    async fn test_content_change_rotates_and_demotes() {
        let (store, source, controller) = controller_with_budget(1024 * 1024).await;
        source.insert(configmap("cm-1", "v1"));
        store
            .placements
            .create(crp_with_selector("demo"))
            .await
            .unwrap();
        controller.reconcile("demo").await.unwrap();

        source.replace_all(vec![configmap("cm-1", "v2")]);
        controller.reconcile("demo").await.unwrap();

        let masters: Vec<_> = store
            .resource_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, "demo")
            .await
            .into_iter()
            .filter(|s| s.is_master())
            .collect();
        assert_eq!(masters.len(), 2);
        let latest: Vec<_> = masters.iter().filter(|s| s.is_latest()).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].metadata.name, "demo-1-snapshot");
    }

    #[tokio::test]
    async fn test_split_writes_children_then_empty_master() {
        // Budget fits one manifest per chunk.
        let (store, source, controller) = controller_with_budget(120).await;
        for i in 0..3 {
            source.insert(configmap(&format!("cm-{i}"), "xxxxxxxxxxxxxxxx"));
        }
        store
            .placements
            .create(crp_with_selector("demo"))
            .await
            .unwrap();
        controller.reconcile("demo").await.unwrap();

        let master = latest_resource_master(&store, "demo").await.unwrap();
        assert_eq!(master.number_of_resource_snapshots(), Some(3));
        assert!(master.spec.selected_resources.is_empty());

        let children = content_snapshots_of(&store, "demo", &master).await.unwrap();
        assert_eq!(children.len(), 3);
        for (i, child) in children.iter().enumerate() {
            assert_eq!(subindex_of(child).unwrap(), i as i64);
            assert_eq!(child.spec.selected_resources.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_prune_beyond_revision_history_limit() {
        let (store, source, controller) = controller_with_budget(1024 * 1024).await;
        let mut crp = crp_with_selector("demo");
        crp.spec.revision_history_limit = Some(2);
        store.placements.create(crp).await.unwrap();

        for version in 0..4 {
            source.replace_all(vec![configmap("cm-1", &format!("v{version}"))]);
            controller.reconcile("demo").await.unwrap();
        }

        let masters: Vec<_> = store
            .resource_snapshots
            .list_by_label(labels::CRP_TRACKING_LABEL, "demo")
            .await
            .into_iter()
            .filter(|s| s.is_master())
            .collect();
        assert_eq!(masters.len(), 2);
        assert!(latest_resource_master(&store, "demo")
            .await
            .unwrap()
            .metadata
            .name
            .ends_with("3-snapshot"));
    }

    #[tokio::test]
    async fn test_subindex_validation() {
        let mut snapshot = ClusterResourceSnapshot::default();
        snapshot.metadata.name = "demo-1-2".to_string();
        assert!(matches!(
            subindex_of(&snapshot),
            Err(ControllerError::UnexpectedBehavior(_))
        ));

        snapshot.metadata.annotations.insert(
            labels::SUBINDEX_OF_RESOURCE_SNAPSHOT_ANNOTATION.to_string(),
            "-1".to_string(),
        );
        assert!(matches!(
            subindex_of(&snapshot),
            Err(ControllerError::UnexpectedBehavior(_))
        ));

        snapshot.metadata.annotations.insert(
            labels::SUBINDEX_OF_RESOURCE_SNAPSHOT_ANNOTATION.to_string(),
            "2".to_string(),
        );
        assert_eq!(subindex_of(&snapshot).unwrap(), 2);
    }

    #[test]
    fn test_split_by_budget_oversized_manifest() {
        let big = json!({"data": "x".repeat(500)});
        let chunks = split_by_budget(vec![big.clone(), big], 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 1);
    }

    #[test]
    fn test_order_manifests_dedupes() {
        let a = configmap("a", "1");
        let ordered = order_manifests(vec![a.clone(), configmap("b", "2"), a]);
        assert_eq!(ordered.len(), 2);
        let first = ClusterWideKey::for_manifest(&ordered[0]).unwrap();
        assert_eq!(first.name, "a");
    }
}
