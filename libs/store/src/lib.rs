//! # fleet-store
//!
//! The hub's declarative object store: versioned objects with optimistic
//! concurrency and watch. The backing implementation is in-memory; the
//! semantics are the contract the controllers rely on.
//!
//! ## Design Principles
//!
//! - Every write is a compare-and-swap on `resource_version`; losers get a
//!   typed `Conflict` and re-read
//! - `generation` increments exactly when the spec changes; status writes
//!   never touch it
//! - Deletion honors finalizers: a delete request on a finalized object only
//!   stamps `deletion_timestamp`; the object is removed once the last
//!   finalizer is cleared
//! - Watchers receive `(kind, key)` events, not object payloads; consumers
//!   re-read through the store so they never act on stale snapshots

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use fleet_api::{
    ClusterResourceBinding, ClusterResourcePlacement, ClusterResourceSnapshot,
    ClusterSchedulingPolicySnapshot, HubObject, MemberCluster, Work,
};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// Optimistic-concurrency violation; re-read and retry.
    #[error("conflict writing {kind} {key}: resource version {given} is stale")]
    Conflict {
        kind: &'static str,
        key: String,
        given: i64,
    },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Added,
    Modified,
    Deleted,
}

/// A watch event. Carries identity only; consumers re-read.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: &'static str,
    pub key: String,
    pub op: StoreOp,
}

const WATCH_BUFFER: usize = 1024;

/// One kind's objects, keyed by `ObjectMeta::store_key()`.
pub struct Collection<T: HubObject> {
    objects: Mutex<BTreeMap<String, T>>,
    events: broadcast::Sender<StoreEvent>,
    /// Number of upcoming writes to fail with a conflict (test hook).
    injected_conflicts: AtomicU32,
}

impl<T: HubObject> Collection<T> {
    fn new(events: broadcast::Sender<StoreEvent>) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            events,
            injected_conflicts: AtomicU32::new(0),
        }
    }

    fn emit(&self, key: &str, op: StoreOp) {
        // Send fails only when nobody is watching.
        let _ = self.events.send(StoreEvent {
            kind: T::KIND,
            key: key.to_string(),
            op,
        });
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Fail the next `n` writes with a conflict. Test hook for exercising
    /// bounded-retry paths.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        self.objects.lock().expect("store lock").get(key).cloned()
    }

    /// All objects, in key order.
    pub async fn list(&self) -> Vec<T> {
        self.objects
            .lock()
            .expect("store lock")
            .values()
            .cloned()
            .collect()
    }

    /// Objects carrying the given label value, in key order.
    pub async fn list_by_label(&self, label: &str, value: &str) -> Vec<T> {
        self.objects
            .lock()
            .expect("store lock")
            .values()
            .filter(|o| o.metadata().has_label(label, value))
            .cloned()
            .collect()
    }

    /// Create a new object. The store assigns `resource_version`,
    /// `generation`, and `creation_timestamp`.
    pub async fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.metadata().store_key();
        let mut objects = self.objects.lock().expect("store lock");
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: T::KIND, key });
        }

        let meta = obj.metadata_mut();
        meta.resource_version = 1;
        meta.generation = 1;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;

        objects.insert(key.clone(), obj.clone());
        drop(objects);

        debug!(kind = T::KIND, key = %key, "Object created");
        self.emit(&key, StoreOp::Added);
        Ok(obj)
    }

    /// Update an object via compare-and-swap on `resource_version`.
    ///
    /// Bumps `generation` when the spec changed. Removes the object when the
    /// update clears the last finalizer of a deleting object.
    pub async fn update(&self, obj: T) -> Result<T, StoreError> {
        self.write(obj, true).await
    }

    /// Update only observed state: same compare-and-swap discipline, but the
    /// stored spec and `generation` are retained.
    pub async fn update_status(&self, obj: T) -> Result<T, StoreError> {
        self.write(obj, false).await
    }

    async fn write(&self, mut obj: T, spec_write: bool) -> Result<T, StoreError> {
        let key = obj.metadata().store_key();
        let mut objects = self.objects.lock().expect("store lock");
        let Some(stored) = objects.get(&key) else {
            return Err(StoreError::NotFound { kind: T::KIND, key });
        };

        let given = obj.metadata().resource_version;
        if given != stored.metadata().resource_version || self.take_injected_conflict() {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key,
                given,
            });
        }

        let next_generation = if spec_write && !obj.spec_eq(stored) {
            stored.metadata().generation + 1
        } else {
            stored.metadata().generation
        };
        let creation_timestamp = stored.metadata().creation_timestamp;

        let meta = obj.metadata_mut();
        meta.resource_version = given + 1;
        meta.generation = next_generation;
        meta.creation_timestamp = creation_timestamp;

        let deleting = meta.deletion_timestamp.is_some();
        let finalized = meta.finalizers.is_empty();
        if deleting && finalized {
            objects.remove(&key);
            drop(objects);
            debug!(kind = T::KIND, key = %key, "Finalized object removed");
            self.emit(&key, StoreOp::Deleted);
            return Ok(obj);
        }

        objects.insert(key.clone(), obj.clone());
        drop(objects);
        self.emit(&key, StoreOp::Modified);
        Ok(obj)
    }

    /// Request deletion. Objects with finalizers are stamped with
    /// `deletion_timestamp` and retained; others are removed immediately.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().expect("store lock");
        let Some(stored) = objects.get_mut(key) else {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                key: key.to_string(),
            });
        };

        if stored.metadata().finalizers.is_empty() {
            objects.remove(key);
            drop(objects);
            debug!(kind = T::KIND, key, "Object deleted");
            self.emit(key, StoreOp::Deleted);
            return Ok(());
        }

        if stored.metadata().deletion_timestamp.is_none() {
            let meta = stored.metadata_mut();
            meta.deletion_timestamp = Some(Utc::now());
            meta.resource_version += 1;
            drop(objects);
            debug!(kind = T::KIND, key, "Deletion pending finalizers");
            self.emit(key, StoreOp::Modified);
        }
        Ok(())
    }
}

/// The hub store: one collection per kind plus a shared watch channel.
pub struct HubStore {
    events: broadcast::Sender<StoreEvent>,
    pub placements: Collection<ClusterResourcePlacement>,
    pub policy_snapshots: Collection<ClusterSchedulingPolicySnapshot>,
    pub resource_snapshots: Collection<ClusterResourceSnapshot>,
    pub bindings: Collection<ClusterResourceBinding>,
    pub works: Collection<Work>,
    pub clusters: Collection<MemberCluster>,
}

impl HubStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Arc::new(Self {
            placements: Collection::new(events.clone()),
            policy_snapshots: Collection::new(events.clone()),
            resource_snapshots: Collection::new(events.clone()),
            bindings: Collection::new(events.clone()),
            works: Collection::new(events.clone()),
            clusters: Collection::new(events.clone()),
            events,
        })
    }

    /// Subscribe to all store events. Receivers that fall behind see
    /// `RecvError::Lagged` and should resync with a full list.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::{ObjectMeta, PlacementSpec, ResourceSelector};

    fn crp(name: &str) -> ClusterResourcePlacement {
        ClusterResourcePlacement {
            metadata: ObjectMeta::named(name),
            spec: PlacementSpec {
                resource_selectors: vec![ResourceSelector {
                    group: String::new(),
                    version: "v1".to_string(),
                    kind: "Namespace".to_string(),
                    name: Some("prod".to_string()),
                    label_selector: None,
                }],
                ..Default::default()
            },
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_versions() {
        let store = HubStore::new();
        let created = store.placements.create(crp("crp-1")).await.unwrap();
        assert_eq!(created.metadata.resource_version, 1);
        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.creation_timestamp.is_some());

        let err = store.placements.create(crp("crp-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_cas_conflict() {
        let store = HubStore::new();
        let created = store.placements.create(crp("crp-1")).await.unwrap();

        // First writer wins.
        let mut fresh = created.clone();
        fresh.spec.revision_history_limit = Some(3);
        store.placements.update(fresh).await.unwrap();

        // Second writer holds a stale resource version.
        let mut stale = created;
        stale.spec.revision_history_limit = Some(5);
        let err = store.placements.update(stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_generation_bumps_only_on_spec_change() {
        let store = HubStore::new();
        let created = store.placements.create(crp("crp-1")).await.unwrap();

        // Status-only write: resource version moves, generation does not.
        let updated = store.placements.update_status(created).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);
        assert_eq!(updated.metadata.generation, 1);

        // Spec write bumps generation.
        let mut changed = updated.clone();
        changed.spec.revision_history_limit = Some(2);
        let changed = store.placements.update(changed).await.unwrap();
        assert_eq!(changed.metadata.generation, 2);

        // Spec-identical update does not.
        let same = store.placements.update(changed).await.unwrap();
        assert_eq!(same.metadata.generation, 2);
        assert_eq!(same.metadata.resource_version, 4);
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let store = HubStore::new();
        let mut a = crp("crp-a");
        a.metadata
            .labels
            .insert("team".to_string(), "red".to_string());
        let mut b = crp("crp-b");
        b.metadata
            .labels
            .insert("team".to_string(), "blue".to_string());
        store.placements.create(a).await.unwrap();
        store.placements.create(b).await.unwrap();

        let red = store.placements.list_by_label("team", "red").await;
        assert_eq!(red.len(), 1);
        assert_eq!(red[0].metadata.name, "crp-a");
    }

    #[tokio::test]
    async fn test_delete_honors_finalizers() {
        let store = HubStore::new();
        let mut obj = crp("crp-1");
        obj.metadata.finalizers.push("blocker".to_string());
        store.placements.create(obj).await.unwrap();

        store.placements.delete("crp-1").await.unwrap();
        let pending = store.placements.get("crp-1").await.unwrap();
        assert!(pending.metadata.is_deleting());

        // Clearing the finalizer completes the deletion.
        let mut cleared = pending;
        cleared.metadata.finalizers.clear();
        store.placements.update(cleared).await.unwrap();
        assert!(store.placements.get("crp-1").await.is_none());
    }

    #[tokio::test]
    async fn test_watch_events() {
        let store = HubStore::new();
        let mut rx = store.subscribe();

        store.placements.create(crp("crp-1")).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ClusterResourcePlacement::KIND);
        assert_eq!(event.key, "crp-1");
        assert_eq!(event.op, StoreOp::Added);

        store.placements.delete("crp-1").await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.op, StoreOp::Deleted);
    }

    #[tokio::test]
    async fn test_injected_conflicts_exhaust() {
        let store = HubStore::new();
        let created = store.placements.create(crp("crp-1")).await.unwrap();
        store.placements.inject_conflicts(2);

        let err = store.placements.update_status(created.clone()).await;
        assert!(err.is_err());
        let err = store.placements.update_status(created.clone()).await;
        assert!(err.is_err());

        // Third attempt goes through.
        store.placements.update_status(created).await.unwrap();
    }
}
