//! # fleet-api
//!
//! Object model for the Fleet hub (`placement/v1beta1`).
//!
//! ## Design Principles
//!
//! - Objects are plain serde-serializable records; the hub store owns
//!   `resource_version` and `generation`, never the objects themselves
//! - Snapshots are immutable once written; everything that varies over time
//!   lives in a new snapshot, not in a mutated one
//! - Cross-object references are labels and names, never owning pointers
//! - All wire strings (condition types, reasons, labels, annotations) are
//!   constants in this crate and are part of the external contract

mod binding;
mod cluster;
mod condition;
mod keys;
mod meta;
mod placement;
mod selector;
mod snapshot;
mod work;

pub use binding::*;
pub use cluster::*;
pub use condition::*;
pub use keys::*;
pub use meta::*;
pub use placement::*;
pub use selector::*;
pub use snapshot::*;
pub use work::*;

/// Well-known labels, annotations, and finalizers.
pub mod labels {
    /// Label tying a snapshot, binding, or Work back to its owning CRP.
    pub const CRP_TRACKING_LABEL: &str = "kubernetes-fleet.io/parent-CRP";

    /// Label marking the latest snapshot of its kind for a CRP.
    pub const IS_LATEST_SNAPSHOT_LABEL: &str = "kubernetes-fleet.io/is-latest-snapshot";

    /// Label tying a Work back to its owning resource binding.
    pub const PARENT_BINDING_LABEL: &str = "kubernetes-fleet.io/parent-resource-binding";

    /// Label holding the resource index a master or sub-snapshot belongs to.
    pub const RESOURCE_INDEX_LABEL: &str = "kubernetes-fleet.io/resource-index";

    /// Envelope labels carried by Works whose manifests were unwrapped from
    /// an envelope resource.
    pub const ENVELOPE_NAME_LABEL: &str = "kubernetes-fleet.io/envelope-name";
    pub const ENVELOPE_NAMESPACE_LABEL: &str = "kubernetes-fleet.io/envelope-namespace";
    pub const ENVELOPE_TYPE_LABEL: &str = "kubernetes-fleet.io/envelope-type";

    /// Annotation holding the subindex of a resource sub-snapshot.
    /// Non-negative integer; `-1` is illegal.
    pub const SUBINDEX_OF_RESOURCE_SNAPSHOT_ANNOTATION: &str =
        "kubernetes-fleet.io/subindex-of-resource-snapshot";

    /// Annotation on a master resource snapshot holding the total number of
    /// snapshots (master plus children) in the group.
    pub const NUMBER_OF_RESOURCE_SNAPSHOTS_ANNOTATION: &str =
        "kubernetes-fleet.io/number-of-resource-snapshots";

    /// Annotation on a PickN policy snapshot holding the requested cluster
    /// count.
    pub const NUMBER_OF_CLUSTERS_ANNOTATION: &str = "kubernetes-fleet.io/number-of-clusters";

    /// Annotation holding the CRP generation a policy snapshot was taken at.
    pub const CRP_GENERATION_ANNOTATION: &str = "kubernetes-fleet.io/CRP-generation";

    /// Annotation holding the content hash of a snapshot.
    pub const SNAPSHOT_HASH_ANNOTATION: &str = "kubernetes-fleet.io/snapshot-hash";

    /// Finalizer blocking CRP deletion until bindings and Works are gone.
    pub const CRP_CLEANUP_FINALIZER: &str = "kubernetes-fleet.io/crp-cleanup";
}

/// Snapshot and Work naming helpers.
///
/// Policy snapshots are named `<crp>-<policyIndex>`, resource snapshot
/// masters `<crp>-<resourceIndex>-snapshot`, and sub-snapshots
/// `<crp>-<resourceIndex>-<subindex>`.
pub mod names {
    /// Name of the policy snapshot with the given index.
    pub fn policy_snapshot_name(crp: &str, policy_index: i64) -> String {
        format!("{crp}-{policy_index}")
    }

    /// Name of the master resource snapshot with the given index.
    pub fn resource_snapshot_master_name(crp: &str, resource_index: i64) -> String {
        format!("{crp}-{resource_index}-snapshot")
    }

    /// Name of a resource sub-snapshot.
    pub fn resource_snapshot_sub_name(crp: &str, resource_index: i64, subindex: i64) -> String {
        format!("{crp}-{resource_index}-{subindex}")
    }

    /// Namespace holding the Works destined for one member cluster.
    pub fn cluster_namespace(cluster: &str) -> String {
        format!("fleet-member-{cluster}")
    }

    /// Recover the owning CRP name from a policy snapshot name
    /// (`<crp>-<policyIndex>`).
    pub fn crp_of_policy_snapshot(name: &str) -> Option<&str> {
        let (crp, index) = name.rsplit_once('-')?;
        index.parse::<u64>().ok()?;
        Some(crp)
    }

    /// Recover the owning CRP name from a Work name (`<crp>-work` or
    /// `<crp>-<subindex>`).
    pub fn crp_of_work_name(name: &str) -> Option<&str> {
        if let Some(crp) = name.strip_suffix("-work") {
            return Some(crp);
        }
        crp_of_policy_snapshot(name)
    }

    /// Recover the owning CRP name from a resource snapshot name, master
    /// (`<crp>-<idx>-snapshot`) or sub (`<crp>-<idx>-<subindex>`).
    pub fn crp_of_resource_snapshot(name: &str) -> Option<&str> {
        let stem = match name.strip_suffix("-snapshot") {
            Some(stem) => stem,
            None => {
                let (stem, subindex) = name.rsplit_once('-')?;
                subindex.parse::<u64>().ok()?;
                stem
            }
        };
        crp_of_policy_snapshot(stem)
    }

}
