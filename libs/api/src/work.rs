//! The Work contract: manifest bundles delivered to one member cluster.

use serde::{Deserialize, Serialize};

use crate::{Condition, HubObject, ObjectMeta, ResourceIdentifier};

/// A bundle of manifests targeted at one member cluster.
///
/// Works live in the target cluster's hub namespace and are labelled back to
/// their owning binding and CRP. The apply agent on the member side reports
/// per-manifest status into `WorkStatus`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub metadata: ObjectMeta,
    pub spec: WorkSpec,
    #[serde(default)]
    pub status: WorkStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    /// Manifests in ordinal order.
    pub workload: Vec<Manifest>,
}

/// One manifest inside a Work, with its stable ordinal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Position in the workload; stable across updates while the manifest
    /// set is unchanged.
    pub ordinal: usize,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkStatus {
    /// Work-level Applied and Available conditions, with
    /// `observed_generation` matching the Work generation they report on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifest_conditions: Vec<ManifestCondition>,
}

/// Per-manifest status keyed by ordinal plus identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestCondition {
    pub identifier: WorkResourceIdentifier,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Identity of one manifest inside a Work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkResourceIdentifier {
    pub ordinal: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl WorkResourceIdentifier {
    pub fn to_identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            envelope: None,
        }
    }
}

/// A manifest that failed to apply or become available, surfaced on binding
/// and CRP statuses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedResourcePlacement {
    pub resource_identifier: ResourceIdentifier,
    pub condition: Condition,
}

impl HubObject for Work {
    const KIND: &'static str = "Work";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}
