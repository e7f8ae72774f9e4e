//! Shared object metadata and the `HubObject` contract.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata carried by every hub object.
///
/// `resource_version` and `generation` are owned by the store:
/// `resource_version` increments on every write, `generation` only when the
/// spec changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    /// Empty for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Bumped by the store on spec change.
    #[serde(default)]
    pub generation: i64,

    /// Bumped by the store on every write; compare-and-swap token.
    #[serde(default)]
    pub resource_version: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Set when deletion has been requested but finalizers remain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a named, cluster-scoped object.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The key an object is stored and queued under:
    /// `<name>` for cluster-scoped objects, `<namespace>/<name>` otherwise.
    pub fn store_key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// Whether a label is present with the given value.
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).is_some_and(|v| v == value)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Contract every hub object satisfies so the store can manage it
/// generically.
pub trait HubObject: Clone + Send + Sync + 'static {
    /// Stable kind string, used for watch events and queue routing.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Whether the specs of two revisions are equal. The store bumps
    /// `generation` exactly when this returns false across an update.
    fn spec_eq(&self, other: &Self) -> bool;
}

/// An integer count or a percentage of a target, as used by rollout
/// strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntOrPercent {
    Int(u32),
    Percent(u32),
}

/// Rounding mode when resolving a percentage against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Up,
    Down,
}

impl IntOrPercent {
    /// Resolve against a target count. Percentages round per `rounding`.
    pub fn resolve(&self, target: u32, rounding: Rounding) -> u32 {
        match *self {
            IntOrPercent::Int(n) => n,
            IntOrPercent::Percent(pct) => {
                let scaled = u64::from(target) * u64::from(pct);
                let resolved = match rounding {
                    Rounding::Down => scaled / 100,
                    Rounding::Up => scaled.div_ceil(100),
                };
                resolved as u32
            }
        }
    }

    /// Whether this is the literal integer zero (as opposed to a percentage
    /// that resolves to zero).
    pub fn is_explicit_zero(&self) -> bool {
        matches!(self, IntOrPercent::Int(0))
    }
}
