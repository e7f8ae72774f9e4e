//! Member cluster inventory types.

use serde::{Deserialize, Serialize};

use crate::{HubObject, ObjectMeta};

/// A member cluster as seen by the hub.
///
/// The scheduler only consumes labels (affinity, topology spread) and taints;
/// membership lifecycle is managed elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberCluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MemberClusterSpec,
    #[serde(default)]
    pub status: MemberClusterStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberClusterSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberClusterStatus {
    /// Whether the member agent has joined and is heartbeating.
    #[serde(default)]
    pub joined: bool,
}

impl HubObject for MemberCluster {
    const KIND: &'static str = "MemberCluster";

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

/// A taint repelling placements that do not tolerate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintEffect {
    NoSchedule,
}

/// A toleration carried by a placement policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub operator: TolerationOperator,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<TaintEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TolerationOperator {
    /// Key must exist; value is ignored.
    Exists,
    /// Key and value must both match.
    Equal,
}

impl Toleration {
    /// Whether this toleration tolerates the given taint.
    ///
    /// An empty key with `Exists` tolerates every taint. An absent effect
    /// tolerates every effect.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str, value: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.to_string(),
            effect: TaintEffect::NoSchedule,
        }
    }

    #[test]
    fn test_tolerates_equal() {
        let toleration = Toleration {
            key: "dedicated".to_string(),
            operator: TolerationOperator::Equal,
            value: "batch".to_string(),
            effect: Some(TaintEffect::NoSchedule),
        };
        assert!(toleration.tolerates(&taint("dedicated", "batch")));
        assert!(!toleration.tolerates(&taint("dedicated", "web")));
        assert!(!toleration.tolerates(&taint("other", "batch")));
    }

    #[test]
    fn test_tolerates_exists() {
        let toleration = Toleration {
            key: "dedicated".to_string(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        assert!(toleration.tolerates(&taint("dedicated", "anything")));
        assert!(!toleration.tolerates(&taint("other", "anything")));
    }

    #[test]
    fn test_empty_key_exists_tolerates_all() {
        let toleration = Toleration {
            key: String::new(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        assert!(toleration.tolerates(&taint("a", "b")));
        assert!(toleration.tolerates(&taint("c", "")));
    }
}
