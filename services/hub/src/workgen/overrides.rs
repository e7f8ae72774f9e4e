//! Override application: JSON patches over manifest documents.
//!
//! Cluster-resource-level overrides apply before resource-level overrides,
//! each list in declaration order. Two operations writing different values
//! to the same path of the same manifest conflict and fail the whole set;
//! overrides are all-or-nothing per binding.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use fleet_api::{
    ClusterWideKey, JsonPatchOp, JsonPatchVerb, OverrideRule, PlacementOverrides, ResourceSelector,
};

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("conflicting override operations on path {path}")]
    Conflict { path: String },

    #[error("invalid patch path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Apply all override rules to the manifest list, in place.
///
/// Returns the number of patch operations applied.
pub fn apply_overrides(
    manifests: &mut [Value],
    overrides: &PlacementOverrides,
) -> Result<usize, OverrideError> {
    let mut applied = 0usize;
    // (manifest index, path) -> value written, for conflict detection.
    let mut written: HashMap<(usize, String), Option<Value>> = HashMap::new();

    for rule in overrides
        .cluster_resource_overrides
        .iter()
        .chain(overrides.resource_overrides.iter())
    {
        applied += apply_rule(manifests, rule, &mut written)?;
    }
    Ok(applied)
}

fn apply_rule(
    manifests: &mut [Value],
    rule: &OverrideRule,
    written: &mut HashMap<(usize, String), Option<Value>>,
) -> Result<usize, OverrideError> {
    let mut applied = 0usize;
    for (index, manifest) in manifests.iter_mut().enumerate() {
        if !selector_matches(&rule.resource_selector, manifest) {
            continue;
        }
        for op in &rule.json_patch {
            let intent = match op.op {
                JsonPatchVerb::Remove => None,
                _ => Some(op.value.clone().unwrap_or(Value::Null)),
            };
            match written.get(&(index, op.path.clone())) {
                Some(previous) if previous != &intent => {
                    return Err(OverrideError::Conflict {
                        path: op.path.clone(),
                    });
                }
                Some(_) => {
                    // Identical operation from another rule; already applied.
                    continue;
                }
                None => {}
            }
            apply_patch_op(manifest, op)?;
            written.insert((index, op.path.clone()), intent);
            applied += 1;
        }
    }
    Ok(applied)
}

fn selector_matches(selector: &ResourceSelector, manifest: &Value) -> bool {
    let Some(key) = ClusterWideKey::for_manifest(manifest) else {
        return false;
    };
    if key.group != selector.group || key.kind != selector.kind {
        return false;
    }
    if !selector.version.is_empty() && key.version != selector.version {
        return false;
    }
    match &selector.name {
        Some(name) => &key.name == name,
        None => true,
    }
}

/// Apply one add/replace/remove operation at a JSON pointer path.
fn apply_patch_op(doc: &mut Value, op: &JsonPatchOp) -> Result<(), OverrideError> {
    let invalid = |reason: &str| OverrideError::InvalidPath {
        path: op.path.clone(),
        reason: reason.to_string(),
    };

    let (parent_path, leaf) = split_pointer(&op.path).ok_or_else(|| invalid("not a pointer"))?;
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or_else(|| invalid("parent does not exist"))?;

    match op.op {
        JsonPatchVerb::Add | JsonPatchVerb::Replace => {
            let value = op.value.clone().unwrap_or(Value::Null);
            match parent {
                Value::Object(map) => {
                    if op.op == JsonPatchVerb::Replace && !map.contains_key(&leaf) {
                        return Err(invalid("replace target does not exist"));
                    }
                    map.insert(leaf, value);
                }
                Value::Array(items) => {
                    if leaf == "-" {
                        items.push(value);
                    } else {
                        let index: usize =
                            leaf.parse().map_err(|_| invalid("bad array index"))?;
                        match op.op {
                            JsonPatchVerb::Add => {
                                if index > items.len() {
                                    return Err(invalid("array index out of bounds"));
                                }
                                items.insert(index, value);
                            }
                            _ => {
                                if index >= items.len() {
                                    return Err(invalid("array index out of bounds"));
                                }
                                items[index] = value;
                            }
                        }
                    }
                }
                _ => return Err(invalid("parent is not a container")),
            }
        }
        JsonPatchVerb::Remove => match parent {
            Value::Object(map) => {
                if map.remove(&leaf).is_none() {
                    return Err(invalid("remove target does not exist"));
                }
            }
            Value::Array(items) => {
                let index: usize = leaf.parse().map_err(|_| invalid("bad array index"))?;
                if index >= items.len() {
                    return Err(invalid("array index out of bounds"));
                }
                items.remove(index);
            }
            _ => return Err(invalid("parent is not a container")),
        },
    }
    Ok(())
}

/// Split a JSON pointer into its parent pointer and unescaped leaf token.
fn split_pointer(path: &str) -> Option<(&str, String)> {
    if !path.starts_with('/') {
        return None;
    }
    let split_at = path.rfind('/')?;
    let leaf = path[split_at + 1..].replace("~1", "/").replace("~0", "~");
    Some((&path[..split_at], leaf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"replicas": 1},
        })
    }

    fn rule(name: &str, patch: Vec<JsonPatchOp>) -> OverrideRule {
        OverrideRule {
            name: name.to_string(),
            resource_selector: ResourceSelector {
                group: "apps".to_string(),
                version: "v1".to_string(),
                kind: "Deployment".to_string(),
                name: None,
                label_selector: None,
            },
            json_patch: patch,
        }
    }

    fn replace(path: &str, value: Value) -> JsonPatchOp {
        JsonPatchOp {
            op: JsonPatchVerb::Replace,
            path: path.to_string(),
            value: Some(value),
        }
    }

    #[test]
    fn test_replace_applies_to_matching_manifests() {
        let mut manifests = vec![deployment("foo"), json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "svc"}})];
        let overrides = PlacementOverrides {
            cluster_resource_overrides: vec![rule("r1", vec![replace("/spec/replicas", json!(5))])],
            resource_overrides: Vec::new(),
        };

        let applied = apply_overrides(&mut manifests, &overrides).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(manifests[0]["spec"]["replicas"], json!(5));
    }

    #[test]
    fn test_conflicting_values_fail() {
        let mut manifests = vec![deployment("foo")];
        let overrides = PlacementOverrides {
            cluster_resource_overrides: vec![
                rule("r1", vec![replace("/spec/replicas", json!(5))]),
                rule("r2", vec![replace("/spec/replicas", json!(7))]),
            ],
            resource_overrides: Vec::new(),
        };

        let err = apply_overrides(&mut manifests, &overrides).unwrap_err();
        assert!(matches!(err, OverrideError::Conflict { .. }));
    }

    #[test]
    fn test_identical_operations_do_not_conflict() {
        let mut manifests = vec![deployment("foo")];
        let overrides = PlacementOverrides {
            cluster_resource_overrides: vec![
                rule("r1", vec![replace("/spec/replicas", json!(5))]),
                rule("r2", vec![replace("/spec/replicas", json!(5))]),
            ],
            resource_overrides: Vec::new(),
        };

        apply_overrides(&mut manifests, &overrides).unwrap();
        assert_eq!(manifests[0]["spec"]["replicas"], json!(5));
    }

    #[test]
    fn test_cluster_level_applies_before_resource_level() {
        let mut manifests = vec![deployment("foo")];
        // Both levels add a distinct field; both must land.
        let overrides = PlacementOverrides {
            cluster_resource_overrides: vec![rule(
                "cluster",
                vec![JsonPatchOp {
                    op: JsonPatchVerb::Add,
                    path: "/metadata/labels".to_string(),
                    value: Some(json!({"tier": "edge"})),
                }],
            )],
            resource_overrides: vec![rule("resource", vec![replace("/spec/replicas", json!(2))])],
        };

        apply_overrides(&mut manifests, &overrides).unwrap();
        assert_eq!(manifests[0]["metadata"]["labels"]["tier"], json!("edge"));
        assert_eq!(manifests[0]["spec"]["replicas"], json!(2));
    }

    #[test]
    fn test_add_and_remove() {
        let mut doc = deployment("foo");
        apply_patch_op(
            &mut doc,
            &JsonPatchOp {
                op: JsonPatchVerb::Add,
                path: "/spec/paused".to_string(),
                value: Some(json!(true)),
            },
        )
        .unwrap();
        assert_eq!(doc["spec"]["paused"], json!(true));

        apply_patch_op(
            &mut doc,
            &JsonPatchOp {
                op: JsonPatchVerb::Remove,
                path: "/spec/paused".to_string(),
                value: None,
            },
        )
        .unwrap();
        assert!(doc["spec"].get("paused").is_none());
    }

    #[test]
    fn test_invalid_paths_are_rejected() {
        let mut doc = deployment("foo");
        let err = apply_patch_op(
            &mut doc,
            &JsonPatchOp {
                op: JsonPatchVerb::Replace,
                path: "/spec/missing/deep".to_string(),
                value: Some(json!(1)),
            },
        )
        .unwrap_err();
        assert!(matches!(err, OverrideError::InvalidPath { .. }));

        let err = apply_patch_op(
            &mut doc,
            &JsonPatchOp {
                op: JsonPatchVerb::Remove,
                path: "/spec/missing".to_string(),
                value: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, OverrideError::InvalidPath { .. }));
    }

    #[test]
    fn test_escaped_pointer_tokens() {
        let mut doc = json!({"metadata": {"annotations": {}}});
        apply_patch_op(
            &mut doc,
            &JsonPatchOp {
                op: JsonPatchVerb::Add,
                path: "/metadata/annotations/example.com~1weight".to_string(),
                value: Some(json!("10")),
            },
        )
        .unwrap();
        assert_eq!(
            doc["metadata"]["annotations"]["example.com/weight"],
            json!("10")
        );
    }
}
