//! Structural diff between a desired and an observed JSON object tree.
//!
//! The rules here are bespoke to the reconciler's needs (observed-only keys
//! are server-managed noise, a whole-array replace on length mismatch, a
//! deliberate asymmetry between `null` and a missing key) rather than a
//! general-purpose JSON-diff algorithm, so no existing diff crate is reused.

use serde_json::Value;

const METADATA_KEYS_TO_DROP: &[&str] = &[
    "creationTimestamp",
    "deletionTimestamp",
    "generation",
    "resourceVersion",
    "selfLink",
    "uid",
    "managedFields",
    "ownerReferences",
    "finalizers",
];

/// One structural disagreement between desired and observed state.
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    pub path: String,
    pub desired: Value,
    pub observed: Value,
}

/// Strips fields that are server-managed noise rather than user intent, so
/// that comparing a freshly-rendered desired object against a previously
/// observed one doesn't manufacture spurious diffs.
///
/// Idempotent: `clean_metadata(clean_metadata(v)) == clean_metadata(v)`.
pub fn clean_metadata(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        if let Some(Value::Object(metadata)) = obj.get_mut("metadata") {
            for key in METADATA_KEYS_TO_DROP {
                metadata.remove(*key);
            }
            for key in ["labels", "annotations"] {
                let is_empty = matches!(metadata.get(key), Some(Value::Object(m)) if m.is_empty());
                if is_empty {
                    metadata.remove(key);
                }
            }
        }
    }
    value
}

/// Compares `desired` against `observed`, both already metadata-cleaned by
/// the caller (typically via [`clean_metadata`]), and returns every path at
/// which they disagree.
pub fn compare(desired: &Value, observed: &Value) -> Vec<Difference> {
    let mut out = Vec::new();
    walk("", desired, Some(observed), &mut out);
    out
}

fn walk(path: &str, desired: &Value, observed: Option<&Value>, out: &mut Vec<Difference>) {
    match desired {
        Value::Object(desired_map) => {
            let observed_map = observed.and_then(Value::as_object);
            for (key, desired_val) in desired_map {
                let child_path = join_path(path, key);
                match observed_map.and_then(|m| m.get(key)) {
                    Some(observed_val) => walk(&child_path, desired_val, Some(observed_val), out),
                    None => {
                        // Missing key in observed: `null` in desired matches an
                        // absent key (treated as "not set"); anything else,
                        // including an empty map, is a real difference.
                        if !desired_val.is_null() {
                            out.push(Difference {
                                path: child_path,
                                desired: desired_val.clone(),
                                observed: Value::Null,
                            });
                        }
                    }
                }
            }
        }
        Value::Array(desired_arr) => match observed.and_then(Value::as_array) {
            Some(observed_arr) if observed_arr.len() == desired_arr.len() => {
                for (i, (d, o)) in desired_arr.iter().zip(observed_arr.iter()).enumerate() {
                    walk(&format!("{path}[{i}]"), d, Some(o), out);
                }
            }
            Some(observed_arr) => out.push(Difference {
                path: path.to_string(),
                desired: Value::Array(desired_arr.clone()),
                observed: Value::Array(observed_arr.clone()),
            }),
            None => out.push(Difference {
                path: path.to_string(),
                desired: desired.clone(),
                observed: observed.cloned().unwrap_or(Value::Null),
            }),
        },
        primitive => {
            let observed_val = observed.unwrap_or(&Value::Null);
            if primitive != observed_val {
                out.push(Difference {
                    path: path.to_string(),
                    desired: primitive.clone(),
                    observed: observed_val.clone(),
                });
            }
        }
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_diff_when_desired_is_subset_match() {
        let desired = json!({"spec": {"replicas": 3}});
        let observed = json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 3}});
        assert_eq!(compare(&desired, &observed), vec![]);
    }

    #[test]
    fn missing_key_with_non_null_desired_diffs() {
        let desired = json!({"spec": {"replicas": 3}});
        let observed = json!({"spec": {}});
        let diffs = compare(&desired, &observed);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "spec.replicas");
    }

    #[test]
    fn empty_map_in_desired_vs_missing_key_diffs() {
        let desired = json!({"metadata": {"labels": {}}});
        let observed = json!({});
        let diffs = compare(&desired, &observed);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "metadata.labels");
    }

    #[test]
    fn null_in_desired_vs_missing_key_does_not_diff() {
        let desired = json!({"spec": {"suspend": null}});
        let observed = json!({"spec": {}});
        assert_eq!(compare(&desired, &observed), vec![]);
    }

    #[test]
    fn array_length_mismatch_is_one_diff_at_parent_path() {
        let desired = json!({"spec": {"ports": [1, 2, 3]}});
        let observed = json!({"spec": {"ports": [1, 2]}});
        let diffs = compare(&desired, &observed);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "spec.ports");
    }

    #[test]
    fn array_same_length_recurses_by_index() {
        let desired = json!({"spec": {"ports": [1, 9]}});
        let observed = json!({"spec": {"ports": [1, 2]}});
        let diffs = compare(&desired, &observed);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "spec.ports[1]");
    }

    #[test]
    fn observed_only_keys_are_ignored() {
        let desired = json!({"spec": {"a": 1}});
        let observed = json!({"spec": {"a": 1, "b": 2}});
        assert_eq!(compare(&desired, &observed), vec![]);
    }

    #[test]
    fn clean_metadata_drops_server_fields_and_empty_label_maps() {
        let obj = json!({
            "metadata": {
                "name": "x",
                "resourceVersion": "123",
                "uid": "abc",
                "managedFields": [{}],
                "labels": {},
                "annotations": {"keep": "me"},
            }
        });
        let cleaned = clean_metadata(obj);
        assert_eq!(
            cleaned,
            json!({"metadata": {"name": "x", "annotations": {"keep": "me"}}})
        );
    }

    #[test]
    fn clean_metadata_is_idempotent() {
        let obj = json!({"metadata": {"resourceVersion": "1", "name": "x"}});
        let once = clean_metadata(obj.clone());
        let twice = clean_metadata(once.clone());
        assert_eq!(once, twice);
    }
}
