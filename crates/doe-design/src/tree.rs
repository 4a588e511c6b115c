//! Key-path helpers over `serde_json::Value` documents.
//!
//! Paths only descend through mappings. Lists, scalars and empty mappings are
//! leaves.

use serde_json::{json, Value};

pub type KeyPath = Vec<String>;

pub fn format_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

pub fn key_path(dotted: &str) -> KeyPath {
    dotted.split('.').map(|s| s.to_string()).collect()
}

/// All leaf paths of a mapping, in key order.
pub fn leaf_paths(value: &Value) -> Vec<KeyPath> {
    let mut out = Vec::new();
    if let Value::Object(map) = value {
        let mut prefix = Vec::new();
        for (key, child) in map {
            prefix.push(key.clone());
            collect_leaves(child, &mut prefix, &mut out);
            prefix.pop();
        }
    }
    out
}

fn collect_leaves(value: &Value, prefix: &mut KeyPath, out: &mut Vec<KeyPath>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                prefix.push(key.clone());
                collect_leaves(child, prefix, out);
                prefix.pop();
            }
        }
        _ => out.push(prefix.clone()),
    }
}

pub fn get_path<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = root;
    for token in path {
        cur = cur.as_object()?.get(token)?;
    }
    Some(cur)
}

pub fn get_path_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut cur = root;
    for token in path {
        cur = cur.as_object_mut()?.get_mut(token)?;
    }
    Some(cur)
}

/// True when `path` already exists in `root`, or when one of its prefixes
/// holds a non-mapping value that would have to be replaced to create it.
pub fn is_occupied(root: &Value, path: &[String]) -> bool {
    let mut cur = root;
    for token in path {
        match cur {
            Value::Object(map) => match map.get(token) {
                Some(next) => cur = next,
                None => return false,
            },
            _ => return true,
        }
    }
    true
}

/// Sets `path` to `new_value`, creating intermediate mappings as needed.
pub fn set_path(root: &mut Value, path: &[String], new_value: Value) -> Result<(), String> {
    let Some((last, parents)) = path.split_last() else {
        *root = new_value;
        return Ok(());
    };

    let mut cur = root;
    for token in parents {
        match cur {
            Value::Object(map) => {
                cur = map.entry(token.clone()).or_insert_with(|| json!({}));
            }
            _ => {
                return Err(format!(
                    "path traversal hit non-mapping at '{}' in {}",
                    token,
                    format_path(path)
                ));
            }
        }
    }

    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), new_value);
            Ok(())
        }
        _ => Err(format!(
            "path target parent is not a mapping for {}",
            format_path(path)
        )),
    }
}

pub fn remove_path(root: &mut Value, path: &[String]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    get_path_mut(root, parents)?.as_object_mut()?.remove(last)
}

/// Merges `overlay` onto `base`: mappings merge key-wise, every other value
/// replaces the base value wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Structural containment: every key/value of `filter` is present in `doc`,
/// recursing into mappings. Non-mapping values must be equal.
pub fn contains(doc: &Value, filter: &Value) -> bool {
    match (doc, filter) {
        (Value::Object(doc_map), Value::Object(filter_map)) => {
            filter_map.iter().all(|(key, expected)| {
                doc_map
                    .get(key)
                    .map(|actual| contains(actual, expected))
                    .unwrap_or(false)
            })
        }
        (doc, filter) => doc == filter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_paths_stop_at_lists_and_empty_maps() {
        let doc = json!({"a": {"b": 1, "c": [1, 2]}, "d": {}, "e": "x"});
        let paths: Vec<String> = leaf_paths(&doc).iter().map(|p| format_path(p)).collect();
        assert_eq!(paths, vec!["a.b", "a.c", "d", "e"]);
    }

    #[test]
    fn set_path_creates_intermediate_maps() {
        let mut doc = json!({"a": 1});
        set_path(&mut doc, &key_path("x.y.z"), json!(3)).expect("set");
        assert_eq!(doc, json!({"a": 1, "x": {"y": {"z": 3}}}));
        let err = set_path(&mut doc, &key_path("a.b"), json!(1)).expect_err("non-mapping");
        assert!(err.contains("a.b"), "unexpected error: {}", err);
    }

    #[test]
    fn deep_merge_replaces_lists_wholesale() {
        let mut base = json!({"a": {"b": 1, "l": [1, 2, 3]}, "k": "v"});
        deep_merge(&mut base, &json!({"a": {"c": 2, "l": [9]}}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 2, "l": [9]}, "k": "v"}));
    }

    #[test]
    fn deep_merge_replaces_mapping_with_scalar() {
        let mut base = json!({"mode": {"x": 1}});
        deep_merge(&mut base, &json!({"mode": "fast"}));
        assert_eq!(base, json!({"mode": "fast"}));
    }

    #[test]
    fn contains_matches_nested_subsets_only() {
        let doc = json!({"a": {"b": 1, "c": 2}, "l": [1, 2]});
        assert!(contains(&doc, &json!({"a": {"b": 1}})));
        assert!(contains(&doc, &json!({"l": [1, 2]})));
        assert!(!contains(&doc, &json!({"l": [1]})));
        assert!(!contains(&doc, &json!({"a": {"b": 2}})));
        assert!(!contains(&doc, &json!({"missing": 1})));
    }

    #[test]
    fn is_occupied_treats_scalar_prefix_as_taken() {
        let doc = json!({"a": 1, "m": {"x": 1}});
        assert!(is_occupied(&doc, &key_path("a")));
        assert!(is_occupied(&doc, &key_path("a.b")));
        assert!(is_occupied(&doc, &key_path("m.x")));
        assert!(!is_occupied(&doc, &key_path("m.y")));
        assert!(!is_occupied(&doc, &key_path("z")));
    }
}
