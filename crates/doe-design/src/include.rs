use std::path::Path;

use serde_json::Value;

use crate::error::{DesignError, Result};
use crate::tree::{
    format_path, get_path, get_path_mut, is_occupied, leaf_paths, remove_path, set_path,
};
use crate::{load_yaml_document, INCLUDE_VARS, MAX_INCLUDE_ROUNDS};

/// Which leaf paths an inclusion added and which it left alone because the
/// target already had them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InclusionReport {
    pub included: Vec<String>,
    pub skipped: Vec<String>,
}

impl InclusionReport {
    fn extend(&mut self, other: InclusionReport) {
        self.included.extend(other.included);
        self.skipped.extend(other.skipped);
    }
}

/// Copies every leaf of `source` into `target` unless the path is already
/// present there. The target always wins.
pub fn include_vars(target: &mut Value, source: &Value) -> Result<InclusionReport> {
    let mut report = InclusionReport::default();
    for path in leaf_paths(source) {
        let dotted = format_path(&path);
        if is_occupied(target, &path) {
            report.skipped.push(dotted);
            continue;
        }
        let value = get_path(source, &path).cloned().unwrap_or(Value::Null);
        set_path(target, &path, value).map_err(DesignError::Inclusion)?;
        report.included.push(dotted);
    }
    Ok(report)
}

/// Replaces every `$INCLUDE_VARS$` marker in `target` with the content of the
/// referenced files, resolved against `vars_dir`.
///
/// Removing a marker changes the tree being walked, so each round takes a
/// fresh snapshot of leaf paths and applies at most one marker.
pub fn resolve_includes(target: &mut Value, vars_dir: &Path) -> Result<InclusionReport> {
    let mut report = InclusionReport::default();
    let mut rounds = 0usize;
    loop {
        if let Some(listed) = marker_in_list(target, &mut Vec::new(), false) {
            return Err(DesignError::Inclusion(format!(
                "{} cannot appear inside a list, found at {}",
                INCLUDE_VARS,
                format_path(&listed)
            )));
        }
        let paths = leaf_paths(target);
        if let Some(nested) = paths
            .iter()
            .find(|p| p.iter().rev().skip(1).any(|seg| seg == INCLUDE_VARS))
        {
            return Err(DesignError::Inclusion(format!(
                "{} must hold a file name or a list of file names, found a mapping at {}",
                INCLUDE_VARS,
                format_path(nested)
            )));
        }
        let Some(marker) = paths
            .into_iter()
            .find(|p| p.last().map(String::as_str) == Some(INCLUDE_VARS))
        else {
            return Ok(report);
        };

        rounds += 1;
        if rounds > MAX_INCLUDE_ROUNDS {
            return Err(DesignError::Inclusion(format!(
                "more than {} inclusion rounds, likely an inclusion cycle (last marker at {})",
                MAX_INCLUDE_ROUNDS,
                format_path(&marker)
            )));
        }

        let raw = remove_path(target, &marker).unwrap_or(Value::Null);
        let files = include_file_names(&raw, &marker)?;
        let parent = &marker[..marker.len() - 1];
        for file in files {
            let content = load_vars_file(vars_dir, &file)?;
            let scope = get_path_mut(target, parent).ok_or_else(|| {
                DesignError::Inclusion(format!(
                    "inclusion point {} disappeared",
                    format_path(parent)
                ))
            })?;
            let included = include_vars(scope, &content)?;
            tracing::debug!(
                file = %file,
                at = %format_path(parent),
                included = included.included.len(),
                skipped = included.skipped.len(),
                "included vars file"
            );
            report.extend(included);
        }
    }
}

fn marker_in_list(value: &Value, path: &mut Vec<String>, in_list: bool) -> Option<Vec<String>> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                path.push(key.clone());
                if in_list && key == INCLUDE_VARS {
                    return Some(path.clone());
                }
                let found = marker_in_list(child, path, in_list);
                path.pop();
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                path.push(idx.to_string());
                let found = marker_in_list(child, path, true);
                path.pop();
                if found.is_some() {
                    return found;
                }
            }
            None
        }
        _ => None,
    }
}

fn include_file_names(raw: &Value, marker: &[String]) -> Result<Vec<String>> {
    match raw {
        Value::String(file) => Ok(vec![file.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(|s| s.to_string()).ok_or_else(|| {
                    DesignError::Inclusion(format!(
                        "{} list must only contain file names",
                        format_path(marker)
                    ))
                })
            })
            .collect(),
        _ => Err(DesignError::Inclusion(format!(
            "{} must be a file name or a list of file names",
            format_path(marker)
        ))),
    }
}

fn load_vars_file(vars_dir: &Path, file: &str) -> Result<Value> {
    let path = vars_dir.join(file);
    if !path.is_file() {
        return Err(DesignError::Inclusion(format!(
            "vars file not found: {}",
            path.display()
        )));
    }
    let content = load_yaml_document(&path)?;
    if !content.is_object() {
        return Err(DesignError::Inclusion(format!(
            "vars file must contain a mapping: {}",
            path.display()
        )));
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn include_vars_never_overwrites_existing_values() {
        let mut target = json!({"a": 1, "nested": {"x": "mine"}, "scalar": 5});
        let source = json!({"a": 2, "b": 3, "nested": {"x": "theirs", "y": 4}, "scalar": {"deep": 1}});
        let report = include_vars(&mut target, &source).expect("include");
        assert_eq!(
            target,
            json!({"a": 1, "b": 3, "nested": {"x": "mine", "y": 4}, "scalar": 5})
        );
        assert_eq!(report.included, vec!["b", "nested.y"]);
        assert_eq!(report.skipped, vec!["a", "nested.x", "scalar.deep"]);
    }

    #[test]
    fn resolve_includes_merges_files_at_marker_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("net.yml"), "latency: 10\nbandwidth: 100\n").expect("net");
        fs::write(dir.path().join("more.yml"), "bandwidth: 5\nloss: 0.1\n").expect("more");
        let mut target = json!({
            "net": {"$INCLUDE_VARS$": ["net.yml", "more.yml"], "latency": 1},
            "other": 2
        });
        let report = resolve_includes(&mut target, dir.path()).expect("resolve");
        assert_eq!(
            target,
            json!({"net": {"latency": 1, "bandwidth": 100, "loss": 0.1}, "other": 2})
        );
        assert_eq!(report.skipped, vec!["latency", "bandwidth"]);
    }

    #[test]
    fn resolve_includes_follows_nested_markers() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.yml"), "a: 1\n$INCLUDE_VARS$: b.yml\n").expect("a");
        fs::write(dir.path().join("b.yml"), "b: 2\n").expect("b");
        let mut target = json!({"$INCLUDE_VARS$": "a.yml"});
        resolve_includes(&mut target, dir.path()).expect("resolve");
        assert_eq!(target, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn resolve_includes_detects_cycles() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("loop.yml"), "$INCLUDE_VARS$: loop.yml\n").expect("loop");
        let mut target = json!({"$INCLUDE_VARS$": "loop.yml"});
        let err = resolve_includes(&mut target, dir.path()).expect_err("cycle");
        assert!(err.to_string().contains("cycle"), "unexpected: {}", err);
    }

    #[test]
    fn resolve_includes_rejects_malformed_markers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut numeric = json!({"$INCLUDE_VARS$": 3});
        assert!(resolve_includes(&mut numeric, dir.path()).is_err());
        let mut nested = json!({"$INCLUDE_VARS$": {"file": "x.yml"}});
        assert!(resolve_includes(&mut nested, dir.path()).is_err());
        let mut missing = json!({"$INCLUDE_VARS$": "nope.yml"});
        let err = resolve_includes(&mut missing, dir.path()).expect_err("missing");
        assert!(err.to_string().contains("not found"), "unexpected: {}", err);
    }

    #[test]
    fn resolve_includes_rejects_markers_inside_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("x.yml"), "a: 1\n").expect("x");
        let mut target = json!({"l": [{"$INCLUDE_VARS$": "x.yml"}]});
        let err = resolve_includes(&mut target, dir.path()).expect_err("listed marker");
        assert_eq!(err.code(), "inclusion_error");
        assert!(
            err.to_string().contains("l.0.$INCLUDE_VARS$"),
            "unexpected: {}",
            err
        );
    }
}
