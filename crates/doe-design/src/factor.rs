//! Factor algebra: locating `$FACTOR$` markers, validating `factor_levels`
//! against them and building the cross product of inline levels.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::error::{DesignError, Result};
use crate::tree::{format_path, set_path, KeyPath};
use crate::{FACTOR, MAX_FACTOR_LEVELS};

/// A factor written as `path: {$FACTOR$: [levels]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossFactor {
    pub path: KeyPath,
    pub levels: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactorPlan {
    /// Base config with every factor position holding the bare marker.
    pub skeleton: Value,
    /// Paths written as `path: $FACTOR$`, supplied by `factor_levels`.
    pub level_paths: Vec<KeyPath>,
    pub cross: Vec<CrossFactor>,
}

impl FactorPlan {
    /// Runs produced for `entries` factor_levels entries, before filtering.
    /// Saturates instead of overflowing.
    pub fn run_count(&self, entries: usize) -> usize {
        entries.saturating_mul(self.cross_combinations())
    }

    pub fn cross_combinations(&self) -> usize {
        self.cross
            .iter()
            .fold(1usize, |acc, f| acc.saturating_mul(f.levels.len()))
    }
}

pub fn extract_factors(experiment: &str, base: &Value) -> Result<FactorPlan> {
    let mut level_paths = Vec::new();
    let mut cross = Vec::new();
    let skeleton = walk(experiment, base, &mut Vec::new(), &mut level_paths, &mut cross)?;
    Ok(FactorPlan {
        skeleton,
        level_paths,
        cross,
    })
}

fn walk(
    experiment: &str,
    value: &Value,
    path: &mut KeyPath,
    level_paths: &mut Vec<KeyPath>,
    cross: &mut Vec<CrossFactor>,
) -> Result<Value> {
    match value {
        Value::String(s) if s == FACTOR => {
            level_paths.push(path.clone());
            Ok(value.clone())
        }
        Value::Object(map) if map.contains_key(FACTOR) => {
            if path.is_empty() {
                return Err(DesignError::factor(
                    experiment,
                    format!("{} cannot be a top-level key of base_experiment", FACTOR),
                ));
            }
            if map.len() != 1 {
                return Err(DesignError::factor(
                    experiment,
                    format!(
                        "{} must be the only key at {}",
                        FACTOR,
                        format_path(path)
                    ),
                ));
            }
            let levels = cross_levels(experiment, path, &map[FACTOR])?;
            cross.push(CrossFactor {
                path: path.clone(),
                levels,
            });
            Ok(Value::String(FACTOR.to_string()))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                path.push(key.clone());
                let node = walk(experiment, child, path, level_paths, cross)?;
                path.pop();
                out.insert(key.clone(), node);
            }
            Ok(Value::Object(out))
        }
        Value::Array(_) if contains_marker(value) => Err(DesignError::factor(
            experiment,
            format!(
                "{} inside a list is not supported (at {})",
                FACTOR,
                format_path(path)
            ),
        )),
        _ => Ok(value.clone()),
    }
}

fn cross_levels(experiment: &str, path: &[String], raw: &Value) -> Result<Vec<Value>> {
    let levels = match raw {
        Value::Array(items) if !items.is_empty() => items.clone(),
        Value::String(expr) => match parse_range(expr) {
            Some(Ok(values)) => values.into_iter().map(|v| json!(v)).collect(),
            Some(Err(msg)) => {
                return Err(DesignError::factor(
                    experiment,
                    format!("{} at {}", msg, format_path(path)),
                ))
            }
            None => {
                return Err(DesignError::factor(
                    experiment,
                    format!(
                        "levels at {} must be a list or range(...), got '{}'",
                        format_path(path),
                        expr
                    ),
                ))
            }
        },
        _ => {
            return Err(DesignError::factor(
                experiment,
                format!(
                    "levels at {} must be a non-empty list or range(...)",
                    format_path(path)
                ),
            ))
        }
    };
    if levels.iter().any(contains_marker) {
        return Err(DesignError::factor(
            experiment,
            format!("levels at {} must not contain {}", format_path(path), FACTOR),
        ));
    }
    Ok(levels)
}

fn range_regex() -> &'static Regex {
    static RANGE: OnceLock<Regex> = OnceLock::new();
    RANGE.get_or_init(|| {
        Regex::new(r"^\s*range\(\s*(-?\d+)\s*(?:,\s*(-?\d+)\s*(?:,\s*(-?\d+)\s*)?)?\)\s*$")
            .expect("range pattern is valid")
    })
}

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)` with
/// half-open bounds. Returns `None` when `expr` is not a range expression.
pub fn parse_range(expr: &str) -> Option<std::result::Result<Vec<i64>, String>> {
    let caps = range_regex().captures(expr)?;
    let nums: Vec<i64> = match (1..=3)
        .filter_map(|i| caps.get(i))
        .map(|m| m.as_str().parse::<i64>())
        .collect::<std::result::Result<Vec<_>, _>>()
    {
        Ok(nums) => nums,
        Err(e) => return Some(Err(format!("invalid range bound in '{}': {}", expr, e))),
    };
    let (start, stop, step) = match nums.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return None,
    };
    if step == 0 {
        return Some(Err(format!("range step must not be zero in '{}'", expr)));
    }
    let span = i128::from(stop) - i128::from(start);
    let step_abs = i128::from(step).abs();
    let count = if span.signum() == i128::from(step).signum() {
        (span.abs() + step_abs - 1) / step_abs
    } else {
        0
    };
    if count > MAX_FACTOR_LEVELS as i128 {
        return Some(Err(format!(
            "range '{}' yields {} levels, more than the limit of {}",
            expr, count, MAX_FACTOR_LEVELS
        )));
    }
    let mut values = Vec::new();
    let mut cur = start;
    while (step > 0 && cur < stop) || (step < 0 && cur > stop) {
        values.push(cur);
        cur = match cur.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    if values.is_empty() {
        return Some(Err(format!("range '{}' yields no levels", expr)));
    }
    Some(Ok(values))
}

pub(crate) fn contains_marker(value: &Value) -> bool {
    match value {
        Value::String(s) => s == FACTOR,
        Value::Array(items) => items.iter().any(contains_marker),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| k == FACTOR || contains_marker(v)),
        _ => false,
    }
}

/// Every entry must set exactly the level-list factor paths, nothing more.
pub fn check_factor_levels(
    experiment: &str,
    level_paths: &[KeyPath],
    entries: &[Value],
) -> Result<()> {
    let expected: BTreeSet<&[String]> = level_paths.iter().map(|p| p.as_slice()).collect();
    for (idx, entry) in entries.iter().enumerate() {
        if !entry.is_object() {
            return Err(DesignError::factor(
                experiment,
                format!("factor_levels[{}] must be a mapping", idx),
            ));
        }
        if contains_marker(entry) {
            return Err(DesignError::factor(
                experiment,
                format!("factor_levels[{}] must not contain {}", idx, FACTOR),
            ));
        }
        let mut actual = Vec::new();
        entry_paths(entry, &expected, &mut Vec::new(), &mut actual);
        let actual: BTreeSet<&[String]> = actual.iter().map(|p| p.as_slice()).collect();

        let missing: Vec<String> = expected
            .difference(&actual)
            .map(|p| format_path(p))
            .collect();
        let unexpected: Vec<String> = actual
            .difference(&expected)
            .map(|p| format_path(p))
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(DesignError::factor(
                experiment,
                format!(
                    "factor_levels[{}] does not match the declared factors: missing [{}], unexpected [{}]",
                    idx,
                    missing.join(", "),
                    unexpected.join(", ")
                ),
            ));
        }
    }
    Ok(())
}

fn entry_paths(
    value: &Value,
    factors: &BTreeSet<&[String]>,
    prefix: &mut KeyPath,
    out: &mut Vec<KeyPath>,
) {
    if !prefix.is_empty() && factors.contains(prefix.as_slice()) {
        out.push(prefix.clone());
        return;
    }
    match value {
        Value::Object(map) if !map.is_empty() || prefix.is_empty() => {
            for (key, child) in map {
                prefix.push(key.clone());
                entry_paths(child, factors, prefix, out);
                prefix.pop();
            }
        }
        _ => out.push(prefix.clone()),
    }
}

/// One sparse override fragment per combination of cross-factor levels. The
/// last factor varies fastest; no factors yields a single empty fragment.
pub fn cross_product(factors: &[CrossFactor]) -> Result<Vec<Value>> {
    let mut outputs = Vec::new();
    expand_grid(factors, 0, json!({}), &mut outputs)?;
    Ok(outputs)
}

fn expand_grid(
    factors: &[CrossFactor],
    idx: usize,
    current: Value,
    outputs: &mut Vec<Value>,
) -> Result<()> {
    if idx == factors.len() {
        outputs.push(current);
        return Ok(());
    }
    let factor = &factors[idx];
    for level in &factor.levels {
        let mut next = current.clone();
        set_path(&mut next, &factor.path, level.clone())
            .map_err(|msg| DesignError::schema(format_path(&factor.path), msg))?;
        expand_grid(factors, idx + 1, next, outputs)?;
    }
    Ok(())
}
