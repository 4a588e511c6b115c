use std::collections::{BTreeMap, BTreeSet};

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DesignError, Result};
use crate::registry::Registry;
use crate::{CMD, ETL, INCLUDE_VARS, MAX_IDENTIFIER_LEN, RESERVED_IDENTIFIERS, SUITE_VARS};

const EXPERIMENT_SCHEMA: &str = include_str!("../schemas/experiment_v1.json");

pub struct ExperimentSchema {
    compiled: JSONSchema,
}

impl ExperimentSchema {
    pub fn load() -> Result<Self> {
        let schema: Value = serde_json::from_str(EXPERIMENT_SCHEMA)
            .map_err(|e| DesignError::schema("experiment_v1", e.to_string()))?;
        let compiled = JSONSchema::compile(&schema)
            .map_err(|e| DesignError::schema("experiment_v1", e.to_string()))?;
        Ok(Self { compiled })
    }

    /// Reports every violation at once, one line per instance path.
    pub fn validate(&self, experiment: &str, raw: &Value) -> Result<()> {
        if let Err(errors) = self.compiled.validate(raw) {
            let mut msgs = Vec::new();
            for e in errors {
                let pointer = e.instance_path.to_string();
                let at = if pointer.is_empty() { "/" } else { &pointer };
                msgs.push(format!("  - {}: {}", at, e));
            }
            return Err(DesignError::schema(
                experiment,
                format!("experiment does not match schema:\n{}", msgs.join("\n")),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RoleList {
    One(String),
    Many(Vec<String>),
}

impl Default for RoleList {
    fn default() -> Self {
        RoleList::Many(Vec::new())
    }
}

impl RoleList {
    fn into_vec(self) -> Vec<String> {
        match self {
            RoleList::One(role) => vec![role],
            RoleList::Many(roles) => roles,
        }
    }
}

fn default_one() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHostType {
    #[serde(default = "default_one")]
    n: u32,
    #[serde(default = "default_true")]
    check_status: bool,
    #[serde(default)]
    init_roles: RoleList,
    #[serde(rename = "$CMD$")]
    cmd: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExperiment {
    #[serde(default = "default_one")]
    n_repetitions: u32,
    #[serde(default)]
    common_roles: RoleList,
    host_types: BTreeMap<String, RawHostType>,
    base_experiment: Value,
    #[serde(default)]
    factor_levels: Vec<Value>,
    #[serde(default)]
    except_filters: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostTypeSpec {
    pub n: u32,
    pub check_status: bool,
    pub init_roles: Vec<String>,
    #[serde(rename = "$CMD$")]
    pub cmd: Value,
}

/// One experiment after schema validation and defaulting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentSpec {
    pub n_repetitions: u32,
    pub common_roles: Vec<String>,
    pub host_types: BTreeMap<String, HostTypeSpec>,
    pub base_experiment: Value,
    pub factor_levels: Vec<Value>,
    pub except_filters: Vec<Value>,
}

pub fn parse_experiment(
    schema: &ExperimentSchema,
    name: &str,
    raw: &Value,
) -> Result<ExperimentSpec> {
    schema.validate(name, raw)?;
    let parsed: RawExperiment = serde_json::from_value(raw.clone())
        .map_err(|e| DesignError::schema(name, e.to_string()))?;

    let mut factor_levels = parsed.factor_levels;
    if factor_levels.is_empty() {
        factor_levels.push(Value::Object(Default::default()));
    }

    let host_types = parsed
        .host_types
        .into_iter()
        .map(|(host_type, raw)| {
            let spec = HostTypeSpec {
                n: raw.n,
                check_status: raw.check_status,
                init_roles: raw.init_roles.into_vec(),
                cmd: raw.cmd,
            };
            (host_type, spec)
        })
        .collect();

    Ok(ExperimentSpec {
        n_repetitions: parsed.n_repetitions,
        common_roles: parsed.common_roles.into_vec(),
        host_types,
        base_experiment: parsed.base_experiment,
        factor_levels,
        except_filters: parsed.except_filters,
    })
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Length and syntax rules plus pairwise uniqueness of every identifier that
/// later becomes a host tag.
pub fn validate_identifiers<'a>(
    prj_id: &str,
    suite: &str,
    experiments: impl IntoIterator<Item = &'a str>,
    host_types: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let experiments: Vec<&str> = experiments.into_iter().collect();
    let host_types: BTreeSet<&str> = host_types.into_iter().collect();

    for (kind, value) in [("prj_id", prj_id), ("suite", suite)] {
        if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
            return Err(DesignError::schema(
                kind,
                format!(
                    "'{}' must be 1..={} characters long",
                    value, MAX_IDENTIFIER_LEN
                ),
            ));
        }
    }
    for name in experiments.iter().chain(host_types.iter()) {
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(DesignError::schema(
                *name,
                format!("name exceeds {} characters", MAX_IDENTIFIER_LEN),
            ));
        }
        if !is_identifier(name) {
            return Err(DesignError::schema(
                *name,
                "name must only contain [A-Za-z0-9_]",
            ));
        }
    }

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    let all = [prj_id, suite]
        .into_iter()
        .chain(experiments.iter().copied())
        .chain(host_types.iter().copied())
        .chain(RESERVED_IDENTIFIERS.iter().copied());
    for id in all {
        *seen.entry(id).or_insert(0) += 1;
    }
    let duplicates: Vec<String> = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(id, _)| id.to_string())
        .collect();
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(DesignError::Uniqueness(duplicates))
    }
}

/// Every host type needs group vars and every role a role directory.
pub fn validate_registry(name: &str, spec: &ExperimentSpec, registry: &Registry) -> Result<()> {
    let mut missing = Vec::new();
    for (host_type, host) in &spec.host_types {
        if !registry.has_host_type(host_type) {
            missing.push(format!("host type '{}' has no group vars", host_type));
        }
        for role in &host.init_roles {
            if !registry.has_role(role) {
                missing.push(format!(
                    "init role '{}' of host type '{}' not found",
                    role, host_type
                ));
            }
        }
    }
    for role in &spec.common_roles {
        if !registry.has_role(role) {
            missing.push(format!("common role '{}' not found", role));
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DesignError::schema(
            name,
            format!(
                "unknown registry entries:\n{}",
                missing
                    .iter()
                    .map(|m| format!("  - {}", m))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        ))
    }
}

/// `$CMD$`, `$SUITE_VARS$` and `$ETL$` have no meaning inside a run config.
/// Runs after inclusion, so any `$INCLUDE_VARS$` still present sits where it
/// is never processed (inside a list).
pub fn reject_reserved_keys(name: &str, base: &Value) -> Result<()> {
    fn walk(value: &Value, path: &mut Vec<String>, found: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    path.push(key.clone());
                    if key == CMD || key == SUITE_VARS || key == ETL || key == INCLUDE_VARS {
                        found.push(path.join("."));
                    }
                    walk(child, path, found);
                    path.pop();
                }
            }
            Value::Array(items) => {
                for (idx, child) in items.iter().enumerate() {
                    path.push(idx.to_string());
                    walk(child, path, found);
                    path.pop();
                }
            }
            _ => {}
        }
    }

    let mut found = Vec::new();
    walk(base, &mut Vec::new(), &mut found);
    if found.is_empty() {
        Ok(())
    } else {
        Err(DesignError::schema(
            format!("{}.base_experiment", name),
            format!("reserved keys are not allowed here: {}", found.join(", ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ExperimentSchema {
        ExperimentSchema::load().expect("embedded schema compiles")
    }

    #[test]
    fn parse_experiment_applies_defaults() {
        let raw = json!({
            "host_types": {"server": {"$CMD$": "run.sh", "init_roles": "setup"}},
            "base_experiment": {"x": 1}
        });
        let spec = parse_experiment(&schema(), "exp", &raw).expect("valid");
        assert_eq!(spec.n_repetitions, 1);
        assert!(spec.common_roles.is_empty());
        assert_eq!(spec.factor_levels, vec![json!({})]);
        assert!(spec.except_filters.is_empty());
        let server = &spec.host_types["server"];
        assert_eq!(server.n, 1);
        assert!(server.check_status);
        assert_eq!(server.init_roles, vec!["setup".to_string()]);
    }

    #[test]
    fn parse_experiment_reports_unknown_and_missing_keys() {
        let raw = json!({
            "n_repetitions": 0,
            "host_types": {"server": {"n": 1}},
            "bogus": true
        });
        let err = parse_experiment(&schema(), "exp", &raw).expect_err("invalid");
        let msg = err.to_string();
        assert!(msg.contains("base_experiment"), "missing base_experiment: {}", msg);
        assert!(msg.contains("bogus"), "missing unknown key: {}", msg);
        assert!(msg.contains("/n_repetitions"), "missing repetitions: {}", msg);
        assert!(msg.contains("/host_types/server"), "missing cmd: {}", msg);
    }

    #[test]
    fn parse_experiment_rejects_command_map_without_main() {
        let raw = json!({
            "host_types": {"server": {"$CMD$": {"monitor": "top"}}},
            "base_experiment": {}
        });
        assert!(parse_experiment(&schema(), "exp", &raw).is_err());
    }

    #[test]
    fn validate_identifiers_lists_all_duplicates() {
        let err = validate_identifiers("prj", "suite_a", ["exp", "server", "all"], ["server"])
            .expect_err("duplicates");
        match err {
            DesignError::Uniqueness(dups) => {
                assert_eq!(dups, vec!["all".to_string(), "server".to_string()])
            }
            other => panic!("expected uniqueness error, got {}", other),
        }
    }

    #[test]
    fn validate_identifiers_checks_syntax_and_length() {
        assert!(validate_identifiers("prj", "s", ["bad-name"], ["server"]).is_err());
        let long = "x".repeat(201);
        assert!(validate_identifiers("prj", &long, ["exp"], ["server"]).is_err());
        assert!(validate_identifiers("prj", "s", ["exp_1"], ["server", "client"]).is_ok());
    }

    #[test]
    fn validate_registry_reports_missing_entries() {
        let raw = json!({
            "common_roles": ["base"],
            "host_types": {"server": {"$CMD$": "x", "init_roles": ["db"]}, "gpu": {"$CMD$": "y"}},
            "base_experiment": {}
        });
        let spec = parse_experiment(&schema(), "exp", &raw).expect("valid");
        let registry = Registry::new(["server"], ["base"]);
        let err = validate_registry("exp", &spec, &registry).expect_err("missing");
        let msg = err.to_string();
        assert!(msg.contains("'gpu'"), "gpu not reported: {}", msg);
        assert!(msg.contains("'db'"), "db not reported: {}", msg);
        assert!(!msg.contains("'base'"), "base wrongly reported: {}", msg);
    }

    #[test]
    fn reject_reserved_keys_finds_nested_markers() {
        let base = json!({"a": {"$CMD$": "x"}, "l": [{"$ETL$": 1}]});
        let err = reject_reserved_keys("exp", &base).expect_err("reserved");
        let msg = err.to_string();
        assert!(msg.contains("a.$CMD$") && msg.contains("l.0.$ETL$"), "{}", msg);
    }

    #[test]
    fn reject_reserved_keys_flags_unprocessed_includes() {
        let base = json!({"l": [{"$INCLUDE_VARS$": "x.yml"}]});
        let err = reject_reserved_keys("exp", &base).expect_err("reserved");
        let msg = err.to_string();
        assert!(msg.contains("l.0.$INCLUDE_VARS$"), "unexpected: {}", msg);
    }
}
