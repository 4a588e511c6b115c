//! Design expansion engine.
//!
//! Turns a declarative experiment suite (experiments, host types, commands
//! and factors) into the fully resolved list of run configurations an
//! execution layer can dispatch. The engine never runs anything; it only
//! produces data.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

pub mod command;
pub mod error;
pub mod expand;
pub mod factor;
pub mod include;
pub mod registry;
pub mod schema;
pub mod suite;
pub mod template;
pub mod tree;

pub use error::{DesignError, Result};
pub use include::InclusionReport;
pub use registry::Registry;
pub use suite::{
    compile_suite, compile_suites, expand_suite, prepare_suite, CompileOptions, CompiledSuite,
    EngineConfig, ExperimentSummary, PreparedExperiment, PreparedSuite, SuiteContext,
    SuiteOutcome,
};
pub use template::TemplateResolver;

pub const FACTOR: &str = "$FACTOR$";
pub const CMD: &str = "$CMD$";
pub const INCLUDE_VARS: &str = "$INCLUDE_VARS$";
pub const SUITE_VARS: &str = "$SUITE_VARS$";
pub const ETL: &str = "$ETL$";

/// Names that end up as inventory groups or template variables and therefore
/// may not be used for experiments, host types, suites or projects.
pub const RESERVED_IDENTIFIERS: &[&str] = &[
    "all",
    "ungrouped",
    "localhost",
    "prj_id",
    "suite",
    "exp_name",
    "my_run",
    "is_controller_yes",
    "is_controller_no",
    "check_status_yes",
    "check_status_no",
];

pub const MAX_IDENTIFIER_LEN: usize = 200;
pub const MAX_INCLUDE_ROUNDS: usize = 100;
/// Upper bound on the levels a single range expression may produce.
pub const MAX_FACTOR_LEVELS: usize = 100_000;
pub const MAX_HOST_INSTANCES: u32 = 10_000;
/// Upper bound on the runs one experiment may expand to, before exclusions.
pub const MAX_RUNS_PER_EXPERIMENT: usize = 1_000_000;

/// Reads a YAML file into the JSON document model.
pub fn load_yaml_document(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).map_err(|source| DesignError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&raw).map_err(|source| DesignError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::to_value(yaml)
        .map_err(|e| DesignError::schema(path.display().to_string(), e.to_string()))
}

/// Writes `value` as JSON when the file ends in `.json`, as YAML otherwise.
pub fn write_document(path: &Path, value: &Value) -> Result<()> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let bytes = if is_json {
        let mut bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| DesignError::schema(path.display().to_string(), e.to_string()))?;
        bytes.push(b'\n');
        bytes
    } else {
        serde_yaml::to_string(value)
            .map_err(|source| DesignError::Parse {
                path: path.to_path_buf(),
                source,
            })?
            .into_bytes()
    };
    atomic_write_bytes(path, &bytes).map_err(|source| DesignError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// `sha256:<hex>` over the compact JSON encoding. Maps are sorted, so equal
/// documents always hash the same.
pub fn canonical_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_document_picks_format_from_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let doc = json!({"exp": [{"size": 10}]});

        let json_path = dir.path().join("out/runs.json");
        write_document(&json_path, &doc).expect("json");
        let raw = fs::read_to_string(&json_path).expect("read json");
        assert_eq!(serde_json::from_str::<Value>(&raw).expect("parse"), doc);

        let yaml_path = dir.path().join("runs.yml");
        write_document(&yaml_path, &doc).expect("yaml");
        assert_eq!(load_yaml_document(&yaml_path).expect("load"), doc);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn load_yaml_document_reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_yaml_document(&dir.path().join("nope.yml")).expect_err("missing");
        assert_eq!(err.code(), "io_error");
        let bad = dir.path().join("bad.yml");
        fs::write(&bad, "a: [1, 2\n").expect("write");
        let err = load_yaml_document(&bad).expect_err("malformed");
        assert_eq!(err.code(), "parse_error");
    }

    #[test]
    fn digest_ignores_key_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [1, 2]}"#).expect("a");
        let b: Value = serde_json::from_str(r#"{"a": [1, 2], "b": 1}"#).expect("b");
        assert_eq!(canonical_digest(&a), canonical_digest(&b));
        assert!(canonical_digest(&a).starts_with("sha256:"));
        assert_ne!(canonical_digest(&a), canonical_digest(&json!({"a": [2, 1], "b": 1})));
    }
}
