//! The ordered pipeline from a raw suite design to per-experiment run lists.
//!
//! `prepare_suite` validates and normalizes everything that does not depend
//! on the run set. `expand_suite` multiplies the prepared experiments out and
//! resolves placeholders.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::command::normalize_commands;
use crate::error::{DesignError, Result};
use crate::expand::expand_runs;
use crate::factor::{check_factor_levels, extract_factors, FactorPlan};
use crate::include::{include_vars, resolve_includes};
use crate::registry::Registry;
use crate::schema::{
    parse_experiment, reject_reserved_keys, validate_identifiers, validate_registry,
    ExperimentSchema, ExperimentSpec,
};
use crate::template::TemplateResolver;
use crate::tree::format_path;
use crate::{canonical_digest, load_yaml_document, ETL, SUITE_VARS};

const DESIGN_EXTENSION: &str = "yml";

/// Project layout rooted at the config directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub prj_id: String,
    pub config_dir: PathBuf,
    pub designs_dir: PathBuf,
    pub design_vars_dir: PathBuf,
    pub group_vars_dir: PathBuf,
    pub roles_dir: PathBuf,
}

impl EngineConfig {
    pub fn from_config_dir(config_dir: impl Into<PathBuf>, prj_id: impl Into<String>) -> Self {
        let config_dir = config_dir.into();
        let designs_dir = config_dir.join("designs");
        Self {
            prj_id: prj_id.into(),
            design_vars_dir: designs_dir.join("design_vars"),
            group_vars_dir: config_dir.join("group_vars"),
            roles_dir: config_dir.join("roles"),
            designs_dir,
            config_dir,
        }
    }

    pub fn design_path(&self, suite: &str) -> PathBuf {
        self.designs_dir.join(format!("{}.{}", suite, DESIGN_EXTENSION))
    }

    pub fn load_design(&self, suite: &str) -> Result<Value> {
        load_yaml_document(&self.design_path(suite))
    }

    pub fn registry(&self) -> Result<Registry> {
        Registry::scan(&self.group_vars_dir, &self.roles_dir)
    }

    pub fn context(&self, suite: &str) -> Result<SuiteContext> {
        Ok(SuiteContext {
            prj_id: self.prj_id.clone(),
            suite: suite.to_string(),
            registry: self.registry()?,
            vars_dir: self.design_vars_dir.clone(),
        })
    }

    /// Suite names with a design file, sorted.
    pub fn suites(&self) -> Result<Vec<String>> {
        if !self.designs_dir.is_dir() {
            return Err(DesignError::Io {
                path: self.designs_dir.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "designs directory not found",
                ),
            });
        }
        let mut suites = Vec::new();
        for entry in WalkDir::new(&self.designs_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| DesignError::Io {
                path: self.designs_dir.clone(),
                source: e.into(),
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(DESIGN_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                suites.push(stem.to_string());
            }
        }
        suites.sort();
        Ok(suites)
    }
}

/// Everything a single suite compilation needs besides the design itself.
#[derive(Debug, Clone)]
pub struct SuiteContext {
    pub prj_id: String,
    pub suite: String,
    pub registry: Registry,
    pub vars_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Only experiments whose name matches (unanchored search) are expanded.
    pub exp_filter: Option<Regex>,
    pub tolerate_undefined: bool,
    /// Bound at the top level of every template context.
    pub vars: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedExperiment {
    /// Normalized experiment; `base_experiment` has its inclusions applied
    /// and every `$CMD$` is in canonical list form.
    pub spec: ExperimentSpec,
    pub plan: FactorPlan,
}

impl PreparedExperiment {
    /// Host type to command list, as attached to every run.
    pub fn commands(&self) -> Value {
        Value::Object(
            self.spec
                .host_types
                .iter()
                .map(|(name, host)| (name.clone(), host.cmd.clone()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSuite {
    pub prj_id: String,
    pub suite: String,
    pub suite_vars: Value,
    pub etl: Option<Value>,
    pub experiments: BTreeMap<String, PreparedExperiment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentSummary {
    pub experiment: String,
    pub host_types: Vec<String>,
    pub level_entries: usize,
    pub level_paths: Vec<String>,
    pub cross_levels: BTreeMap<String, usize>,
    pub n_repetitions: u32,
    /// Before exclusion filters.
    pub expected_runs: usize,
    pub except_filters: usize,
}

impl PreparedSuite {
    /// The design as it looks after validation, inclusion and command
    /// normalization, before any factor is expanded.
    pub fn to_document(&self) -> Result<Value> {
        let mut doc = Map::new();
        for (name, exp) in &self.experiments {
            let value = serde_json::to_value(&exp.spec)
                .map_err(|e| DesignError::schema(name.as_str(), e.to_string()))?;
            doc.insert(name.clone(), value);
        }
        if self.suite_vars.as_object().is_some_and(|m| !m.is_empty()) {
            doc.insert(SUITE_VARS.to_string(), self.suite_vars.clone());
        }
        if let Some(etl) = &self.etl {
            doc.insert(ETL.to_string(), etl.clone());
        }
        Ok(Value::Object(doc))
    }

    pub fn summary(&self) -> Vec<ExperimentSummary> {
        self.experiments
            .iter()
            .map(|(name, exp)| ExperimentSummary {
                experiment: name.clone(),
                host_types: exp.spec.host_types.keys().cloned().collect(),
                level_entries: exp.spec.factor_levels.len(),
                level_paths: exp.plan.level_paths.iter().map(|p| format_path(p)).collect(),
                cross_levels: exp
                    .plan
                    .cross
                    .iter()
                    .map(|f| (format_path(&f.path), f.levels.len()))
                    .collect(),
                n_repetitions: exp.spec.n_repetitions,
                expected_runs: exp.plan.run_count(exp.spec.factor_levels.len()),
                except_filters: exp.spec.except_filters.len(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSuite {
    pub suite: String,
    pub runs: BTreeMap<String, Vec<Value>>,
}

impl CompiledSuite {
    /// `{ <experiment>: [run, ...] }`
    pub fn to_document(&self) -> Value {
        Value::Object(
            self.runs
                .iter()
                .map(|(name, runs)| (name.clone(), Value::Array(runs.clone())))
                .collect(),
        )
    }

    pub fn digest(&self) -> String {
        canonical_digest(&self.to_document())
    }

    pub fn run_count(&self) -> usize {
        self.runs.values().map(Vec::len).sum()
    }
}

/// Result of one suite in a batch; a failing suite does not stop the others.
#[derive(Debug)]
pub struct SuiteOutcome {
    pub suite: String,
    pub result: Result<CompiledSuite>,
}

/// Validates the raw design and prepares every experiment for expansion.
pub fn prepare_suite(raw: &Value, ctx: &SuiteContext) -> Result<PreparedSuite> {
    let Value::Object(top) = raw else {
        return Err(DesignError::schema(
            ctx.suite.as_str(),
            "suite design must be a mapping",
        ));
    };

    let mut suite_vars = Value::Object(Map::new());
    let mut etl = None;
    let mut raw_experiments = BTreeMap::new();
    for (key, value) in top {
        if key == SUITE_VARS {
            if !value.is_object() {
                return Err(DesignError::schema(SUITE_VARS, "must be a mapping"));
            }
            suite_vars = value.clone();
        } else if key == ETL {
            if !value.is_object() {
                return Err(DesignError::schema(ETL, "must be a mapping"));
            }
            etl = Some(value.clone());
        } else if key.starts_with('$') {
            return Err(DesignError::schema(
                key.as_str(),
                format!(
                    "unknown reserved key at suite level (allowed: {}, {})",
                    SUITE_VARS, ETL
                ),
            ));
        } else {
            raw_experiments.insert(key.clone(), value);
        }
    }
    if raw_experiments.is_empty() {
        return Err(DesignError::schema(
            ctx.suite.as_str(),
            "suite must define at least one experiment",
        ));
    }

    let schema = ExperimentSchema::load()?;
    let mut specs = BTreeMap::new();
    for (name, raw) in raw_experiments {
        specs.insert(name.clone(), parse_experiment(&schema, &name, raw)?);
    }
    validate_identifiers(
        &ctx.prj_id,
        &ctx.suite,
        specs.keys().map(String::as_str),
        specs
            .values()
            .flat_map(|spec| spec.host_types.keys().map(String::as_str)),
    )?;
    for (name, spec) in &specs {
        validate_registry(name, spec, &ctx.registry)?;
    }
    if let Some(etl) = &etl {
        check_etl_references(etl, &specs)?;
    }

    let suite_report = resolve_includes(&mut suite_vars, &ctx.vars_dir)?;
    tracing::debug!(
        suite = %ctx.suite,
        included = suite_report.included.len(),
        "resolved suite vars"
    );

    let mut experiments = BTreeMap::new();
    for (name, mut spec) in specs {
        let own = resolve_includes(&mut spec.base_experiment, &ctx.vars_dir)?;
        let inherited = include_vars(&mut spec.base_experiment, &suite_vars)?;
        tracing::debug!(
            experiment = %name,
            included = own.included.len(),
            inherited = inherited.included.len(),
            overridden = inherited.skipped.len(),
            "applied variable inclusion"
        );
        reject_reserved_keys(&name, &spec.base_experiment)?;

        let plan = extract_factors(&name, &spec.base_experiment)?;
        check_factor_levels(&name, &plan.level_paths, &spec.factor_levels)?;
        for (host_type, host) in spec.host_types.iter_mut() {
            host.cmd = Value::Array(normalize_commands(host_type, host.n, &host.cmd)?);
        }
        experiments.insert(name, PreparedExperiment { spec, plan });
    }

    Ok(PreparedSuite {
        prj_id: ctx.prj_id.clone(),
        suite: ctx.suite.clone(),
        suite_vars,
        etl,
        experiments,
    })
}

/// Expands the selected experiments into resolved runs.
pub fn expand_suite(prepared: &PreparedSuite, options: &CompileOptions) -> Result<CompiledSuite> {
    let resolver = TemplateResolver::new(options.tolerate_undefined)?;
    let mut runs = BTreeMap::new();
    for (name, exp) in &prepared.experiments {
        if let Some(filter) = &options.exp_filter {
            if !filter.is_match(name) {
                tracing::debug!(experiment = %name, "skipped by experiment filter");
                continue;
            }
        }
        let expanded = expand_runs(
            name,
            &exp.plan,
            &exp.spec.factor_levels,
            &exp.spec.except_filters,
            &exp.commands(),
        )?;
        let vars = template_vars(prepared, name, &options.vars);
        let mut resolved = Vec::with_capacity(expanded.len());
        for (idx, run) in expanded.into_iter().enumerate() {
            let run = resolver.resolve_run(run, &vars).map_err(|e| match e {
                DesignError::Template { path, message } => DesignError::Template {
                    path: format!("{}[{}].{}", name, idx, path),
                    message,
                },
                other => other,
            })?;
            resolved.push(run);
        }
        runs.insert(name.clone(), resolved);
    }
    if runs.is_empty() {
        tracing::warn!(suite = %prepared.suite, "no experiment selected");
    }
    Ok(CompiledSuite {
        suite: prepared.suite.clone(),
        runs,
    })
}

pub fn compile_suite(
    raw: &Value,
    ctx: &SuiteContext,
    options: &CompileOptions,
) -> Result<CompiledSuite> {
    let prepared = prepare_suite(raw, ctx)?;
    expand_suite(&prepared, options)
}

/// Compiles each named suite from the config directory independently.
pub fn compile_suites(
    config: &EngineConfig,
    suites: &[String],
    options: &CompileOptions,
) -> Vec<SuiteOutcome> {
    suites
        .iter()
        .map(|suite| {
            let result = config.context(suite).and_then(|ctx| {
                let raw = config.load_design(suite)?;
                compile_suite(&raw, &ctx, options)
            });
            match &result {
                Ok(compiled) => tracing::info!(
                    suite = %suite,
                    runs = compiled.run_count(),
                    "compiled suite"
                ),
                Err(err) => tracing::warn!(suite = %suite, error = %err, "suite failed"),
            }
            SuiteOutcome {
                suite: suite.clone(),
                result,
            }
        })
        .collect()
}

fn template_vars(
    prepared: &PreparedSuite,
    experiment: &str,
    supplied: &Map<String, Value>,
) -> Map<String, Value> {
    let mut vars = supplied.clone();
    for (key, value) in [
        ("prj_id", prepared.prj_id.as_str()),
        ("suite", prepared.suite.as_str()),
        ("exp_name", experiment),
    ] {
        vars.entry(key.to_string())
            .or_insert_with(|| Value::String(value.to_string()));
    }
    vars
}

/// Every pipeline must name the experiments it consumes, either `"*"` or a
/// list of experiments of this suite.
fn check_etl_references(etl: &Value, experiments: &BTreeMap<String, ExperimentSpec>) -> Result<()> {
    let Some(pipelines) = etl.as_object() else {
        return Err(DesignError::schema(ETL, "must be a mapping"));
    };
    for (pipeline, body) in pipelines {
        let at = format!("{}.{}", ETL, pipeline);
        let Some(refs) = body.get("experiments") else {
            return Err(DesignError::schema(at, "missing 'experiments'"));
        };
        match refs {
            Value::String(s) if s == "*" => {}
            Value::Array(items) => {
                for item in items {
                    let Some(name) = item.as_str() else {
                        return Err(DesignError::schema(
                            format!("{}.experiments", at),
                            "experiment references must be strings",
                        ));
                    };
                    if !experiments.contains_key(name) {
                        return Err(DesignError::ReferenceNotFound(format!(
                            "{} references unknown experiment '{}'",
                            at, name
                        )));
                    }
                }
            }
            _ => {
                return Err(DesignError::schema(
                    format!("{}.experiments", at),
                    "must be \"*\" or a list of experiment names",
                ))
            }
        }
    }
    Ok(())
}

/// Path of a suite's run list next to a base output path, used when one
/// output location serves several suites.
pub fn suite_output_path(base: &Path, suite: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("runs");
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, suite, ext),
        None => format!("{}_{}", stem, suite),
    };
    base.with_file_name(name)
}
