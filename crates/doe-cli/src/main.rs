use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use doe_design::suite::suite_output_path;
use doe_design::{
    expand_suite, prepare_suite, write_document, CompileOptions, DesignError, EngineConfig,
    ExperimentSummary,
};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "doe",
    version,
    about = "Expands experiment suite designs into run configurations"
)]
struct Cli {
    /// Project config root holding designs/, group_vars/ and roles/.
    #[arg(long, env = "DOES_CONFIG_DIR", default_value = ".", global = true)]
    config_dir: PathBuf,
    #[arg(long, env = "DOES_PROJECT_ID", global = true)]
    prj_id: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and expand one or more suites.
    Design {
        #[arg(required = true)]
        suites: Vec<String>,
        /// Regex; only matching experiments are expanded.
        #[arg(long)]
        exps_filter: Option<String>,
        /// Write the validated design before expansion (.json or .yml).
        #[arg(long)]
        design_out: Option<PathBuf>,
        /// Write the run lists (.json or .yml). Printed to stdout otherwise.
        #[arg(long)]
        runs_out: Option<PathBuf>,
        #[arg(long)]
        validate_only: bool,
        #[arg(long)]
        ignore_undefined_vars: bool,
        /// YAML mapping of template variables.
        #[arg(long)]
        vars: Option<PathBuf>,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show factors and expected run counts per experiment.
    Describe {
        suite: String,
        #[arg(long)]
        json: bool,
    },
    /// List the suites with a design file and the known host types and roles.
    Suites {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let config = EngineConfig::from_config_dir(
        cli.config_dir,
        cli.prj_id.clone().unwrap_or_default(),
    );
    let result = run_command(&config, cli.prj_id.is_some(), cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<DesignError>()
                    .map(DesignError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(
    config: &EngineConfig,
    has_prj_id: bool,
    command: Commands,
) -> Result<Option<Value>> {
    match command {
        Commands::Design {
            suites,
            exps_filter,
            design_out,
            runs_out,
            validate_only,
            ignore_undefined_vars,
            vars,
            set_values,
            json,
        } => {
            if !has_prj_id {
                return Err(anyhow!(
                    "missing project id: pass --prj-id or set DOES_PROJECT_ID"
                ));
            }
            let exp_filter = exps_filter
                .as_deref()
                .map(Regex::new)
                .transpose()
                .context("invalid --exps-filter")?;
            let mut template_vars = match &vars {
                Some(path) => load_vars_file(path)?,
                None => Map::new(),
            };
            template_vars.extend(parse_set_bindings(&set_values)?);
            let options = CompileOptions {
                exp_filter,
                tolerate_undefined: ignore_undefined_vars,
                vars: template_vars,
            };
            let outputs = Outputs {
                design_out,
                runs_out,
                validate_only,
                per_suite: suites.len() > 1,
            };

            let mut reports = Vec::new();
            let mut failed = Vec::new();
            for suite in &suites {
                match design_suite(config, suite, &options, &outputs) {
                    Ok(report) => reports.push(report),
                    Err(err) => {
                        tracing::error!(suite = %suite, "{:#}", err);
                        if !json {
                            eprintln!("suite {} failed: {:#}", suite, err);
                        }
                        failed.push(json!({"suite": suite, "error": format!("{:#}", err)}));
                    }
                }
            }

            if json {
                let payload = json!({
                    "ok": failed.is_empty(),
                    "command": "design",
                    "suites": reports,
                    "failed": failed
                });
                if !failed.is_empty() {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            for report in &reports {
                print_report(report);
            }
            if !failed.is_empty() {
                return Err(anyhow!(
                    "{} of {} suites failed",
                    failed.len(),
                    suites.len()
                ));
            }
        }
        Commands::Describe { suite, json } => {
            let ctx = config.context(&suite)?;
            let raw = config.load_design(&suite)?;
            let prepared = prepare_suite(&raw, &ctx)?;
            let summary = prepared.summary();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "suite": suite,
                    "experiments": summary
                })));
            }
            println!("suite: {}", suite);
            for exp in &summary {
                print_summary(exp);
            }
        }
        Commands::Suites { json } => {
            let suites = config.suites()?;
            let registry = config.registry()?;
            let host_types: Vec<&str> = registry.host_types().collect();
            let roles: Vec<&str> = registry.roles().collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "suites",
                    "designs_dir": config.designs_dir.display().to_string(),
                    "suites": suites,
                    "host_types": host_types,
                    "roles": roles
                })));
            }
            for suite in suites {
                println!("{}", suite);
            }
            tracing::info!(
                host_types = %host_types.join(", "),
                roles = %roles.join(", "),
                "registry"
            );
        }
    }
    Ok(None)
}

struct Outputs {
    design_out: Option<PathBuf>,
    runs_out: Option<PathBuf>,
    validate_only: bool,
    per_suite: bool,
}

impl Outputs {
    fn path_for(&self, base: &Path, suite: &str) -> PathBuf {
        if self.per_suite {
            suite_output_path(base, suite)
        } else {
            base.to_path_buf()
        }
    }
}

fn design_suite(
    config: &EngineConfig,
    suite: &str,
    options: &CompileOptions,
    outputs: &Outputs,
) -> Result<Value> {
    let ctx = config.context(suite)?;
    let raw = config.load_design(suite)?;
    let prepared = prepare_suite(&raw, &ctx)?;
    let mut report = json!({
        "suite": suite,
        "design": config.design_path(suite).display().to_string(),
        "experiments": prepared.experiments.len()
    });

    if let Some(base) = &outputs.design_out {
        let path = outputs.path_for(base, suite);
        write_document(&path, &prepared.to_document()?)
            .with_context(|| format!("writing {}", path.display()))?;
        report["design_out"] = json!(path.display().to_string());
    }
    if outputs.validate_only {
        report["validated"] = json!(true);
        return Ok(report);
    }

    let compiled = expand_suite(&prepared, options)?;
    report["runs"] = json!(compiled.run_count());
    report["digest"] = json!(compiled.digest());
    match &outputs.runs_out {
        Some(base) => {
            let path = outputs.path_for(base, suite);
            write_document(&path, &compiled.to_document())
                .with_context(|| format!("writing {}", path.display()))?;
            report["runs_out"] = json!(path.display().to_string());
        }
        None => {
            report["run_lists"] = compiled.to_document();
        }
    }
    Ok(report)
}

fn load_vars_file(path: &Path) -> Result<Map<String, Value>> {
    match doe_design::load_yaml_document(path)? {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("--vars file must contain a mapping: {}", path.display())),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Design { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Suites { json } => *json,
    }
}

fn parse_set_bindings(values: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.to_string(), parsed);
    }
    Ok(out)
}

fn print_report(report: &Value) {
    if let Some(lists) = report.get("run_lists") {
        match serde_yaml::to_string(lists) {
            Ok(yaml) => print!("{}", yaml),
            Err(err) => eprintln!("failed to render run lists: {}", err),
        }
        return;
    }
    println!("suite: {}", report["suite"].as_str().unwrap_or_default());
    println!("experiments: {}", report["experiments"]);
    for key in ["design_out", "runs", "runs_out", "digest"] {
        if let Some(value) = report.get(key) {
            match value.as_str() {
                Some(s) => println!("{}: {}", key, s),
                None => println!("{}: {}", key, value),
            }
        }
    }
    if report.get("validated").is_some() {
        println!("validated: true");
    }
}

fn print_summary(summary: &ExperimentSummary) {
    println!("experiment: {}", summary.experiment);
    println!("  host_types: {}", summary.host_types.join(", "));
    println!("  n_repetitions: {}", summary.n_repetitions);
    println!("  factor_levels_entries: {}", summary.level_entries);
    if !summary.level_paths.is_empty() {
        println!("  level_factors: {}", summary.level_paths.join(", "));
    }
    for (path, count) in &summary.cross_levels {
        println!("  cross_factor: {} ({} levels)", path, count);
    }
    println!("  expected_runs: {}", summary.expected_runs);
    if summary.except_filters > 0 {
        println!("  except_filters: {}", summary.except_filters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bindings_parse_json_with_string_fallback() {
        let values = vec![
            "size=10".to_string(),
            "name=fast".to_string(),
            "opts={\"a\": [1]}".to_string(),
        ];
        let parsed = parse_set_bindings(&values).expect("parse");
        assert_eq!(parsed["size"], json!(10));
        assert_eq!(parsed["name"], json!("fast"));
        assert_eq!(parsed["opts"], json!({"a": [1]}));
    }

    #[test]
    fn set_bindings_reject_malformed_entries() {
        let err = parse_set_bindings(&["novalue".to_string()]).expect_err("no =");
        assert!(err.to_string().contains("expected k=v"), "unexpected: {}", err);
        assert!(parse_set_bindings(&[" =1".to_string()]).is_err());
    }

    #[test]
    fn per_suite_outputs_get_suffixed_names() {
        let outputs = Outputs {
            design_out: None,
            runs_out: None,
            validate_only: false,
            per_suite: true,
        };
        assert_eq!(
            outputs.path_for(Path::new("out/runs.yml"), "bench"),
            PathBuf::from("out/runs_bench.yml")
        );
    }

    #[test]
    fn cli_parses_design_flags() {
        let cli = Cli::try_parse_from([
            "doe",
            "--prj-id",
            "demo",
            "design",
            "bench",
            "--exps-filter",
            "lat_",
            "--set",
            "a=1",
            "--json",
        ])
        .expect("parse");
        assert_eq!(cli.prj_id.as_deref(), Some("demo"));
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Design {
                suites, set_values, ..
            } => {
                assert_eq!(suites, vec!["bench"]);
                assert_eq!(set_values, vec!["a=1"]);
            }
            _ => panic!("expected design"),
        }
    }
}
