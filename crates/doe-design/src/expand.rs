use serde_json::Value;

use crate::error::{DesignError, Result};
use crate::factor::{check_factor_levels, contains_marker, cross_product, FactorPlan};
use crate::tree::{contains, deep_merge};
use crate::{CMD, FACTOR, MAX_RUNS_PER_EXPERIMENT};

/// Builds one run per `factor_levels` entry and cross-product fragment.
///
/// `commands` is the `$CMD$` mapping (host type to normalized command list)
/// attached to every run. Runs matching an exclusion filter are dropped.
pub fn expand_runs(
    experiment: &str,
    plan: &FactorPlan,
    factor_levels: &[Value],
    except_filters: &[Value],
    commands: &Value,
) -> Result<Vec<Value>> {
    check_factor_levels(experiment, &plan.level_paths, factor_levels)?;
    let total = plan.run_count(factor_levels.len());
    if total > MAX_RUNS_PER_EXPERIMENT {
        return Err(DesignError::factor(
            experiment,
            format!(
                "design expands to {} runs, more than the limit of {}",
                total, MAX_RUNS_PER_EXPERIMENT
            ),
        ));
    }
    let fragments = cross_product(&plan.cross)?;

    let mut runs = Vec::with_capacity(factor_levels.len() * fragments.len());
    let mut excluded = 0usize;
    for entry in factor_levels {
        for fragment in &fragments {
            let mut run = plan.skeleton.clone();
            deep_merge(&mut run, fragment);
            deep_merge(&mut run, entry);
            if contains_marker(&run) {
                return Err(DesignError::factor(
                    experiment,
                    format!("{} left unresolved after merging levels", FACTOR),
                ));
            }
            let Value::Object(map) = &mut run else {
                return Err(DesignError::schema(
                    format!("{}.base_experiment", experiment),
                    "base_experiment must be a mapping",
                ));
            };
            map.insert(CMD.to_string(), commands.clone());

            if let Some(idx) = except_filters.iter().position(|f| contains(&run, f)) {
                tracing::debug!(experiment, filter = idx, "run excluded by filter");
                excluded += 1;
                continue;
            }
            runs.push(run);
        }
    }

    tracing::info!(
        experiment,
        runs = runs.len(),
        excluded,
        "expanded experiment"
    );
    Ok(runs)
}
