use serde_json::{Map, Value};

use crate::error::{DesignError, Result};
use crate::{CMD, MAX_HOST_INSTANCES};

pub const MAIN_COMMAND: &str = "main";

/// Brings a host type's `$CMD$` into its canonical shape: a list of exactly
/// `n` mappings, each holding at least `main`. Already canonical input is
/// returned unchanged.
pub fn normalize_commands(host_type: &str, n: u32, cmd: &Value) -> Result<Vec<Value>> {
    let at = format!("{}.{}", host_type, CMD);
    if n > MAX_HOST_INSTANCES {
        return Err(DesignError::schema(
            at,
            format!("n={} exceeds the limit of {} instances", n, MAX_HOST_INSTANCES),
        ));
    }
    let n = n as usize;
    let items: Vec<Value> = match cmd {
        Value::Array(items) => {
            if items.len() != n {
                return Err(DesignError::schema(
                    at,
                    format!(
                        "command list has {} entries but host type has n={}",
                        items.len(),
                        n
                    ),
                ));
            }
            items.clone()
        }
        single => vec![single.clone(); n],
    };

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| normalize_entry(&at, idx, item))
        .collect()
}

fn normalize_entry(at: &str, idx: usize, item: Value) -> Result<Value> {
    match item {
        Value::String(main) => {
            let mut map = Map::new();
            map.insert(MAIN_COMMAND.to_string(), Value::String(main));
            Ok(Value::Object(map))
        }
        Value::Object(map) => {
            if !map.contains_key(MAIN_COMMAND) {
                return Err(DesignError::schema(
                    format!("{}[{}]", at, idx),
                    format!("command mapping must contain '{}'", MAIN_COMMAND),
                ));
            }
            if let Some((name, _)) = map.iter().find(|(_, v)| !v.is_string()) {
                return Err(DesignError::schema(
                    format!("{}[{}].{}", at, idx, name),
                    "commands must be strings",
                ));
            }
            Ok(Value::Object(map))
        }
        other => Err(DesignError::schema(
            format!("{}[{}]", at, idx),
            format!("command must be a string or a mapping, got {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_command_is_replicated_per_instance() {
        let out = normalize_commands("client", 3, &json!("run.sh")).expect("normalize");
        assert_eq!(out, vec![json!({"main": "run.sh"}); 3]);
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let cmd = json!(["a.sh", {"main": "b.sh", "monitor": "top"}]);
        let once = normalize_commands("server", 2, &cmd).expect("once");
        let twice = normalize_commands("server", 2, &Value::Array(once.clone())).expect("twice");
        assert_eq!(once, twice);
        assert_eq!(once[1], json!({"main": "b.sh", "monitor": "top"}));
    }

    #[test]
    fn mapping_command_is_replicated_with_background_commands() {
        let out = normalize_commands("server", 2, &json!({"main": "srv", "log": "tail -f x"}))
            .expect("normalize");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn length_mismatch_and_missing_main_fail() {
        let err = normalize_commands("server", 3, &json!(["a", "b"])).expect_err("length");
        assert!(err.to_string().contains("n=3"), "unexpected: {}", err);
        let err = normalize_commands("server", 1, &json!({"monitor": "top"})).expect_err("main");
        assert!(err.to_string().contains("main"), "unexpected: {}", err);
        assert!(normalize_commands("server", 1, &json!(42)).is_err());
        assert!(normalize_commands("server", 1, &json!({"main": 1})).is_err());
    }

    #[test]
    fn instance_count_is_capped() {
        let err = normalize_commands("client", u32::MAX, &json!("run.sh")).expect_err("cap");
        assert_eq!(err.code(), "schema_error");
        assert!(err.to_string().contains("limit"), "unexpected: {}", err);
        let out = normalize_commands("client", MAX_HOST_INSTANCES, &json!("run.sh"))
            .expect("at the limit");
        assert_eq!(out.len(), MAX_HOST_INSTANCES as usize);
    }
}
