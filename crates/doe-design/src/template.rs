//! Placeholder resolution inside run configurations.
//!
//! Runs may reference their own fields through `my_run` and any externally
//! supplied variable by name. Delimiters are chosen so that Jinja/Ansible
//! templates (`{{ }}`, `{% %}`, `{# #}`) pass through untouched. A string is
//! only treated as a template when it holds an opening delimiter followed by
//! its closing one; inside such a string all three delimiter pairs are
//! reserved.

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, Template, UndefinedBehavior};
use serde_json::{Map, Value};

use crate::error::{DesignError, Result};
use crate::CMD;

pub const EXPR_START: &str = "[%";
pub const EXPR_END: &str = "%]";
pub const BLOCK_START: &str = "<%";
pub const BLOCK_END: &str = "%>";
pub const COMMENT_START: &str = "<#";
pub const COMMENT_END: &str = "#>";

/// Name under which a run sees its own (partially resolved) fields.
pub const RUN_BINDING: &str = "my_run";
pub const MAX_TEMPLATE_ROUNDS: usize = 100;

type LeafPath = Vec<String>;

pub fn has_delimiters(s: &str) -> bool {
    has_pair(s, EXPR_START, EXPR_END)
        || has_pair(s, BLOCK_START, BLOCK_END)
        || has_pair(s, COMMENT_START, COMMENT_END)
}

fn has_pair(s: &str, start: &str, end: &str) -> bool {
    s.find(start)
        .map(|idx| s[idx + start.len()..].contains(end))
        .unwrap_or(false)
}

/// A string value or a mapping key that still holds placeholders. For a key,
/// `path` ends with the key itself.
struct Pending {
    path: LeafPath,
    source: String,
    is_key: bool,
}

pub struct TemplateResolver {
    env: Environment<'static>,
    tolerate_undefined: bool,
}

impl TemplateResolver {
    /// With `tolerate_undefined`, unknown names render as empty instead of
    /// failing. Only meant for previews.
    pub fn new(tolerate_undefined: bool) -> Result<Self> {
        let syntax = SyntaxConfig::builder()
            .block_delimiters(BLOCK_START, BLOCK_END)
            .variable_delimiters(EXPR_START, EXPR_END)
            .comment_delimiters(COMMENT_START, COMMENT_END)
            .build()
            .map_err(|e| DesignError::template("<syntax>", e.to_string()))?;
        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(if tolerate_undefined {
            UndefinedBehavior::Chainable
        } else {
            UndefinedBehavior::Strict
        });
        Ok(Self {
            env,
            tolerate_undefined,
        })
    }

    /// Resolves every placeholder of `run`, then renders its `$CMD$` block
    /// once against the resolved run.
    ///
    /// Each round renders the values and keys whose `my_run` references are
    /// already free of placeholders, so they settle in dependency order.
    pub fn resolve_run(&self, run: Value, vars: &Map<String, Value>) -> Result<Value> {
        if vars.contains_key(RUN_BINDING) {
            return Err(DesignError::template(
                RUN_BINDING,
                "variable name is reserved for the run itself",
            ));
        }
        let Value::Object(mut fields) = run else {
            return Err(DesignError::template("<run>", "run must be a mapping"));
        };
        let commands = fields.remove(CMD);
        let mut run = Value::Object(fields);

        let mut rounds = 0usize;
        loop {
            let mut pending = Vec::new();
            collect_pending(&run, &mut Vec::new(), &mut pending);
            if pending.is_empty() {
                break;
            }
            rounds += 1;
            if rounds > MAX_TEMPLATE_ROUNDS {
                return Err(DesignError::template(
                    joined_paths(&pending),
                    format!(
                        "template did not converge after {} rounds",
                        MAX_TEMPLATE_ROUNDS
                    ),
                ));
            }

            let snapshot = run.clone();
            let ctx = render_context(&snapshot, vars);
            let mut progressed = false;
            let mut renames = Vec::new();
            for item in &pending {
                let tmpl = self.compile(&item.path, &item.source)?;
                if !dependencies_ready(&tmpl, &snapshot, &item.path) {
                    continue;
                }
                if item.is_key {
                    renames.push((item.path.clone(), render(&tmpl, &ctx, &item.path)?));
                } else {
                    let value = self.evaluate(&tmpl, &item.source, &ctx, &item.path)?;
                    if let Some(slot) = leaf_mut(&mut run, &item.path) {
                        *slot = value;
                    }
                }
                progressed = true;
            }
            if !progressed {
                return Err(DesignError::template(
                    joined_paths(&pending),
                    "template did not converge: placeholders reference each other",
                ));
            }
            // Deepest keys first, so the paths of outer keys stay valid.
            renames.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            for (path, key) in renames {
                rename_key(&mut run, &path, key)?;
            }
            tracing::trace!(round = rounds, pending = pending.len(), "template round");
        }

        if let Some(mut commands) = commands {
            let ctx = render_context(&run, vars);
            let mut pending = Vec::new();
            collect_pending(&commands, &mut vec![CMD.to_string()], &mut pending);
            for item in pending {
                if item.is_key {
                    return Err(DesignError::template(
                        item.path.join("."),
                        "command keys cannot hold placeholders",
                    ));
                }
                let tmpl = self.compile(&item.path, &item.source)?;
                let rendered = render(&tmpl, &ctx, &item.path)?;
                if has_delimiters(&rendered) && !self.tolerate_undefined {
                    return Err(DesignError::template(
                        item.path.join("."),
                        "command still contains placeholders after rendering",
                    ));
                }
                if let Some(slot) = leaf_mut(&mut commands, &item.path[1..]) {
                    *slot = Value::String(rendered);
                }
            }
            if let Value::Object(fields) = &mut run {
                fields.insert(CMD.to_string(), commands);
            }
        }
        Ok(run)
    }

    fn compile<'s>(&'s self, path: &[String], source: &'s str) -> Result<Template<'s, 's>> {
        self.env
            .template_from_str(source)
            .map_err(|e| DesignError::template(path.join("."), e.to_string()))
    }

    /// A value that is exactly one `[% .. %]` expression keeps the type of
    /// what the expression evaluates to (`my_run.size * 2` gives `20`, a
    /// copied string stays a string). Anything else renders to a string.
    fn evaluate(
        &self,
        tmpl: &Template<'_, '_>,
        source: &str,
        ctx: &Map<String, Value>,
        path: &[String],
    ) -> Result<Value> {
        let Some(inner) = single_expression(source) else {
            return render(tmpl, ctx, path).map(Value::String);
        };
        let at = || path.join(".");
        let expr = self
            .env
            .compile_expression(inner)
            .map_err(|e| DesignError::template(at(), e.to_string()))?;
        let value = expr
            .eval(ctx)
            .map_err(|e| DesignError::template(at(), e.to_string()))?;
        if value.is_undefined() {
            if self.tolerate_undefined {
                return Ok(Value::String(String::new()));
            }
            return Err(DesignError::template(
                at(),
                format!("undefined value: {}", source.trim()),
            ));
        }
        serde_json::to_value(&value).map_err(|e| DesignError::template(at(), e.to_string()))
    }
}

fn render(tmpl: &Template<'_, '_>, ctx: &Map<String, Value>, path: &[String]) -> Result<String> {
    tmpl.render(ctx)
        .map_err(|e| DesignError::template(path.join("."), e.to_string()))
}

fn render_context(run: &Value, vars: &Map<String, Value>) -> Map<String, Value> {
    let mut ctx = vars.clone();
    ctx.insert(RUN_BINDING.to_string(), run.clone());
    ctx
}

fn joined_paths(pending: &[Pending]) -> String {
    pending
        .iter()
        .map(|item| item.path.join("."))
        .collect::<Vec<_>>()
        .join(", ")
}

/// String leaves (lists included, index as segment) and mapping keys that
/// still hold placeholders.
fn collect_pending(value: &Value, path: &mut LeafPath, out: &mut Vec<Pending>) {
    match value {
        Value::String(s) if has_delimiters(s) => out.push(Pending {
            path: path.clone(),
            source: s.clone(),
            is_key: false,
        }),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                path.push(idx.to_string());
                collect_pending(item, path, out);
                path.pop();
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                path.push(key.clone());
                if has_delimiters(key) {
                    out.push(Pending {
                        path: path.clone(),
                        source: key.clone(),
                        is_key: true,
                    });
                }
                collect_pending(item, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

fn leaf_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in path {
        cur = match cur {
            Value::Object(map) => map.get_mut(seg)?,
            Value::Array(items) => items.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn rename_key(run: &mut Value, path: &[String], key: String) -> Result<()> {
    let Some((old, parent)) = path.split_last() else {
        return Ok(());
    };
    let Some(Value::Object(map)) = leaf_mut(run, parent) else {
        return Err(DesignError::template(
            path.join("."),
            "mapping holding the key disappeared",
        ));
    };
    if key != *old && map.contains_key(&key) {
        return Err(DesignError::template(
            path.join("."),
            format!("rendered key '{}' collides with an existing key", key),
        ));
    }
    if let Some(value) = map.remove(old) {
        map.insert(key, value);
    }
    Ok(())
}

/// A leaf may render once every `my_run.*` value it reads is settled. The
/// leaf itself is ignored so that reading a parent mapping does not block.
fn dependencies_ready(tmpl: &Template<'_, '_>, snapshot: &Value, own: &[String]) -> bool {
    tmpl.undeclared_variables(true).iter().all(|dep| {
        let mut parts = dep.split('.');
        if parts.next() != Some(RUN_BINDING) {
            return true;
        }
        let mut cur = snapshot;
        let mut at: LeafPath = Vec::new();
        for seg in parts {
            match cur {
                Value::Object(map) => match map.get(seg) {
                    Some(next) => {
                        cur = next;
                        at.push(seg.to_string());
                    }
                    // The key may still be waiting for its own rendering.
                    None => return !map.keys().any(|k| has_delimiters(k)),
                },
                Value::String(s) => return !has_delimiters(s),
                _ => return true,
            }
        }
        !has_pending_below(cur, &mut at, own)
    })
}

fn has_pending_below(value: &Value, path: &mut LeafPath, own: &[String]) -> bool {
    match value {
        Value::String(s) => has_delimiters(s) && path.as_slice() != own,
        Value::Array(items) => items.iter().enumerate().any(|(idx, item)| {
            path.push(idx.to_string());
            let found = has_pending_below(item, path, own);
            path.pop();
            found
        }),
        Value::Object(map) => map.iter().any(|(key, item)| {
            path.push(key.clone());
            let found = (has_delimiters(key) && path.as_slice() != own)
                || has_pending_below(item, path, own);
            path.pop();
            found
        }),
        _ => false,
    }
}

/// The expression text of a source that is exactly one `[% .. %]` block,
/// without whitespace-control markers.
fn single_expression(source: &str) -> Option<&str> {
    let t = source.trim();
    if t.len() < EXPR_START.len() + EXPR_END.len()
        || !t.starts_with(EXPR_START)
        || !t.ends_with(EXPR_END)
    {
        return None;
    }
    let mut inner = &t[EXPR_START.len()..t.len() - EXPR_END.len()];
    if inner.contains(EXPR_START) || inner.contains(EXPR_END) {
        return None;
    }
    if let Some(rest) = inner.strip_prefix(&['-', '+'][..]) {
        if rest.starts_with(char::is_whitespace) {
            inner = rest;
        }
    }
    if let Some(rest) = inner.strip_suffix(&['-', '+'][..]) {
        if rest.ends_with(char::is_whitespace) {
            inner = rest;
        }
    }
    let inner = inner.trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> TemplateResolver {
        TemplateResolver::new(false).expect("resolver")
    }

    #[test]
    fn single_expression_keeps_numeric_type() {
        let run = json!({"size": 10, "value": "[% my_run.size * 2 %]"});
        let out = resolver().resolve_run(run, &Map::new()).expect("resolve");
        assert_eq!(out["value"], json!(20));
    }

    #[test]
    fn chained_references_resolve_in_dependency_order() {
        let run = json!({
            "value": "[% my_run.double * 2 %]",
            "double": "[% my_run.size * 2 %]",
            "size": "[% base %]",
            "label": "size=[% my_run.size %]"
        });
        let mut vars = Map::new();
        vars.insert("base".to_string(), json!(5));
        let out = resolver().resolve_run(run, &vars).expect("resolve");
        assert_eq!(out["size"], json!(5));
        assert_eq!(out["double"], json!(10));
        assert_eq!(out["value"], json!(20));
        assert_eq!(out["label"], json!("size=5"));
    }

    #[test]
    fn ansible_templates_pass_through() {
        let run = json!({"path": "{{ inventory_dir }}/[% my_run.name %]", "name": "x"});
        let out = resolver().resolve_run(run, &Map::new()).expect("resolve");
        assert_eq!(out["path"], json!("{{ inventory_dir }}/x"));
    }

    #[test]
    fn commands_see_resolved_run() {
        let run = json!({
            "size": 4,
            "arg": "--size [% my_run.size %]",
            "$CMD$": {"client": [{"main": "run.sh [% my_run.arg %] [% exp_name %]"}]}
        });
        let mut vars = Map::new();
        vars.insert("exp_name".to_string(), json!("demo"));
        let out = resolver().resolve_run(run, &vars).expect("resolve");
        assert_eq!(
            out["$CMD$"]["client"][0]["main"],
            json!("run.sh --size 4 demo")
        );
    }

    #[test]
    fn fields_cannot_reference_commands() {
        let run = json!({
            "copy": "[% my_run['$CMD$'] %]",
            "$CMD$": {"client": [{"main": "run.sh"}]}
        });
        assert!(resolver().resolve_run(run, &Map::new()).is_err());
    }

    #[test]
    fn undefined_reference_fails_unless_tolerated() {
        let run = json!({"x": "[% my_run.nope %]"});
        let err = resolver()
            .resolve_run(run.clone(), &Map::new())
            .expect_err("undefined");
        assert!(matches!(err, DesignError::Template { .. }));
        let out = TemplateResolver::new(true)
            .expect("lenient")
            .resolve_run(run, &Map::new())
            .expect("tolerated");
        assert_eq!(out["x"], json!(""));
    }

    #[test]
    fn self_referencing_value_does_not_loop_forever() {
        let run = json!({"a": "[% my_run.b %]", "b": "[% my_run.a %]"});
        let err = resolver()
            .resolve_run(run, &Map::new())
            .expect_err("cycle");
        assert!(err.to_string().contains("did not converge"), "unexpected: {}", err);

        let run = json!({"a": "[% my_run.a %]"});
        let err = resolver()
            .resolve_run(run, &Map::new())
            .expect_err("renders itself");
        assert!(err.to_string().contains("did not converge"), "unexpected: {}", err);
    }

    #[test]
    fn reserved_binding_is_rejected() {
        let mut vars = Map::new();
        vars.insert("my_run".to_string(), json!(1));
        assert!(resolver().resolve_run(json!({"a": 1}), &vars).is_err());
    }

    #[test]
    fn list_items_and_statements_are_rendered() {
        let run = json!({
            "n": 3,
            "args": ["-n", "[% my_run.n %]"],
            "mode": "<% if my_run.n > 2 %>big<% else %>small<% endif %>",
            "levels": "[% [1, 2] %]"
        });
        let out = resolver().resolve_run(run, &Map::new()).expect("resolve");
        assert_eq!(out["args"], json!(["-n", 3]));
        assert_eq!(out["mode"], json!("big"));
        assert_eq!(out["levels"], json!([1, 2]));
    }

    #[test]
    fn copied_strings_keep_their_type() {
        let run = json!({
            "version": "1.10",
            "flag": "true",
            "copy_ver": "[% my_run.version %]",
            "copy_flag": "[%- my_run.flag -%]",
            "size": 7,
            "copy_size": "[% my_run.size %]"
        });
        let out = resolver().resolve_run(run, &Map::new()).expect("resolve");
        assert_eq!(out["copy_ver"], json!("1.10"));
        assert_eq!(out["copy_flag"], json!("true"));
        assert_eq!(out["copy_size"], json!(7));
    }

    #[test]
    fn mapping_keys_are_rendered() {
        let run = json!({
            "name": "x",
            "dirs": {"[% my_run.name %]_dir": 1},
            "first": "[% my_run.dirs.x_dir %]"
        });
        let out = resolver().resolve_run(run, &Map::new()).expect("resolve");
        assert_eq!(out["dirs"], json!({"x_dir": 1}));
        assert_eq!(out["first"], json!(1));
    }

    #[test]
    fn rendered_key_collision_fails() {
        let run = json!({"dirs": {"[% 'a' %]": 1, "a": 2}});
        let err = resolver()
            .resolve_run(run, &Map::new())
            .expect_err("collision");
        assert!(err.to_string().contains("collides"), "unexpected: {}", err);
    }

    #[test]
    fn command_keys_cannot_hold_placeholders() {
        let run = json!({
            "$CMD$": {"client": [{"main": "run.sh", "[% 'mon' %]": "top"}]}
        });
        let err = resolver()
            .resolve_run(run, &Map::new())
            .expect_err("templated command key");
        assert!(matches!(err, DesignError::Template { .. }));
    }

    #[test]
    fn unpaired_delimiters_are_plain_text() {
        assert!(!has_delimiters("cat <<EOF > out"));
        assert!(!has_delimiters("grep '<#' file"));
        assert!(!has_delimiters("a <% b"));
        assert!(has_delimiters("<# note #>"));
        let run = json!({
            "heredoc": "cat <% EOF",
            "$CMD$": {"client": [{"main": "grep '<#' log.txt"}]}
        });
        let out = resolver().resolve_run(run.clone(), &Map::new()).expect("resolve");
        assert_eq!(out, run);
    }
}
