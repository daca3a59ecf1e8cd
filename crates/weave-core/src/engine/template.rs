//! Placeholder resolution for step configs at dispatch time.
//!
//! Supported:
//!   ${context.<key>}       - value visible at the step's context scope
//!   ${steps.<id>.result}   - result of an upstream step
//!
//! A string that is exactly one placeholder becomes the referenced JSON
//! value; placeholders embedded in longer strings are spliced in as text.
//! Unresolved placeholders are left verbatim.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{(?:context\.([^}]+)|steps\.([^.}]+)\.result)\}")
            .expect("placeholder pattern is valid")
    })
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Placeholders {
    pub context_keys: BTreeSet<String>,
    pub step_ids: BTreeSet<String>,
}

#[derive(Debug, Default, Clone)]
pub struct TemplateVars {
    pub context: HashMap<String, Value>,
    pub steps: HashMap<String, Value>,
}

/// Collect every placeholder referenced anywhere inside `config`.
pub fn placeholders(config: &Value) -> Placeholders {
    let mut found = Placeholders::default();
    collect(config, &mut found);
    found
}

fn collect(value: &Value, found: &mut Placeholders) {
    match value {
        Value::String(s) => {
            for caps in placeholder_re().captures_iter(s) {
                if let Some(key) = caps.get(1) {
                    found.context_keys.insert(key.as_str().to_string());
                } else if let Some(id) = caps.get(2) {
                    found.step_ids.insert(id.as_str().to_string());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

pub fn render(config: &Value, vars: &TemplateVars) -> Value {
    match config {
        Value::String(s) => render_string(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup<'a>(caps: &Captures<'_>, vars: &'a TemplateVars) -> Option<&'a Value> {
    if let Some(key) = caps.get(1) {
        vars.context.get(key.as_str())
    } else {
        caps.get(2).and_then(|id| vars.steps.get(id.as_str()))
    }
}

fn render_string(s: &str, vars: &TemplateVars) -> Value {
    let re = placeholder_re();
    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            return lookup(&caps, vars)
                .cloned()
                .unwrap_or_else(|| Value::String(s.to_string()));
        }
    }
    let spliced = re.replace_all(s, |caps: &Captures| match lookup(caps, vars) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => caps[0].to_string(),
    });
    Value::String(spliced.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> TemplateVars {
        let mut v = TemplateVars::default();
        v.context.insert("branch".into(), json!("main"));
        v.steps.insert("design".into(), json!({"modules": ["api", "db"]}));
        v
    }

    #[test]
    fn whole_placeholder_keeps_json_type() {
        let out = render(&json!({"spec": "${steps.design.result}"}), &vars());
        assert_eq!(out["spec"]["modules"][1], "db");
    }

    #[test]
    fn embedded_placeholders_are_spliced_and_unknown_ones_kept() {
        let out = render(
            &json!(["on ${context.branch}: ${steps.design.result}", "${context.missing}"]),
            &vars(),
        );
        assert_eq!(out[0], r#"on main: {"modules":["api","db"]}"#);
        assert_eq!(out[1], "${context.missing}");
    }

    #[test]
    fn collects_references() {
        let found = placeholders(&json!({
            "a": "${context.branch}",
            "b": ["x ${steps.design.result} ${context.owner}"],
            "c": 3
        }));
        assert_eq!(
            found.context_keys.into_iter().collect::<Vec<_>>(),
            vec!["branch", "owner"]
        );
        assert_eq!(found.step_ids.into_iter().collect::<Vec<_>>(), vec!["design"]);
    }
}
