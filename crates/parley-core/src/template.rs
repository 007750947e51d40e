//! Text templates rendered against session variables before synthesis.

use crate::session::Variables;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}|\{([A-Za-z_][\w.]*)\}").expect("placeholder pattern is valid")
    })
}

/// Pattern matching only the double-brace form; used to split templates into playlists.
pub(crate) fn double_brace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{.*?\}\}").expect("double-brace pattern is valid"))
}

/// Replace `{{ name }}`, `{{ session.variables.name }}` and `{name}` with variable values.
pub fn render(template: &str, variables: &Variables) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures| {
            let path = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let name = path.strip_prefix("session.variables.").unwrap_or(path);
            match variables.get(name) {
                Some(value) => value_text(value),
                None => {
                    debug!(variable = %name, "template variable not set");
                    String::new()
                }
            }
        })
        .into_owned()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match (n.as_f64(), n.as_i64()) {
            (Some(f), None) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patterns_compile() {
        assert!(placeholder_regex().is_match("{name}"));
        assert!(double_brace_regex().is_match("{{ name }}"));
    }

    #[test]
    fn renders_all_placeholder_forms() {
        let mut vars = Variables::new();
        vars.insert("contact_name".into(), json!("Alex"));
        vars.insert("property_value".into(), json!(5000000.0));

        let out = render(
            "{{ contact_name }}, {session.variables.contact_name}: {{session.variables.property_value}} / {missing}",
            &vars,
        );
        assert_eq!(out, "Alex, Alex: 5000000 / ");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(render("no placeholders", &Variables::new()), "no placeholders");
    }
}
