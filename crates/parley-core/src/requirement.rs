//! Required-ness rules for goal parameters.
//!
//! A rule is either a static flag, a structured predicate, or a legacy expression string. Legacy
//! strings are parsed once, at catalog load, by a restricted grammar over variable names:
//!
//! ```text
//! rule    := "true" | "false" | var | ("not" | "!") var | var ("==" | "!=") literal
//! var     := name | session.variables.name | session['variables'].get('name')
//!          | session['variables']['name']
//! literal := true | True | false | False | null | None | number | 'text' | "text"
//! ```
//!
//! Nothing is ever executed. A string outside the grammar resolves to `Never` (fail-open).

use crate::session::Variables;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::warn;

/// When a goal parameter must be asked for.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawRequirement")]
pub enum Requirement {
    Always,
    Never,
    IfVariableSet(String),
    IfVariableUnset(String),
    IfVariableEquals(String, Value),
    IfVariableNotEquals(String, Value),
}

impl Default for Requirement {
    fn default() -> Self {
        Requirement::Never
    }
}

impl Requirement {
    /// Total, side-effect-free evaluation against the collected variables.
    pub fn is_required(&self, variables: &Variables) -> bool {
        match self {
            Requirement::Always => true,
            Requirement::Never => false,
            Requirement::IfVariableSet(name) => is_set(variables, name),
            Requirement::IfVariableUnset(name) => !is_set(variables, name),
            Requirement::IfVariableEquals(name, expected) => variables
                .get(name)
                .is_some_and(|actual| values_equal(actual, expected)),
            Requirement::IfVariableNotEquals(name, expected) => !variables
                .get(name)
                .is_some_and(|actual| values_equal(actual, expected)),
        }
    }

    /// Variable this rule reads, if any.
    pub fn variable(&self) -> Option<&str> {
        match self {
            Requirement::Always | Requirement::Never => None,
            Requirement::IfVariableSet(name)
            | Requirement::IfVariableUnset(name)
            | Requirement::IfVariableEquals(name, _)
            | Requirement::IfVariableNotEquals(name, _) => Some(name),
        }
    }

    /// Parse a legacy expression string.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        match expr {
            "true" | "True" => return Ok(Requirement::Always),
            "false" | "False" => return Ok(Requirement::Never),
            _ => {}
        }

        if let Some((lhs, rhs)) = expr.split_once("==") {
            let name = parse_variable(lhs).ok_or_else(|| format!("bad operand: {lhs}"))?;
            let value = parse_literal(rhs).ok_or_else(|| format!("bad literal: {rhs}"))?;
            return Ok(Requirement::IfVariableEquals(name, value));
        }
        if let Some((lhs, rhs)) = expr.split_once("!=") {
            let name = parse_variable(lhs).ok_or_else(|| format!("bad operand: {lhs}"))?;
            let value = parse_literal(rhs).ok_or_else(|| format!("bad literal: {rhs}"))?;
            return Ok(Requirement::IfVariableNotEquals(name, value));
        }

        let negated = expr
            .strip_prefix("not ")
            .or_else(|| expr.strip_prefix('!'));
        if let Some(rest) = negated {
            let name = parse_variable(rest).ok_or_else(|| format!("bad operand: {rest}"))?;
            return Ok(Requirement::IfVariableUnset(name));
        }

        parse_variable(expr)
            .map(Requirement::IfVariableSet)
            .ok_or_else(|| format!("unsupported expression: {expr}"))
    }
}

fn is_set(variables: &Variables, name: &str) -> bool {
    variables.get(name).is_some_and(|v| !v.is_null())
}

/// Numbers compare by value so `5000000` equals `5000000.0`.
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

fn variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^(?:session\.variables\.([A-Za-z_]\w*)|session\[['"]variables['"]\]\.get\(\s*['"]([A-Za-z_]\w*)['"]\s*\)|session\[['"]variables['"]\]\[['"]([A-Za-z_]\w*)['"]\]|([A-Za-z_]\w*))$"#,
        )
        .expect("variable pattern is valid")
    })
}

fn parse_variable(raw: &str) -> Option<String> {
    let caps = variable_regex().captures(raw.trim())?;
    let name = (1..=4).find_map(|i| caps.get(i))?.as_str();
    match name {
        "true" | "True" | "false" | "False" | "not" | "session" => None,
        _ => Some(name.to_string()),
    }
}

fn parse_literal(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    match raw {
        "true" | "True" => return Some(Value::Bool(true)),
        "false" | "False" => return Some(Value::Bool(false)),
        "null" | "None" => return Some(Value::Null),
        _ => {}
    }
    let quoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    if let Some(text) = quoted {
        return Some(Value::String(text.to_string()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Number(_)) => Some(v),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRequirement {
    Flag(bool),
    Expr(String),
    Rule(RuleSpec),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum RuleSpec {
    IfSet(String),
    IfUnset(String),
    IfEquals { variable: String, value: Value },
    IfNotEquals { variable: String, value: Value },
}

impl From<RawRequirement> for Requirement {
    fn from(raw: RawRequirement) -> Self {
        match raw {
            RawRequirement::Flag(true) => Requirement::Always,
            RawRequirement::Flag(false) => Requirement::Never,
            RawRequirement::Expr(expr) => Requirement::parse(&expr).unwrap_or_else(|reason| {
                warn!(expr = %expr, reason = %reason, "unparseable required-ness rule; treating as not required");
                Requirement::Never
            }),
            RawRequirement::Rule(RuleSpec::IfSet(name)) => Requirement::IfVariableSet(name),
            RawRequirement::Rule(RuleSpec::IfUnset(name)) => Requirement::IfVariableUnset(name),
            RawRequirement::Rule(RuleSpec::IfEquals { variable, value }) => {
                Requirement::IfVariableEquals(variable, value)
            }
            RawRequirement::Rule(RuleSpec::IfNotEquals { variable, value }) => {
                Requirement::IfVariableNotEquals(variable, value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn variable_pattern_compiles() {
        assert!(variable_regex().is_match("session.variables.wants_inner_insurance"));
    }

    #[test]
    fn parses_python_style_lookup() {
        let rule = Requirement::parse("session['variables'].get('wants_inner_insurance') == True").unwrap();
        assert_eq!(
            rule,
            Requirement::IfVariableEquals("wants_inner_insurance".into(), Value::Bool(true))
        );
        assert!(rule.is_required(&vars(&[("wants_inner_insurance", json!(true))])));
        assert!(!rule.is_required(&vars(&[("wants_inner_insurance", json!(false))])));
        assert!(!rule.is_required(&Variables::new()));
    }

    #[test]
    fn parses_dotted_and_bare_forms() {
        assert_eq!(
            Requirement::parse("session.variables.address").unwrap(),
            Requirement::IfVariableSet("address".into())
        );
        assert_eq!(
            Requirement::parse("not address").unwrap(),
            Requirement::IfVariableUnset("address".into())
        );
        assert_eq!(
            Requirement::parse("kind != 'flat'").unwrap(),
            Requirement::IfVariableNotEquals("kind".into(), json!("flat"))
        );
    }

    #[test]
    fn rejects_anything_outside_the_grammar() {
        assert!(Requirement::parse("__import__('os').system('rm -rf /')").is_err());
        assert!(Requirement::parse("a == b == c").is_err());
        assert!(Requirement::parse("len(session) > 2").is_err());
    }

    #[test]
    fn unparseable_json_rule_fails_open() {
        let rule: Requirement = serde_json::from_str(r#""exec('boom')""#).unwrap();
        assert_eq!(rule, Requirement::Never);
        assert!(!rule.is_required(&Variables::new()));
    }

    #[test]
    fn structured_rules_deserialize() {
        let rule: Requirement =
            serde_json::from_value(json!({"if_equals": {"variable": "n", "value": 5000000}})).unwrap();
        assert!(rule.is_required(&vars(&[("n", json!(5000000.0))])));

        let flag: Requirement = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(flag, Requirement::Always);

        let unset: Requirement = serde_json::from_value(json!({"if_unset": "x"})).unwrap();
        assert!(unset.is_required(&vars(&[("x", Value::Null)])));
    }
}
