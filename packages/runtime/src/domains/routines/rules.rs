//! Rule language for condition and event routines.
//!
//! An expression tree of `{all: [...]}`, `{any: [...]}`, `{not: ...}` and
//! leaf predicates `{field, op, value?}`. Envelope-mode rules may only
//! reference the closed envelope field set; probe-mode rules accept any
//! dotted alphanumeric path into the probe's output record.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOp {
    Eq,
    Neq,
    In,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
    Matches,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rule {
    All { all: Vec<Rule> },
    Any { any: Vec<Rule> },
    Not { not: Box<Rule> },
    Predicate {
        field: String,
        op: RuleOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
}

/// Which record shape the rule runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Event envelopes: closed field whitelist.
    Envelope,
    /// Probe output: any dotted alphanumeric path.
    Probe,
}

/// The closed envelope field set (see the routine event schema).
pub const ENVELOPE_FIELDS: &[&str] = &[
    "eventId",
    "source",
    "eventType",
    "sourceRef",
    "sessionKey",
    "pluginInstanceId",
    "actorKind",
    "actorHandle",
    "status",
    "title",
    "createdAt",
];

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("field '{0}' is not an envelope field")]
    FieldNotAllowed(String),
    #[error("field '{0}' is not a valid probe path")]
    InvalidProbePath(String),
    #[error("operator {0:?} requires a value")]
    ValueRequired(RuleOp),
    #[error("operator 'in' requires an array value")]
    InExpectsArray,
    #[error("operator 'matches' requires a string value")]
    MatchesExpectsString,
}

/// Parse and validate a rule for the given scope.
pub fn parse_rule(value: &Value, scope: RuleScope) -> Result<Rule, RuleError> {
    let rule: Rule = serde_json::from_value(value.clone())?;
    validate_rule(&rule, scope)?;
    Ok(rule)
}

pub fn validate_rule(rule: &Rule, scope: RuleScope) -> Result<(), RuleError> {
    match rule {
        Rule::All { all } => all.iter().try_for_each(|r| validate_rule(r, scope)),
        Rule::Any { any } => any.iter().try_for_each(|r| validate_rule(r, scope)),
        Rule::Not { not } => validate_rule(not, scope),
        Rule::Predicate { field, op, value } => {
            match scope {
                RuleScope::Envelope => {
                    if !ENVELOPE_FIELDS.contains(&field.as_str()) {
                        return Err(RuleError::FieldNotAllowed(field.clone()));
                    }
                }
                RuleScope::Probe => {
                    let valid = !field.is_empty()
                        && field
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
                    if !valid {
                        return Err(RuleError::InvalidProbePath(field.clone()));
                    }
                }
            }
            match op {
                RuleOp::Exists => Ok(()),
                RuleOp::In => match value {
                    Some(Value::Array(_)) => Ok(()),
                    _ => Err(RuleError::InExpectsArray),
                },
                RuleOp::Matches => match value {
                    Some(Value::String(_)) => Ok(()),
                    _ => Err(RuleError::MatchesExpectsString),
                },
                _ => match value {
                    Some(v) if !v.is_null() => Ok(()),
                    _ => Err(RuleError::ValueRequired(*op)),
                },
            }
        }
    }
}

/// Evaluate a validated rule against a record. Missing fields fail their
/// predicates; a regex that does not compile fails its predicate.
pub fn evaluate(rule: &Rule, record: &Value) -> bool {
    match rule {
        Rule::All { all } => all.iter().all(|r| evaluate(r, record)),
        Rule::Any { any } => any.iter().any(|r| evaluate(r, record)),
        Rule::Not { not } => !evaluate(not, record),
        Rule::Predicate { field, op, value } => {
            let field_value = lookup_path(record, field);
            evaluate_predicate(field_value, *op, value.as_ref())
        }
    }
}

fn lookup_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn evaluate_predicate(field: Option<&Value>, op: RuleOp, expected: Option<&Value>) -> bool {
    match op {
        RuleOp::Exists => matches!(field, Some(v) if !v.is_null()),
        RuleOp::Eq => matches!((field, expected), (Some(f), Some(e)) if f == e),
        RuleOp::Neq => match (field, expected) {
            (Some(f), Some(e)) => f != e,
            _ => false,
        },
        RuleOp::In => match (field, expected) {
            (Some(f), Some(Value::Array(options))) => options.contains(f),
            _ => false,
        },
        RuleOp::Contains => match (field, expected) {
            (Some(Value::String(haystack)), Some(Value::String(needle))) => {
                haystack.contains(needle.as_str())
            }
            (Some(Value::Array(items)), Some(e)) => items.contains(e),
            _ => false,
        },
        RuleOp::Gt | RuleOp::Gte | RuleOp::Lt | RuleOp::Lte => {
            let (Some(f), Some(e)) = (field.and_then(Value::as_f64), expected.and_then(|v| v.as_f64()))
            else {
                return false;
            };
            match op {
                RuleOp::Gt => f > e,
                RuleOp::Gte => f >= e,
                RuleOp::Lt => f < e,
                RuleOp::Lte => f <= e,
                _ => unreachable!(),
            }
        }
        RuleOp::Matches => match (field, expected) {
            (Some(Value::String(text)), Some(Value::String(pattern))) => {
                match Regex::new(pattern) {
                    Ok(re) => re.is_match(text),
                    Err(_) => false,
                }
            }
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Value {
        json!({
            "eventId": "e-1",
            "source": "github",
            "eventType": "work_item.created",
            "sourceRef": "gh:42",
            "sessionKey": "repo:app",
            "pluginInstanceId": null,
            "actorKind": "human",
            "actorHandle": "dana",
            "status": "queued",
            "title": "PR #42 opened",
            "createdAt": 1700000000,
        })
    }

    fn parse(value: Value, scope: RuleScope) -> Rule {
        parse_rule(&value, scope).unwrap()
    }

    #[test]
    fn eq_matches_exact_value() {
        let rule = parse(json!({"field": "source", "op": "eq", "value": "github"}), RuleScope::Envelope);
        assert!(evaluate(&rule, &envelope()));
    }

    #[test]
    fn neq_rejects_equal_value() {
        let rule = parse(json!({"field": "source", "op": "neq", "value": "github"}), RuleScope::Envelope);
        assert!(!evaluate(&rule, &envelope()));
    }

    #[test]
    fn neq_fails_on_missing_field() {
        let rule = parse(json!({"field": "actorHandle", "op": "neq", "value": "x"}), RuleScope::Envelope);
        let record = json!({"source": "github"});
        assert!(!evaluate(&rule, &record));
    }

    #[test]
    fn in_checks_membership() {
        let rule = parse(
            json!({"field": "actorKind", "op": "in", "value": ["human", "system"]}),
            RuleScope::Envelope,
        );
        assert!(evaluate(&rule, &envelope()));
    }

    #[test]
    fn contains_works_on_strings() {
        let rule = parse(
            json!({"field": "title", "op": "contains", "value": "#42"}),
            RuleScope::Envelope,
        );
        assert!(evaluate(&rule, &envelope()));
    }

    #[test]
    fn numeric_comparisons() {
        let record = json!({"count": 7});
        for (op, value, expected) in [
            ("gt", 5, true),
            ("gt", 7, false),
            ("gte", 7, true),
            ("lt", 10, true),
            ("lte", 6, false),
        ] {
            let rule = parse(json!({"field": "count", "op": op, "value": value}), RuleScope::Probe);
            assert_eq!(evaluate(&rule, &record), expected, "op {op} value {value}");
        }
    }

    #[test]
    fn comparison_on_non_numeric_is_false() {
        let rule = parse(json!({"field": "title", "op": "gt", "value": 5}), RuleScope::Envelope);
        assert!(!evaluate(&rule, &envelope()));
    }

    #[test]
    fn exists_checks_presence() {
        let rule = parse(json!({"field": "actorHandle", "op": "exists"}), RuleScope::Envelope);
        assert!(evaluate(&rule, &envelope()));
        let rule = parse(json!({"field": "pluginInstanceId", "op": "exists"}), RuleScope::Envelope);
        assert!(!evaluate(&rule, &envelope()), "null does not exist");
    }

    #[test]
    fn matches_applies_regex() {
        let rule = parse(
            json!({"field": "title", "op": "matches", "value": "^PR #\\d+"}),
            RuleScope::Envelope,
        );
        assert!(evaluate(&rule, &envelope()));
    }

    #[test]
    fn bad_regex_evaluates_false() {
        let rule = parse(
            json!({"field": "title", "op": "matches", "value": "(["}),
            RuleScope::Envelope,
        );
        assert!(!evaluate(&rule, &envelope()));
    }

    #[test]
    fn all_any_not_compose() {
        let rule = parse(
            json!({
                "all": [
                    {"field": "source", "op": "eq", "value": "github"},
                    {"any": [
                        {"field": "actorKind", "op": "eq", "value": "human"},
                        {"field": "actorKind", "op": "eq", "value": "system"},
                    ]},
                    {"not": {"field": "title", "op": "contains", "value": "draft"}},
                ]
            }),
            RuleScope::Envelope,
        );
        assert!(evaluate(&rule, &envelope()));
    }

    #[test]
    fn empty_all_is_true_and_empty_any_is_false() {
        let all = parse(json!({"all": []}), RuleScope::Envelope);
        let any = parse(json!({"any": []}), RuleScope::Envelope);
        assert!(evaluate(&all, &envelope()));
        assert!(!evaluate(&any, &envelope()));
    }

    #[test]
    fn dotted_paths_descend_in_probe_mode() {
        let record = json!({"repo": {"open_prs": {"stale": 3}}});
        let rule = parse(
            json!({"field": "repo.open_prs.stale", "op": "gte", "value": 3}),
            RuleScope::Probe,
        );
        assert!(evaluate(&rule, &record));
    }

    #[test]
    fn envelope_mode_rejects_unknown_fields() {
        let err = parse_rule(
            &json!({"field": "repo.open_prs", "op": "exists"}),
            RuleScope::Envelope,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::FieldNotAllowed(_)));
    }

    #[test]
    fn probe_mode_rejects_bad_paths() {
        let err = parse_rule(
            &json!({"field": "repo prs!", "op": "exists"}),
            RuleScope::Probe,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::InvalidProbePath(_)));
    }

    #[test]
    fn in_requires_array_value() {
        let err = parse_rule(
            &json!({"field": "source", "op": "in", "value": "github"}),
            RuleScope::Envelope,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::InExpectsArray));
    }

    #[test]
    fn matches_requires_string_value() {
        let err = parse_rule(
            &json!({"field": "source", "op": "matches", "value": 1}),
            RuleScope::Envelope,
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::MatchesExpectsString));
    }

    #[test]
    fn comparison_ops_require_a_value() {
        let err = parse_rule(&json!({"field": "source", "op": "eq"}), RuleScope::Envelope)
            .unwrap_err();
        assert!(matches!(err, RuleError::ValueRequired(RuleOp::Eq)));
    }
}
