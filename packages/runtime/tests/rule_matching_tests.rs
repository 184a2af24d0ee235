//! Scenario tests for the routine rule language: event routing rules over
//! the closed envelope set and probe rules over structured probe output.

use runtime_core::domains::routines::rules::{
    evaluate, parse_rule, Rule, RuleError, RuleScope,
};
use serde_json::json;

fn github_pr_envelope() -> serde_json::Value {
    json!({
        "eventId": "2e0b8a",
        "source": "github",
        "eventType": "work_item.created",
        "sourceRef": "github:pr:812",
        "sessionKey": "github:acme/api",
        "pluginInstanceId": "f3c9",
        "actorKind": "human",
        "actorHandle": "mvasquez",
        "status": "queued",
        "title": "PR #812: retry budget for outbound webhooks",
        "createdAt": 1767225600,
    })
}

#[test]
fn event_rule_routes_human_github_prs() {
    let rule = parse_rule(
        &json!({
            "all": [
                {"field": "source", "op": "eq", "value": "github"},
                {"field": "actorKind", "op": "neq", "value": "agent"},
                {"field": "title", "op": "matches", "value": "^PR #\\d+"},
            ]
        }),
        RuleScope::Envelope,
    )
    .unwrap();

    assert!(evaluate(&rule, &github_pr_envelope()));

    let mut agent_event = github_pr_envelope();
    agent_event["actorKind"] = json!("agent");
    assert!(!evaluate(&rule, &agent_event));
}

#[test]
fn event_rule_can_exclude_noisy_sessions() {
    let rule = parse_rule(
        &json!({
            "not": {"field": "sessionKey", "op": "in", "value": ["github:acme/sandbox", "github:acme/playground"]}
        }),
        RuleScope::Envelope,
    )
    .unwrap();
    assert!(evaluate(&rule, &github_pr_envelope()));

    let mut sandbox = github_pr_envelope();
    sandbox["sessionKey"] = json!("github:acme/sandbox");
    assert!(!evaluate(&rule, &sandbox));
}

#[test]
fn probe_rule_fires_on_stale_pr_threshold() {
    // Shape produced by the github_stale_prs probe.
    let output = json!({
        "repo": "acme/api",
        "open_count": 14,
        "stale_count": 6,
        "threshold_days": 7,
    });
    let rule = parse_rule(
        &json!({"field": "stale_count", "op": "gte", "value": 5}),
        RuleScope::Probe,
    )
    .unwrap();
    assert!(evaluate(&rule, &output));

    let calm = json!({"repo": "acme/api", "open_count": 3, "stale_count": 0, "threshold_days": 7});
    assert!(!evaluate(&rule, &calm));
}

#[test]
fn probe_rule_descends_nested_output() {
    let output = json!({
        "repo": "acme/api",
        "ci": {"failure_rate": 0.4, "sample": 50},
    });
    let rule = parse_rule(
        &json!({
            "all": [
                {"field": "ci.sample", "op": "gte", "value": 20},
                {"field": "ci.failure_rate", "op": "gt", "value": 0.25},
            ]
        }),
        RuleScope::Probe,
    )
    .unwrap();
    assert!(evaluate(&rule, &output));
}

#[test]
fn envelope_scope_rejects_probe_style_paths() {
    let err = parse_rule(
        &json!({"field": "ci.failure_rate", "op": "gt", "value": 0.5}),
        RuleScope::Envelope,
    )
    .unwrap_err();
    assert!(matches!(err, RuleError::FieldNotAllowed(_)));
}

#[test]
fn rules_round_trip_through_json() {
    let source = json!({
        "any": [
            {"field": "actorHandle", "op": "exists"},
            {"not": {"field": "status", "op": "eq", "value": "queued"}},
        ]
    });
    let rule = parse_rule(&source, RuleScope::Envelope).unwrap();
    let serialized = serde_json::to_value(&rule).unwrap();
    let reparsed: Rule = serde_json::from_value(serialized).unwrap();
    assert_eq!(
        evaluate(&rule, &github_pr_envelope()),
        evaluate(&reparsed, &github_pr_envelope())
    );
}
