//! Builtin condition probes.
//!
//! Probes are read-only checks against external systems whose structured
//! output feeds the routine rule language in probe mode. All builtins talk
//! to the GitHub REST API.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::kernel::Probe;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "agent-runtime-probe";

fn require_repo(config: &Value) -> Result<&str> {
    config
        .get("repo")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("probe config requires a 'repo' (owner/name)"))
}

async fn github_get(client: &reqwest::Client, url: &str, config: &Value) -> Result<Value> {
    let mut request = client
        .get(url)
        .header("User-Agent", USER_AGENT)
        .header("Accept", "application/vnd.github+json");
    if let Some(token) = config.get("token").and_then(Value::as_str) {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.context("github request failed")?;
    if !response.status().is_success() {
        anyhow::bail!("github returned {}", response.status());
    }
    response.json().await.context("github response was not json")
}

/// Open PRs that have not been updated within the threshold.
pub struct GithubStalePrs {
    client: reqwest::Client,
}

impl GithubStalePrs {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for GithubStalePrs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for GithubStalePrs {
    fn name(&self) -> &'static str {
        "github_stale_prs"
    }

    async fn run(&self, config: &Value) -> Result<Value> {
        let repo = require_repo(config)?;
        let stale_days = config.get("stale_days").and_then(Value::as_i64).unwrap_or(7);
        let url = format!("{GITHUB_API}/repos/{repo}/pulls?state=open&per_page=100");
        let pulls = github_get(&self.client, &url, config).await?;
        let cutoff = Utc::now() - Duration::days(stale_days);
        Ok(stale_pr_record(repo, &pulls, cutoff, stale_days))
    }
}

fn stale_pr_record(repo: &str, pulls: &Value, cutoff: DateTime<Utc>, stale_days: i64) -> Value {
    let empty = Vec::new();
    let pulls = pulls.as_array().unwrap_or(&empty);
    let stale = pulls
        .iter()
        .filter(|pr| {
            pr.get("updated_at")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                .is_some_and(|updated| updated < cutoff)
        })
        .count();
    json!({
        "repo": repo,
        "open_count": pulls.len(),
        "stale_count": stale,
        "threshold_days": stale_days,
    })
}

/// Open Dependabot alerts by severity.
pub struct GithubDependencyAlerts {
    client: reqwest::Client,
}

impl GithubDependencyAlerts {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for GithubDependencyAlerts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for GithubDependencyAlerts {
    fn name(&self) -> &'static str {
        "github_dependency_alerts"
    }

    async fn run(&self, config: &Value) -> Result<Value> {
        let repo = require_repo(config)?;
        let url = format!("{GITHUB_API}/repos/{repo}/dependabot/alerts?state=open&per_page=100");
        let alerts = github_get(&self.client, &url, config).await?;
        Ok(alert_record(repo, &alerts))
    }
}

fn alert_record(repo: &str, alerts: &Value) -> Value {
    let empty = Vec::new();
    let alerts = alerts.as_array().unwrap_or(&empty);
    let severity_count = |severity: &str| {
        alerts
            .iter()
            .filter(|a| {
                a.pointer("/security_advisory/severity")
                    .and_then(Value::as_str)
                    == Some(severity)
            })
            .count()
    };
    json!({
        "repo": repo,
        "open_alerts": alerts.len(),
        "critical": severity_count("critical"),
        "high": severity_count("high"),
    })
}

/// Failure rate over the most recent completed workflow runs.
pub struct CiFailureRate {
    client: reqwest::Client,
}

impl CiFailureRate {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for CiFailureRate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for CiFailureRate {
    fn name(&self) -> &'static str {
        "ci_failure_rate"
    }

    async fn run(&self, config: &Value) -> Result<Value> {
        let repo = require_repo(config)?;
        let url = format!("{GITHUB_API}/repos/{repo}/actions/runs?status=completed&per_page=50");
        let body = github_get(&self.client, &url, config).await?;
        Ok(ci_record(repo, &body))
    }
}

fn ci_record(repo: &str, body: &Value) -> Value {
    let empty = Vec::new();
    let runs = body
        .get("workflow_runs")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let failures = runs
        .iter()
        .filter(|run| run.get("conclusion").and_then(Value::as_str) == Some("failure"))
        .count();
    let rate = if runs.is_empty() {
        0.0
    } else {
        failures as f64 / runs.len() as f64
    };
    json!({
        "repo": repo,
        "sample": runs.len(),
        "failures": failures,
        "failure_rate": rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_record_counts_old_pulls() {
        let cutoff = Utc::now() - Duration::days(7);
        let pulls = json!([
            {"updated_at": "2020-01-01T00:00:00Z"},
            {"updated_at": Utc::now().to_rfc3339()},
        ]);
        let record = stale_pr_record("o/r", &pulls, cutoff, 7);
        assert_eq!(record["open_count"], 2);
        assert_eq!(record["stale_count"], 1);
    }

    #[test]
    fn alert_record_counts_by_severity() {
        let alerts = json!([
            {"security_advisory": {"severity": "critical"}},
            {"security_advisory": {"severity": "high"}},
            {"security_advisory": {"severity": "high"}},
            {"security_advisory": {"severity": "low"}},
        ]);
        let record = alert_record("o/r", &alerts);
        assert_eq!(record["open_alerts"], 4);
        assert_eq!(record["critical"], 1);
        assert_eq!(record["high"], 2);
    }

    #[test]
    fn ci_record_computes_the_rate() {
        let body = json!({"workflow_runs": [
            {"conclusion": "success"},
            {"conclusion": "failure"},
            {"conclusion": "failure"},
            {"conclusion": "success"},
        ]});
        let record = ci_record("o/r", &body);
        assert_eq!(record["sample"], 4);
        assert_eq!(record["failures"], 2);
        assert_eq!(record["failure_rate"], 0.5);
    }

    #[test]
    fn ci_record_handles_empty_samples() {
        let record = ci_record("o/r", &json!({"workflow_runs": []}));
        assert_eq!(record["failure_rate"], 0.0);
    }
}
