//! Jira ticket linkage.
//!
//! Candidates carry the ticket referenced by their pull request, and the
//! coordinator posts a comment on it when a portal starts. Ticket updates are
//! fire-and-forget: a failure is logged, never propagated.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A linked issue-tracker ticket (subset of fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub key: String,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
}

/// External issue tracker consumed by the resolver and coordinator.
#[async_trait]
pub trait TicketTracker: Send + Sync {
    /// Look up a ticket by key. `Ok(None)` when the key does not exist.
    async fn find_ticket(&self, key: &str) -> Result<Option<Ticket>>;

    /// Post a comment on the ticket.
    async fn update_ticket(&self, key: &str, comment: &str) -> Result<()>;
}

/// Tracker used when no Jira instance is configured: knows no tickets,
/// swallows updates.
pub struct NoopTracker;

#[async_trait]
impl TicketTracker for NoopTracker {
    async fn find_ticket(&self, _key: &str) -> Result<Option<Ticket>> {
        Ok(None)
    }

    async fn update_ticket(&self, key: &str, _comment: &str) -> Result<()> {
        tracing::debug!(ticket = key, "no tracker configured, dropping update");
        Ok(())
    }
}

/// Extract a ticket key (e.g. `DEV-1234`) from free text such as a PR title
/// or branch name. The first match wins.
pub fn extract_ticket_key(text: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"\b([A-Z][A-Z0-9]+-\d+)\b").expect("ticket key pattern is valid")
    });
    pattern.find(text).map(|m| m.as_str().to_string())
}

// ── Jira REST client ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiIssue {
    key: String,
    fields: ApiFields,
}

#[derive(Debug, Deserialize)]
struct ApiFields {
    summary: Option<String>,
    status: Option<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    name: String,
}

pub struct JiraClient {
    http: reqwest::Client,
    host: String,
    user: String,
    token: String,
}

impl JiraClient {
    pub fn new(host: &str, user: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.trim_end_matches('/').to_string(),
            user: user.to_string(),
            token: token.to_string(),
        }
    }

    fn browse_url(&self, key: &str) -> String {
        format!("{}/browse/{}", self.host, key)
    }
}

#[async_trait]
impl TicketTracker for JiraClient {
    async fn find_ticket(&self, key: &str) -> Result<Option<Ticket>> {
        let url = format!("{}/rest/api/2/issue/{}?fields=summary,status", self.host, key);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .await
            .with_context(|| format!("Failed to look up ticket {key}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let issue: ApiIssue = response
            .error_for_status()
            .context("Jira issue endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse Jira issue")?;

        Ok(Some(Ticket {
            url: Some(self.browse_url(&issue.key)),
            key: issue.key,
            summary: issue.fields.summary,
            status: issue.fields.status.map(|s| s.name),
        }))
    }

    async fn update_ticket(&self, key: &str, comment: &str) -> Result<()> {
        let url = format!("{}/rest/api/2/issue/{}/comment", self.host, key);
        self.http
            .post(&url)
            .basic_auth(&self.user, Some(&self.token))
            .json(&serde_json::json!({ "body": comment }))
            .send()
            .await
            .with_context(|| format!("Failed to comment on ticket {key}"))?
            .error_for_status()
            .context("Jira comment endpoint returned error status")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_key_from_branch_name() {
        assert_eq!(
            extract_ticket_key("feature/DEV-1234-fix-login"),
            Some("DEV-1234".to_string())
        );
    }

    #[test]
    fn extracts_key_from_title() {
        assert_eq!(
            extract_ticket_key("DCC-42: repair the session check"),
            Some("DCC-42".to_string())
        );
    }

    #[test]
    fn ignores_lowercase_and_bare_numbers() {
        assert_eq!(extract_ticket_key("dev-1234 fix"), None);
        assert_eq!(extract_ticket_key("issue 1234"), None);
    }

    #[test]
    fn first_match_wins() {
        assert_eq!(
            extract_ticket_key("DEV-1 and DEV-2"),
            Some("DEV-1".to_string())
        );
    }

    #[test]
    fn parses_issue_wire_format() {
        let issue: ApiIssue = serde_json::from_value(serde_json::json!({
            "key": "DEV-7",
            "fields": {"summary": "Fix login", "status": {"name": "In Review"}}
        }))
        .unwrap();
        assert_eq!(issue.key, "DEV-7");
        assert_eq!(issue.fields.summary.as_deref(), Some("Fix login"));
        assert_eq!(issue.fields.status.unwrap().name, "In Review");
    }
}
