//! Portal domain model and lifecycle components.

pub mod candidate;
pub mod deployer;
pub mod executor;
pub mod fs;
pub mod locks;
pub mod logs;
pub mod repository;
pub mod service;

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::github::PullRequest;
use crate::jenkins::Build;
use crate::jira::Ticket;

pub use candidate::CandidateResolver;
pub use deployer::PortalDeployer;
pub use executor::{PortalExecutor, RunStatus};
pub use fs::PortalFileSystem;
pub use locks::PortalLocks;
pub use logs::PortalLogService;
pub use repository::PortalRepository;
pub use service::PortalService;

pub type PortalId = u32;

/// One deployed, independently running instance of the target artifact,
/// associated with one pull request.
///
/// Runtime state is deliberately absent: it is always a live query against
/// the executor, never cached here, so the record can never disagree with the
/// actual process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portal {
    pub id: PortalId,
    /// Unique, URL-safe mnemonic. Always in canonical slug form.
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub ticket_key: Option<String>,
    /// User-supplied configuration overrides, rendered into the settings file.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Snapshot of the candidate this portal was built from. A value copy:
    /// the candidate going stale later does not affect the deployed portal.
    pub target: Candidate,
    /// Externally reachable URL, assigned after deployment from the port in
    /// the generated settings.
    pub url: Option<String>,
    /// Settings generated at deploy time (always contains `server.port`).
    #[serde(default)]
    pub system_config: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A resolved, not-yet-deployed pairing of a pull request, its matching
/// build, and an optional tracking ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub pr: PullRequest,
    pub build: Build,
    pub ticket: Option<Ticket>,
}

/// Run state of a portal's supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotDeployed,
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDeployed => "not_deployed",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }

    /// True while a process is expected to be alive.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_deployed" => Ok(Self::NotDeployed),
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run state: {}", s)),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert a title to its canonical URL-safe slug form.
///
/// A slug is valid iff it equals its own slugification.
pub fn slugify(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
pub mod test_support {
    //! Shared fixtures for unit tests across the portal modules.

    use super::*;

    pub fn sample_pr(number: u64, title: &str) -> PullRequest {
        PullRequest {
            number,
            title: title.to_string(),
            description: Some(format!("Description of PR {number}")),
            user: "alice".to_string(),
            branch: format!("feature/pr-{number}"),
            head: format!("sha-{number}"),
            url: format!("https://github.com/org/repo/pull/{number}"),
            avatar_url: None,
        }
    }

    pub fn sample_build(number: u64, branch: &str) -> Build {
        Build {
            number,
            queue_id: Some(number),
            url: format!("https://jenkins.test/job/portal/{number}/"),
            timestamp: 1_717_171_717_000,
            branch: Some(branch.to_string()),
            commit_id: Some(format!("sha-{number}")),
            artifact_url: Some(format!(
                "https://jenkins.test/job/portal/{number}/artifact/portal.jar"
            )),
        }
    }

    pub fn sample_candidate(pr_number: u64, title: &str) -> Candidate {
        let pr = sample_pr(pr_number, title);
        let build = sample_build(100 + pr_number, &pr.branch);
        Candidate {
            pr,
            build,
            ticket: None,
        }
    }

    pub fn sample_portal(id: PortalId, slug: &str) -> Portal {
        let now = Utc::now();
        Portal {
            id,
            slug: slug.to_string(),
            title: slug.replace('-', " "),
            description: None,
            ticket_key: None,
            config: BTreeMap::new(),
            target: sample_candidate(42, "Fix login bug"),
            url: None,
            system_config: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
