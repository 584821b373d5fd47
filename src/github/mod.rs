//! GitHub pull request listing.
//!
//! The resolver only needs open pull requests for one configured repository;
//! [`PullRequestSource`] is the seam, [`GithubClient`] the `reqwest`-backed
//! production implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("portald/", env!("CARGO_PKG_VERSION"));

/// An open pull request (subset of fields we care about).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub description: Option<String>,
    pub user: String,
    /// Head branch name, e.g. `feature/fix-login-bug`.
    pub branch: String,
    /// Head commit SHA.
    pub head: String,
    pub url: String,
    pub avatar_url: Option<String>,
}

/// Source of the open pull requests eligible for portal deployment.
#[async_trait]
pub trait PullRequestSource: Send + Sync {
    async fn pull_requests(&self) -> Result<Vec<PullRequest>>;
}

// ── GitHub REST client ────────────────────────────────────────────────

/// Wire format of the GitHub pulls endpoint (subset).
#[derive(Debug, Deserialize)]
struct ApiPull {
    number: u64,
    title: String,
    body: Option<String>,
    html_url: String,
    user: ApiUser,
    head: ApiRef,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
}

pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    /// Repository in `owner/repo` form.
    repo: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(repo: &str, token: Option<String>) -> Self {
        Self::with_api_url(GITHUB_API_URL, repo, token)
    }

    /// Point the client at a non-default API root (test servers).
    pub fn with_api_url(api_url: &str, repo: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token,
        }
    }
}

#[async_trait]
impl PullRequestSource for GithubClient {
    async fn pull_requests(&self) -> Result<Vec<PullRequest>> {
        let url = format!("{}/repos/{}/pulls?state=open", self.api_url, self.repo);
        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let pulls: Vec<ApiPull> = request
            .send()
            .await
            .with_context(|| format!("Failed to list pull requests for {}", self.repo))?
            .error_for_status()
            .context("GitHub pulls endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse pull request listing")?;

        Ok(pulls.into_iter().map(convert).collect())
    }
}

fn convert(pull: ApiPull) -> PullRequest {
    PullRequest {
        number: pull.number,
        title: pull.title,
        description: pull.body,
        user: pull.user.login,
        branch: pull.head.branch,
        head: pull.head.sha,
        url: pull.html_url,
        avatar_url: pull.user.avatar_url,
    }
}
