//! Jenkins build listing and artifact download.
//!
//! One configured job produces the deployable artifacts. [`BuildSource`]
//! lists its builds, [`ArtifactFetcher`] downloads the artifact of one build;
//! [`JenkinsClient`] implements both against the Jenkins JSON API.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One completed build of the configured job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub number: u64,
    pub queue_id: Option<u64>,
    pub url: String,
    /// Milliseconds since the epoch, as Jenkins reports it.
    pub timestamp: i64,
    /// Branch the build was made from, e.g. `fix/login-bug`.
    pub branch: Option<String>,
    /// Commit SHA the build was made from.
    pub commit_id: Option<String>,
    /// Absolute URL of the deployable artifact, if the build archived one.
    pub artifact_url: Option<String>,
}

/// Source of the builds eligible for portal deployment.
#[async_trait]
pub trait BuildSource: Send + Sync {
    async fn builds(&self) -> Result<Vec<Build>>;
}

/// Downloads the deployable artifact of a build.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch_artifact(&self, build: &Build) -> Result<Vec<u8>>;
}

// ── Jenkins JSON API client ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiJob {
    builds: Vec<ApiBuild>,
}

#[derive(Debug, Deserialize)]
struct ApiBuild {
    number: u64,
    #[serde(rename = "queueId")]
    queue_id: Option<u64>,
    url: String,
    timestamp: i64,
    #[serde(default)]
    actions: Vec<ApiAction>,
    #[serde(default)]
    artifacts: Vec<ApiArtifact>,
}

#[derive(Debug, Deserialize)]
struct ApiAction {
    #[serde(rename = "lastBuiltRevision")]
    last_built_revision: Option<ApiRevision>,
}

#[derive(Debug, Deserialize)]
struct ApiRevision {
    #[serde(rename = "SHA1")]
    sha1: Option<String>,
    #[serde(default)]
    branch: Vec<ApiBranch>,
}

#[derive(Debug, Deserialize)]
struct ApiBranch {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiArtifact {
    #[serde(rename = "relativePath")]
    relative_path: String,
}

pub struct JenkinsClient {
    http: reqwest::Client,
    host: String,
    job: String,
}

impl JenkinsClient {
    pub fn new(host: &str, job: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.trim_end_matches('/').to_string(),
            job: job.to_string(),
        }
    }
}

#[async_trait]
impl BuildSource for JenkinsClient {
    async fn builds(&self) -> Result<Vec<Build>> {
        let url = format!(
            "{}/job/{}/api/json?tree=builds[number,queueId,url,timestamp,\
             actions[lastBuiltRevision[SHA1,branch[name]]],artifacts[relativePath]]",
            self.host, self.job
        );

        let job: ApiJob = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to list builds of Jenkins job {}", self.job))?
            .error_for_status()
            .context("Jenkins job endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse Jenkins build listing")?;

        Ok(job.builds.into_iter().map(convert).collect())
    }
}

#[async_trait]
impl ArtifactFetcher for JenkinsClient {
    async fn fetch_artifact(&self, build: &Build) -> Result<Vec<u8>> {
        let url = build
            .artifact_url
            .as_deref()
            .ok_or_else(|| anyhow!("Build {} has no archived artifact", build.number))?;

        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to download artifact of build {}", build.number))?
            .error_for_status()
            .context("Jenkins artifact endpoint returned error status")?
            .bytes()
            .await
            .context("Failed to read artifact body")?;

        Ok(bytes.to_vec())
    }
}

fn convert(build: ApiBuild) -> Build {
    let revision = build
        .actions
        .iter()
        .find_map(|a| a.last_built_revision.as_ref());
    // Jenkins reports branches as "origin/<name>"; strip the remote prefix.
    let branch = revision
        .and_then(|r| r.branch.first())
        .and_then(|b| b.name.as_deref())
        .map(|name| name.strip_prefix("origin/").unwrap_or(name).to_string());
    let commit_id = revision.and_then(|r| r.sha1.clone());
    let artifact_url = build
        .artifacts
        .first()
        .map(|a| format!("{}artifact/{}", build.url, a.relative_path));

    Build {
        number: build.number,
        queue_id: build.queue_id,
        url: build.url,
        timestamp: build.timestamp,
        branch,
        commit_id,
        artifact_url,
    }
}
