//! Daemon configuration.
//!
//! Layered the usual way: `portald.toml` → environment → CLI flags. Secrets
//! (GitHub/Jira tokens) are normally supplied through the environment, with
//! `.env` files honored via `dotenvy` in `main`.
//!
//! ```toml
//! public_url = "https://preview.example.org"
//! workspace_dir = "/var/lib/portald"
//! artifact_base_name = "portal"
//! base_port = 9000
//!
//! [github]
//! repo = "example/portal"
//!
//! [jenkins]
//! host = "https://jenkins.example.org"
//! job = "portal-pr"
//!
//! [jira]
//! host = "https://jira.example.org"
//! user = "portald"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the daemon's own API.
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL; per-portal URLs substitute their port
    /// into it.
    pub public_url: String,
    pub workspace_dir: PathBuf,
    /// Base name of the deployed artifact (script/jar/log file names).
    pub artifact_base_name: String,
    /// Portal `id` listens on `base_port + id`.
    pub base_port: u16,
    /// How long a spawned process must survive to count as running.
    pub startup_grace_ms: u64,
    /// Exit-poll interval of the process monitor.
    pub process_poll_ms: u64,
    /// PR/build listing refresh interval.
    pub poll_interval_secs: u64,
    pub github: GithubConfig,
    pub jenkins: JenkinsConfig,
    pub jira: Option<JiraConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    /// Repository in `owner/repo` form.
    pub repo: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JenkinsConfig {
    pub host: String,
    pub job: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraConfig {
    pub host: String,
    pub user: String,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            public_url: "http://localhost".to_string(),
            workspace_dir: PathBuf::from("workspace"),
            artifact_base_name: "portal".to_string(),
            base_port: 9000,
            startup_grace_ms: 3000,
            process_poll_ms: 1000,
            poll_interval_secs: 60,
            github: GithubConfig::default(),
            jenkins: JenkinsConfig::default(),
            jira: None,
        }
    }
}

impl ServerConfig {
    /// Load from `path` (default `portald.toml`; a missing default file
    /// yields the built-in defaults), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(|| Path::new("portald.toml"));

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else if explicit {
            anyhow::bail!("Config file {} does not exist", path.display());
        } else {
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Fold environment overrides in. Takes the lookup as a closure so tests
    /// don't have to mutate the process environment.
    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get("PORTALD_PUBLIC_URL") {
            self.public_url = url;
        }
        if let Some(token) = get("PORTALD_GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(token) = get("PORTALD_JIRA_TOKEN")
            && let Some(jira) = &mut self.jira
        {
            jira.token = Some(token);
        }
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn process_poll(&self) -> Duration {
        Duration::from_millis(self.process_poll_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sensible() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.base_port, 9000);
        assert_eq!(config.artifact_base_name, "portal");
        assert!(config.jira.is_none());
    }

    #[test]
    fn loads_full_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("portald.toml");
        fs::write(
            &path,
            r#"
public_url = "https://preview.example.org"
workspace_dir = "/var/lib/portald"
base_port = 9100
poll_interval_secs = 30

[github]
repo = "example/portal"
token = "ghp_file"

[jenkins]
host = "https://jenkins.example.org"
job = "portal-pr"

[jira]
host = "https://jira.example.org"
user = "portald"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.public_url, "https://preview.example.org");
        assert_eq!(config.base_port, 9100);
        assert_eq!(config.github.repo, "example/portal");
        assert_eq!(config.jenkins.job, "portal-pr");
        assert_eq!(config.jira.as_ref().unwrap().user, "portald");
        // Unset keys keep their defaults.
        assert_eq!(config.port, 8080);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("portald.toml");
        fs::write(&path, "base_port = 9500\n").unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.base_port, 9500);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn explicit_missing_file_errors() {
        assert!(ServerConfig::load(Some(Path::new("/nonexistent/portald.toml"))).is_err());
    }

    #[test]
    fn invalid_toml_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("portald.toml");
        fs::write(&path, "not valid {{{{").unwrap();
        assert!(ServerConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn env_overrides_tokens_and_url() {
        let mut config = ServerConfig {
            jira: Some(JiraConfig {
                host: "https://jira.example.org".to_string(),
                user: "portald".to_string(),
                token: None,
            }),
            ..ServerConfig::default()
        };

        config.apply_env(|name| match name {
            "PORTALD_PUBLIC_URL" => Some("https://override.example.org".to_string()),
            "PORTALD_GITHUB_TOKEN" => Some("ghp_env".to_string()),
            "PORTALD_JIRA_TOKEN" => Some("jira_env".to_string()),
            _ => None,
        });

        assert_eq!(config.public_url, "https://override.example.org");
        assert_eq!(config.github.token.as_deref(), Some("ghp_env"));
        assert_eq!(
            config.jira.unwrap().token.as_deref(),
            Some("jira_env")
        );
    }

    #[test]
    fn env_absent_changes_nothing() {
        let mut config = ServerConfig::default();
        config.github.token = Some("ghp_file".to_string());
        config.apply_env(|_| None);
        assert_eq!(config.github.token.as_deref(), Some("ghp_file"));
    }
}
