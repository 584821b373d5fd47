//! Materializes candidates into portal directories.
//!
//! Owns portal id allocation: a process-wide atomic counter, seeded from the
//! highest directory id found at startup, so concurrent creations can never
//! collide and allocation never touches the per-id lock table (the id does
//! not exist there yet when it is chosen).

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::errors::PortalError;
use crate::jenkins::ArtifactFetcher;

use super::{Portal, PortalFileSystem, PortalId};

pub struct PortalDeployer {
    fs: PortalFileSystem,
    artifacts: Arc<dyn ArtifactFetcher>,
    /// First port of the per-portal range; portal `id` listens on
    /// `base_port + id`.
    base_port: u16,
    next_id: AtomicU32,
}

impl PortalDeployer {
    /// Scan the workspace for existing portal directories and seed the id
    /// counter past the highest one.
    pub fn new(
        fs: PortalFileSystem,
        artifacts: Arc<dyn ArtifactFetcher>,
        base_port: u16,
    ) -> Result<Self> {
        let max_existing = match fs::read_dir(fs.dir()) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str()?.parse::<PortalId>().ok())
                .max()
                .unwrap_or(0),
            Err(_) => 0,
        };
        debug!(next_id = max_existing + 1, "seeded portal id counter");

        Ok(Self {
            fs,
            artifacts,
            base_port,
            next_id: AtomicU32::new(max_existing + 1),
        })
    }

    /// Allocate the next portal id. Monotonic and unique for the process's
    /// lifetime, safe under concurrent creation.
    pub fn next_portal_id(&self) -> PortalId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Port assigned to a portal's instance.
    pub fn port(&self, id: PortalId) -> u16 {
        self.base_port + (id % 1000) as u16
    }

    /// Create the portal's directory tree.
    pub fn init(&self, id: PortalId) -> Result<(), PortalError> {
        info!(id, "initializing portal directory");
        for dir in [
            self.fs.bin_dir(id),
            self.fs.conf_dir(id),
            self.fs.lib_dir(id),
            self.fs.logs_dir(id),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))
                .map_err(|source| PortalError::Deployment { id, source })?;
        }
        Ok(())
    }

    /// Install the candidate's artifact and rendered settings into the
    /// portal's directory, and record the generated settings on the portal.
    ///
    /// Safe against a previously deployed directory: artifact, settings and
    /// launch script are overwritten in place, logs and metadata are left
    /// alone. Any write failure is fatal to the calling operation.
    pub async fn deploy(&self, portal: &mut Portal) -> Result<(), PortalError> {
        let id = portal.id;
        info!(id, build = portal.target.build.number, "deploying portal");

        self.deploy_inner(portal)
            .await
            .map_err(|source| PortalError::Deployment { id, source })
    }

    async fn deploy_inner(&self, portal: &mut Portal) -> Result<()> {
        let id = portal.id;

        let artifact = self
            .artifacts
            .fetch_artifact(&portal.target.build)
            .await
            .context("Failed to fetch candidate artifact")?;
        let jar = self.fs.jar_file(id);
        fs::write(&jar, artifact).with_context(|| format!("Failed to write {}", jar.display()))?;

        let system_config = self.render_settings(portal)?;
        self.write_script(id)?;
        portal.system_config = system_config;
        Ok(())
    }

    /// Remove the portal's entire directory tree. The caller must have
    /// stopped the process first.
    pub fn undeploy(&self, id: PortalId) -> Result<(), PortalError> {
        info!(id, "undeploying portal");
        let root = self.fs.root_dir(id);
        if !root.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&root)
            .with_context(|| format!("Failed to remove {}", root.display()))
            .map_err(|source| PortalError::Deployment { id, source })
    }

    /// Render `conf/application.yml` from the user config plus the assigned
    /// port, returning the generated map.
    fn render_settings(&self, portal: &Portal) -> Result<BTreeMap<String, String>> {
        let mut settings = portal.config.clone();
        settings.insert("server.port".to_string(), self.port(portal.id).to_string());

        let path = self.fs.settings_file(portal.id);
        let yaml = serde_yaml::to_string(&settings).context("Failed to render settings")?;
        fs::write(&path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(settings)
    }

    fn write_script(&self, id: PortalId) -> Result<()> {
        let base = self.fs.base_name();
        let script = format!(
            "#!/bin/sh\n\
             # Generated launch wrapper; stdout/stderr are captured by the supervisor.\n\
             BASE_DIR=\"$(cd \"$(dirname \"$0\")/..\" && pwd)\"\n\
             exec java -jar \"$BASE_DIR/lib/{base}.jar\" \\\n\
             \x20\x20--spring.config.location=\"$BASE_DIR/conf/application.yml\"\n"
        );

        let path = self.fs.script_file(id);
        fs::write(&path, script)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to mark {} executable", path.display()))?;
        }
        Ok(())
    }
}
