//! File layout of a portal instance.
//!
//! A pure mapping from portal id to paths under the workspace; no I/O here.
//! Deployer, executor, and log service all address files through this one
//! scheme:
//!
//! ```text
//! <workspace>/portals/<id>/bin/<base>        launch script
//! <workspace>/portals/<id>/conf/application.yml
//! <workspace>/portals/<id>/lib/<base>.jar
//! <workspace>/portals/<id>/logs/<base>.log
//! ```

use std::path::{Path, PathBuf};

use super::PortalId;

#[derive(Debug, Clone)]
pub struct PortalFileSystem {
    workspace_dir: PathBuf,
    base_name: String,
}

impl PortalFileSystem {
    pub fn new(workspace_dir: impl Into<PathBuf>, base_name: &str) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            base_name: base_name.to_string(),
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Directory holding all portal instances.
    pub fn dir(&self) -> PathBuf {
        self.workspace_dir.join("portals")
    }

    pub fn root_dir(&self, id: PortalId) -> PathBuf {
        self.dir().join(id.to_string())
    }

    pub fn bin_dir(&self, id: PortalId) -> PathBuf {
        self.root_dir(id).join("bin")
    }

    pub fn conf_dir(&self, id: PortalId) -> PathBuf {
        self.root_dir(id).join("conf")
    }

    pub fn lib_dir(&self, id: PortalId) -> PathBuf {
        self.root_dir(id).join("lib")
    }

    pub fn logs_dir(&self, id: PortalId) -> PathBuf {
        self.root_dir(id).join("logs")
    }

    pub fn settings_file(&self, id: PortalId) -> PathBuf {
        self.conf_dir(id).join("application.yml")
    }

    pub fn script_file(&self, id: PortalId) -> PathBuf {
        self.bin_dir(id).join(&self.base_name)
    }

    pub fn jar_file(&self, id: PortalId) -> PathBuf {
        self.lib_dir(id).join(format!("{}.jar", self.base_name))
    }

    pub fn log_file(&self, id: PortalId) -> PathBuf {
        self.logs_dir(id).join(format!("{}.log", self.base_name))
    }

    /// Persisted metadata record of a portal.
    pub fn metadata_file(&self, id: PortalId) -> PathBuf {
        self.root_dir(id).join("portal.json")
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PortalFileSystem {
        PortalFileSystem::new("/work", "portal")
    }

    #[test]
    fn paths_follow_the_layout() {
        let fs = layout();
        assert_eq!(fs.root_dir(7), PathBuf::from("/work/portals/7"));
        assert_eq!(fs.script_file(7), PathBuf::from("/work/portals/7/bin/portal"));
        assert_eq!(
            fs.settings_file(7),
            PathBuf::from("/work/portals/7/conf/application.yml")
        );
        assert_eq!(
            fs.jar_file(7),
            PathBuf::from("/work/portals/7/lib/portal.jar")
        );
        assert_eq!(
            fs.log_file(7),
            PathBuf::from("/work/portals/7/logs/portal.log")
        );
    }

    #[test]
    fn mapping_is_deterministic() {
        let fs = layout();
        assert_eq!(fs.root_dir(3), fs.root_dir(3));
        assert_eq!(fs.log_file(3), fs.log_file(3));
    }

    #[test]
    fn distinct_ids_map_to_distinct_roots() {
        let fs = layout();
        assert_ne!(fs.root_dir(1), fs.root_dir(2));
    }
}
