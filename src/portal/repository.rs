//! Portal metadata store.
//!
//! Source of truth for which portals exist: each portal's record lives as
//! `portal.json` inside its own directory, so the directory tree and the
//! metadata can never point at different workspaces. Callers serialize
//! access through [`PortalLocks`](super::PortalLocks); the repository itself
//! does plain file I/O.

use std::fs;

use anyhow::{Context, Result};
use tracing::warn;

use super::{Portal, PortalFileSystem, PortalId};

pub struct PortalRepository {
    fs: PortalFileSystem,
}

impl PortalRepository {
    pub fn new(fs: PortalFileSystem) -> Self {
        Self { fs }
    }

    pub fn exists(&self, id: PortalId) -> bool {
        self.fs.metadata_file(id).is_file()
    }

    pub fn find(&self, id: PortalId) -> Result<Option<Portal>> {
        let path = self.fs.metadata_file(id);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let portal = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(portal))
    }

    /// Ids of all portals with a readable record, ascending.
    ///
    /// Directory entries that are not numeric or carry no record (partially
    /// removed portals) are skipped.
    pub fn get_ids(&self) -> Vec<PortalId> {
        let dir = self.fs.dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut ids: Vec<PortalId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<PortalId>().ok())
            .filter(|&id| self.exists(id))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn create(&self, portal: &Portal) -> Result<()> {
        if self.exists(portal.id) {
            warn!(id = portal.id, "overwriting existing portal record");
        }
        self.write(portal)
    }

    pub fn update(&self, portal: &Portal) -> Result<()> {
        self.write(portal)
    }

    fn write(&self, portal: &Portal) -> Result<()> {
        let path = self.fs.metadata_file(portal.id);
        let json = serde_json::to_string_pretty(portal).context("Failed to serialize portal")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::test_support::sample_portal;
    use tempfile::TempDir;

    fn repository() -> (TempDir, PortalRepository) {
        let dir = TempDir::new().unwrap();
        let fs = PortalFileSystem::new(dir.path(), "portal");
        (dir, PortalRepository::new(fs))
    }

    #[test]
    fn find_missing_returns_none() {
        let (_dir, repo) = repository();
        assert!(repo.find(1).unwrap().is_none());
        assert!(!repo.exists(1));
    }

    #[test]
    fn create_then_find_round_trips() {
        let (dir, repo) = repository();
        let portal = sample_portal(1, "fix-login-bug");
        std::fs::create_dir_all(dir.path().join("portals/1")).unwrap();
        repo.create(&portal).unwrap();

        assert!(repo.exists(1));
        assert_eq!(repo.find(1).unwrap().unwrap(), portal);
    }

    #[test]
    fn update_replaces_record_in_place() {
        let (dir, repo) = repository();
        let mut portal = sample_portal(2, "fix-login-bug");
        std::fs::create_dir_all(dir.path().join("portals/2")).unwrap();
        repo.create(&portal).unwrap();

        portal.title = "New title".to_string();
        repo.update(&portal).unwrap();
        assert_eq!(repo.find(2).unwrap().unwrap().title, "New title");
    }

    #[test]
    fn get_ids_skips_non_numeric_and_recordless_dirs() {
        let (dir, repo) = repository();
        for name in ["3", "1", "junk", "2"] {
            std::fs::create_dir_all(dir.path().join("portals").join(name)).unwrap();
        }
        repo.create(&sample_portal(1, "a")).unwrap();
        repo.create(&sample_portal(3, "b")).unwrap();
        // id 2 has a directory but no record; "junk" is not an id.

        assert_eq!(repo.get_ids(), vec![1, 3]);
    }

    #[test]
    fn get_ids_on_empty_workspace_is_empty() {
        let (_dir, repo) = repository();
        assert!(repo.get_ids().is_empty());
    }
}
