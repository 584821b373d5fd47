//! Per-portal reader/writer lock registry.
//!
//! One lock per portal id, created lazily on first use and kept for the
//! process's lifetime (holding a lock for an id that no longer exists is
//! harmless). Guards release on drop, so every exit path — return, `?`, task
//! cancellation — unlocks. No operation takes two different ids' locks at
//! once, so cross-id cycles cannot form. New-id allocation is serialized
//! separately (an atomic counter in the deployer), since the id does not
//! exist in this table until its first lock call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::PortalId;

#[derive(Default)]
pub struct PortalLocks {
    table: Mutex<HashMap<PortalId, Arc<RwLock<()>>>>,
}

impl PortalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: PortalId) -> Arc<RwLock<()>> {
        let mut table = self.table.lock().expect("lock table poisoned");
        table.entry(id).or_default().clone()
    }

    /// Shared access to one portal. Blocks behind a pending or active writer
    /// for the same id; never contends with other ids.
    pub async fn lock_reading(&self, id: PortalId) -> OwnedRwLockReadGuard<()> {
        self.entry(id).read_owned().await
    }

    /// Exclusive access to one portal. Blocks behind any active reader or
    /// writer for the same id; never contends with other ids.
    pub async fn lock_writing(&self, id: PortalId) -> OwnedRwLockWriteGuard<()> {
        self.entry(id).write_owned().await
    }
}
