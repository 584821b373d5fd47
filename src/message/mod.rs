//! Message catalog and topic naming.
//!
//! The catalog is a closed set: every notification that crosses a component
//! boundary is one of these variants, dispatched by tag. Portal-scoped
//! variants carry the portal id.

pub mod bus;

pub use bus::{MessageBus, SubscriberId};

use serde::{Deserialize, Serialize};

use crate::github::PullRequest;
use crate::jenkins::Build;
use crate::portal::PortalId;

/// Messages sent from publishers to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// The build listing changed.
    BuildsUpdated { builds: Vec<Build> },

    /// The pull request listing changed.
    PullRequestsUpdated { prs: Vec<PullRequest> },

    /// A line was appended to a portal's log.
    PortalLog { portal_id: PortalId, line: String },

    /// The executor acted on a portal's process.
    PortalExecution {
        portal_id: PortalId,
        action: String,
        output: String,
    },

    /// A portal was created, updated, or removed.
    PortalChange {
        portal_id: PortalId,
        change: ChangeKind,
    },

    /// A topic's subscriber count went 0 → 1.
    FirstSubscriber { topic: String },

    /// A topic's subscriber count went 1 → 0.
    LastSubscriber { topic: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

// ── Topic naming ──────────────────────────────────────────────────────

pub mod topics {
    use crate::portal::PortalId;

    /// Build listing updates.
    pub const BUILDS: &str = "builds";
    /// Pull request listing updates.
    pub const PRS: &str = "prs";
    /// Portal created/updated/removed changes.
    pub const PORTALS: &str = "portals";
    /// Bus lifecycle (first/last subscriber) notifications.
    pub const LIFECYCLE: &str = "bus.lifecycle";

    /// Topic carrying one portal's log lines.
    pub fn portal_log(id: PortalId) -> String {
        format!("portal.{id}.log")
    }

    /// Topic carrying one portal's execution events.
    pub fn portal_events(id: PortalId) -> String {
        format!("portal.{id}.events")
    }

    /// Inverse of [`portal_log`]: the portal id, if `topic` is a log topic.
    pub fn parse_portal_log(topic: &str) -> Option<PortalId> {
        topic
            .strip_prefix("portal.")?
            .strip_suffix(".log")?
            .parse()
            .ok()
    }
}
