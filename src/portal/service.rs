//! Portal coordinator.
//!
//! Sequences resolver, deployer, repository, executor and bus under the
//! per-id locking discipline: every mutation of one portal happens under its
//! write lock, reads under its read lock, and no operation ever holds two
//! ids' locks at once. Validation and lookups happen before any write, so a
//! rejected request leaves no trace; a mid-sequence failure (deploy ok,
//! start failed) leaves the record at its last persisted state and the
//! caller free to retry `start`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Url;
use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::PortalError;
use crate::jira::TicketTracker;
use crate::message::{ChangeKind, Message, MessageBus, topics};

use super::executor::RunStatus;
use super::{
    Candidate, CandidateResolver, Portal, PortalDeployer, PortalExecutor, PortalId,
    PortalLogService, PortalLocks, PortalRepository, slugify,
};

/// Parameters of a portal creation. Optional fields fall back to values
/// inferred from the pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePortal {
    pub pr_number: u64,
    pub slug: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub ticket: Option<String>,
    pub config: Option<BTreeMap<String, String>>,
    /// Start the process right after deployment.
    #[serde(default = "default_start")]
    pub start: bool,
}

fn default_start() -> bool {
    true
}

impl CreatePortal {
    pub fn for_pr(pr_number: u64) -> Self {
        Self {
            pr_number,
            slug: None,
            title: None,
            description: None,
            ticket: None,
            config: None,
            start: true,
        }
    }
}

/// Parameters of a portal update. Optional fields fall back to the current
/// persisted value, then to the pull request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePortal {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub ticket: Option<String>,
    pub config: Option<BTreeMap<String, String>>,
}

pub struct PortalService {
    public_url: Url,
    resolver: CandidateResolver,
    repository: PortalRepository,
    deployer: PortalDeployer,
    executor: PortalExecutor,
    logs: PortalLogService,
    locks: PortalLocks,
    bus: Arc<MessageBus>,
    tickets: Arc<dyn TicketTracker>,
}

impl PortalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        public_url: &str,
        resolver: CandidateResolver,
        repository: PortalRepository,
        deployer: PortalDeployer,
        executor: PortalExecutor,
        logs: PortalLogService,
        bus: Arc<MessageBus>,
        tickets: Arc<dyn TicketTracker>,
    ) -> Result<Self, PortalError> {
        let public_url = Url::parse(public_url)
            .map_err(|e| PortalError::Other(anyhow::anyhow!("invalid public URL: {e}")))?;
        Ok(Self {
            public_url,
            resolver,
            repository,
            deployer,
            executor,
            logs,
            locks: PortalLocks::new(),
            bus,
            tickets,
        })
    }

    /// Deployable candidates, fresh from the collaborators.
    pub async fn get_candidates(&self) -> Result<Vec<Candidate>, PortalError> {
        self.resolver
            .resolve_all()
            .await
            .map_err(|source| PortalError::External { source })
    }

    pub async fn get(&self, id: PortalId) -> Result<Portal, PortalError> {
        self.find(id)
            .await?
            .ok_or(PortalError::NotFound { id })
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Portal, PortalError> {
        self.list()
            .await?
            .into_iter()
            .find(|p| p.slug == slug)
            .ok_or_else(|| PortalError::SlugNotFound {
                slug: slug.to_string(),
            })
    }

    /// All portals. Each id is read-locked individually; ids that vanish or
    /// fail to load mid-iteration are skipped rather than failing the list.
    pub async fn list(&self) -> Result<Vec<Portal>, PortalError> {
        let mut portals = Vec::new();
        for id in self.repository.get_ids() {
            match self.find(id).await {
                Ok(Some(portal)) => portals.push(portal),
                Ok(None) => {}
                Err(e) => warn!(id, error = %e, "skipping unreadable portal"),
            }
        }
        Ok(portals)
    }

    pub async fn status(&self, id: PortalId) -> Result<RunStatus, PortalError> {
        let _lock = self.locks.lock_reading(id).await;
        self.ensure_exists(id)?;
        Ok(self.executor.status(id).await)
    }

    pub async fn get_log(&self, id: PortalId) -> Result<String, PortalError> {
        let _lock = self.locks.lock_reading(id).await;
        self.ensure_exists(id)?;
        self.logs.cat(id).await.map_err(PortalError::Other)
    }

    pub async fn create(&self, request: CreatePortal) -> Result<Portal, PortalError> {
        info!(pr = request.pr_number, "creating portal");

        // All checks before any side effect: a rejected create consumes no
        // id and touches no files.
        self.validate_slug(request.slug.as_deref())?;
        self.validate_slug_uniqueness(request.slug.as_deref(), None)
            .await?;
        let candidate = self
            .resolver
            .resolve(request.pr_number)
            .await
            .map_err(|source| PortalError::External { source })?
            .ok_or(PortalError::CandidateNotFound {
                pr_number: request.pr_number,
            })?;

        let id = self.deployer.next_portal_id();
        let _lock = self.locks.lock_writing(id).await;

        let now = Utc::now();
        let title = resolve_value([request.title, None, Some(candidate.pr.title.clone())])
            .unwrap_or_default();
        let slug = slugify(
            &resolve_value([request.slug, None, Some(candidate.pr.title.clone())])
                .unwrap_or_default(),
        );
        let description =
            resolve_value([request.description, None, candidate.pr.description.clone()]);
        let ticket_key = resolve_value([
            request.ticket,
            None,
            candidate.ticket.as_ref().map(|t| t.key.clone()),
        ]);

        let mut portal = Portal {
            id,
            slug,
            title,
            description,
            ticket_key,
            config: request.config.unwrap_or_default(),
            target: candidate,
            url: None,
            system_config: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };

        self.deployer.init(id)?;
        self.deployer.deploy(&mut portal).await?;
        self.repository.create(&portal)?;

        // Second persist once the URL is known from the generated settings;
        // both writes happen under the same write lock.
        portal.url = Some(self.resolve_url(&portal)?);
        self.repository.update(&portal)?;

        if request.start {
            self.executor.start_async(id);
            self.notify_ticket(&portal);
        }

        self.notify_change(&portal, ChangeKind::Created);
        Ok(portal)
    }

    pub async fn update(
        &self,
        id: PortalId,
        request: UpdatePortal,
    ) -> Result<Portal, PortalError> {
        info!(id, "updating portal");

        self.validate_slug(request.slug.as_deref())?;
        self.validate_slug_uniqueness(request.slug.as_deref(), Some(id))
            .await?;

        let _lock = self.locks.lock_writing(id).await;
        let mut portal = self
            .repository
            .find(id)?
            .ok_or(PortalError::NotFound { id })?;

        let candidate = portal.target.clone();
        portal.title = resolve_value([
            request.title,
            Some(portal.title),
            Some(candidate.pr.title.clone()),
        ])
        .unwrap_or_default();
        portal.slug = slugify(
            &resolve_value([
                request.slug,
                Some(portal.slug),
                Some(candidate.pr.title.clone()),
            ])
            .unwrap_or_default(),
        );
        portal.description = resolve_value([
            request.description,
            portal.description,
            candidate.pr.description.clone(),
        ]);
        portal.ticket_key = resolve_value([
            request.ticket,
            portal.ticket_key,
            candidate.ticket.as_ref().map(|t| t.key.clone()),
        ]);
        portal.config = resolve_value([request.config, Some(portal.config)]).unwrap_or_default();
        portal.updated_at = Utc::now();
        self.repository.update(&portal)?;

        // A running instance is stopped synchronously before its files are
        // replaced, then relaunched against the fresh deployment.
        if self.executor.status(id).await.state.is_active() {
            self.executor.stop(id).await?;
        }
        self.deployer.deploy(&mut portal).await?;
        self.repository.update(&portal)?;
        self.executor.start_async(id);

        self.notify_change(&portal, ChangeKind::Updated);
        Ok(portal)
    }

    /// Remove one portal. Unlike the other mutations this is fully
    /// synchronous: it returns only after the process has exited and the
    /// directory tree is gone.
    pub async fn remove(&self, id: PortalId) -> Result<(), PortalError> {
        info!(id, "removing portal");

        let _lock = self.locks.lock_writing(id).await;
        let portal = self
            .repository
            .find(id)?
            .ok_or(PortalError::NotFound { id })?;

        // The process must have fully exited before its files are deleted.
        self.executor.stop(id).await?;
        self.deployer.undeploy(id)?;

        self.notify_change(&portal, ChangeKind::Removed);
        Ok(())
    }

    /// Remove all portals, sequentially, each under its own lock.
    pub async fn remove_all(&self) -> Result<(), PortalError> {
        info!("removing all portals");
        for id in self.repository.get_ids() {
            match self.remove(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn start(&self, id: PortalId) -> Result<(), PortalError> {
        info!(id, "starting portal");
        let _lock = self.locks.lock_writing(id).await;
        self.ensure_exists(id)?;
        self.executor.start_async(id);
        Ok(())
    }

    pub async fn stop(&self, id: PortalId) -> Result<(), PortalError> {
        info!(id, "stopping portal");
        let _lock = self.locks.lock_writing(id).await;
        self.ensure_exists(id)?;
        self.executor.stop_async(id);
        Ok(())
    }

    pub async fn restart(&self, id: PortalId) -> Result<(), PortalError> {
        info!(id, "restarting portal");
        let _lock = self.locks.lock_writing(id).await;
        self.ensure_exists(id)?;
        self.executor.restart_async(id);
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn find(&self, id: PortalId) -> Result<Option<Portal>, PortalError> {
        let _lock = self.locks.lock_reading(id).await;
        self.repository.find(id).map_err(PortalError::Other)
    }

    fn ensure_exists(&self, id: PortalId) -> Result<(), PortalError> {
        if self.repository.exists(id) {
            Ok(())
        } else {
            Err(PortalError::NotFound { id })
        }
    }

    fn validate_slug(&self, slug: Option<&str>) -> Result<(), PortalError> {
        let Some(slug) = slug else { return Ok(()) };
        if slug.trim().is_empty() {
            return Err(PortalError::BlankSlug);
        }
        let canonical = slugify(slug);
        if slug != canonical {
            return Err(PortalError::NonCanonicalSlug {
                slug: slug.to_string(),
                expected: canonical,
            });
        }
        Ok(())
    }

    async fn validate_slug_uniqueness(
        &self,
        slug: Option<&str>,
        own_id: Option<PortalId>,
    ) -> Result<(), PortalError> {
        let Some(slug) = slug else { return Ok(()) };
        if let Some(existing) = self.list().await?.into_iter().find(|p| p.slug == slug)
            && Some(existing.id) != own_id
        {
            return Err(PortalError::DuplicateSlug {
                slug: slug.to_string(),
                existing_id: existing.id,
            });
        }
        Ok(())
    }

    /// Public base URL with the portal's port substituted in.
    fn resolve_url(&self, portal: &Portal) -> Result<String, PortalError> {
        let port: u16 = portal
            .system_config
            .get("server.port")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| PortalError::Deployment {
                id: portal.id,
                source: anyhow::anyhow!("generated settings carry no server.port"),
            })?;

        let mut url = self.public_url.clone();
        url.set_port(Some(port))
            .map_err(|_| PortalError::Other(anyhow::anyhow!("public URL cannot carry a port")))?;
        Ok(url.to_string())
    }

    fn notify_change(&self, portal: &Portal, change: ChangeKind) {
        self.bus.publish(
            topics::PORTALS,
            Message::PortalChange {
                portal_id: portal.id,
                change,
            },
        );
    }

    /// Fire-and-forget ticket comment; a tracker failure never unwinds the
    /// operation that triggered it.
    fn notify_ticket(&self, portal: &Portal) {
        let (Some(key), Some(url)) = (portal.ticket_key.clone(), portal.url.clone()) else {
            return;
        };
        let tickets = self.tickets.clone();
        let id = portal.id;
        tokio::spawn(async move {
            let comment = format!("Deployed to {url} for testing");
            if let Err(e) = tickets.update_ticket(&key, &comment).await {
                warn!(id, ticket = %key, error = %e, "ticket notification failed");
            }
        });
    }
}

/// Left-to-right precedence: the first non-`None` value wins.
fn resolve_value<T>(values: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    values.into_iter().flatten().next()
}
