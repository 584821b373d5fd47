//! Candidate resolution.
//!
//! Joins the open pull requests with the build listing, matching a PR to the
//! newest build of its head commit or branch, and attaches the ticket named
//! in the PR branch or title when the tracker knows it. Stateless: every
//! resolve call re-fetches from the collaborators, so results are as fresh
//! as the collaborators are.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::github::{PullRequest, PullRequestSource};
use crate::jenkins::{Build, BuildSource};
use crate::jira::{TicketTracker, extract_ticket_key};

use super::Candidate;

pub struct CandidateResolver {
    prs: Arc<dyn PullRequestSource>,
    builds: Arc<dyn BuildSource>,
    tickets: Arc<dyn TicketTracker>,
}

impl CandidateResolver {
    pub fn new(
        prs: Arc<dyn PullRequestSource>,
        builds: Arc<dyn BuildSource>,
        tickets: Arc<dyn TicketTracker>,
    ) -> Self {
        Self {
            prs,
            builds,
            tickets,
        }
    }

    /// All pull requests that have a matching build, ascending by PR number.
    pub async fn resolve_all(&self) -> Result<Vec<Candidate>> {
        let (prs, builds) = tokio::try_join!(self.prs.pull_requests(), self.builds.builds())?;

        let mut candidates = Vec::new();
        for pr in prs {
            if let Some(build) = match_build(&pr, &builds) {
                candidates.push(self.to_candidate(pr, build.clone()).await);
            }
        }
        candidates.sort_by_key(|c| c.pr.number);
        Ok(candidates)
    }

    /// The candidate for one pull request, or `None` if the PR does not
    /// exist or has no matching build.
    pub async fn resolve(&self, pr_number: u64) -> Result<Option<Candidate>> {
        let (prs, builds) = tokio::try_join!(self.prs.pull_requests(), self.builds.builds())?;

        let Some(pr) = prs.into_iter().find(|pr| pr.number == pr_number) else {
            return Ok(None);
        };
        let Some(build) = match_build(&pr, &builds) else {
            return Ok(None);
        };
        let build = build.clone();
        Ok(Some(self.to_candidate(pr, build).await))
    }

    async fn to_candidate(&self, pr: PullRequest, build: Build) -> Candidate {
        let key = extract_ticket_key(&pr.branch).or_else(|| extract_ticket_key(&pr.title));
        let ticket = match key {
            Some(key) => match self.tickets.find_ticket(&key).await {
                Ok(ticket) => ticket,
                Err(e) => {
                    // Best effort: a dead tracker must not hide candidates.
                    warn!(pr = pr.number, %key, error = %e, "ticket lookup failed");
                    None
                }
            },
            None => None,
        };
        Candidate { pr, build, ticket }
    }
}

/// Newest build made from the PR's head commit, falling back to the newest
/// build of its branch.
fn match_build<'a>(pr: &PullRequest, builds: &'a [Build]) -> Option<&'a Build> {
    let newest = |mut matches: Vec<&'a Build>| {
        matches.sort_by_key(|b| b.number);
        matches.pop()
    };

    let by_commit: Vec<&Build> = builds
        .iter()
        .filter(|b| b.commit_id.as_deref() == Some(pr.head.as_str()))
        .collect();
    if !by_commit.is_empty() {
        return newest(by_commit);
    }

    newest(
        builds
            .iter()
            .filter(|b| b.branch.as_deref() == Some(pr.branch.as_str()))
            .collect(),
    )
}
