//! Periodic refresh of the pull request and build listings.
//!
//! Observers watching the candidates view get push updates instead of
//! polling the REST API themselves: on every tick the poller re-fetches both
//! listings and publishes a message when one changed since the last tick.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::github::{PullRequest, PullRequestSource};
use crate::jenkins::{Build, BuildSource};
use crate::message::{Message, MessageBus, topics};

pub struct CandidatePoller {
    prs: Arc<dyn PullRequestSource>,
    builds: Arc<dyn BuildSource>,
    bus: Arc<MessageBus>,
    interval: Duration,
}

impl CandidatePoller {
    pub fn new(
        prs: Arc<dyn PullRequestSource>,
        builds: Arc<dyn BuildSource>,
        bus: Arc<MessageBus>,
        interval: Duration,
    ) -> Self {
        Self {
            prs,
            builds,
            bus,
            interval,
        }
    }

    /// Run the poll loop until the task is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so startup is quiet.
            interval.tick().await;

            let mut last_prs: Option<Vec<PullRequest>> = None;
            let mut last_builds: Option<Vec<Build>> = None;

            loop {
                interval.tick().await;

                match self.prs.pull_requests().await {
                    Ok(prs) => {
                        if last_prs.as_ref() != Some(&prs) {
                            debug!(count = prs.len(), "pull request listing changed");
                            self.bus.publish(
                                topics::PRS,
                                Message::PullRequestsUpdated { prs: prs.clone() },
                            );
                            last_prs = Some(prs);
                        }
                    }
                    Err(e) => warn!(error = %e, "pull request poll failed"),
                }

                match self.builds.builds().await {
                    Ok(builds) => {
                        if last_builds.as_ref() != Some(&builds) {
                            debug!(count = builds.len(), "build listing changed");
                            self.bus.publish(
                                topics::BUILDS,
                                Message::BuildsUpdated {
                                    builds: builds.clone(),
                                },
                            );
                            last_builds = Some(builds);
                        }
                    }
                    Err(e) => warn!(error = %e, "build poll failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ScriptedPrs(Mutex<Vec<Vec<PullRequest>>>);
    #[async_trait]
    impl PullRequestSource for ScriptedPrs {
        async fn pull_requests(&self) -> Result<Vec<PullRequest>> {
            let mut script = self.0.lock().unwrap();
            if script.len() > 1 {
                Ok(script.remove(0))
            } else {
                Ok(script[0].clone())
            }
        }
    }

    struct NoBuilds;
    #[async_trait]
    impl BuildSource for NoBuilds {
        async fn builds(&self) -> Result<Vec<Build>> {
            Ok(Vec::new())
        }
    }

    fn pr(number: u64) -> PullRequest {
        PullRequest {
            number,
            title: format!("PR {number}"),
            description: None,
            user: "alice".to_string(),
            branch: format!("branch-{number}"),
            head: format!("sha-{number}"),
            url: String::new(),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn publishes_only_on_change() {
        let bus = Arc::new(MessageBus::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(topics::PRS, tx);

        // Same listing twice, then a new PR appears.
        let poller = CandidatePoller::new(
            Arc::new(ScriptedPrs(Mutex::new(vec![
                vec![pr(1)],
                vec![pr(1)],
                vec![pr(1), pr(2)],
            ]))),
            Arc::new(NoBuilds),
            bus,
            Duration::from_millis(30),
        );
        let task = poller.spawn();

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            Message::PullRequestsUpdated { prs } => assert_eq!(prs.len(), 1),
            other => panic!("unexpected message: {other:?}"),
        }

        let second = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            Message::PullRequestsUpdated { prs } => assert_eq!(prs.len(), 2),
            other => panic!("unexpected message: {other:?}"),
        }

        task.abort();
    }

    #[tokio::test]
    async fn builds_topic_stays_quiet_when_listing_is_stable() {
        let bus = Arc::new(MessageBus::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(topics::BUILDS, tx);

        let poller = CandidatePoller::new(
            Arc::new(ScriptedPrs(Mutex::new(vec![vec![]]))),
            Arc::new(NoBuilds),
            bus,
            Duration::from_millis(20),
        );
        let task = poller.spawn();

        // First observation publishes once; afterwards the stable empty
        // listing produces nothing.
        let _first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        task.abort();
    }
}
