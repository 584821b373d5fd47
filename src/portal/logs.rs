//! Portal log access and reactive tailing.
//!
//! `cat` returns the full log content on demand. Tailing is driven by bus
//! subscription edges, not by explicit calls: the service listens on the
//! lifecycle topic, starts a tailer when a portal's log topic gains its
//! first subscriber, and stops it when the last one leaves. At most one
//! tailer per portal id exists at any time.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{Message, MessageBus, topics};

use super::{PortalFileSystem, PortalId};

/// How often a tailer looks for appended lines.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct LogInner {
    fs: PortalFileSystem,
    bus: Arc<MessageBus>,
    tailers: Mutex<HashMap<PortalId, JoinHandle<()>>>,
}

/// Cheap-to-clone handle; all clones share one tailer registry.
#[derive(Clone)]
pub struct PortalLogService {
    inner: Arc<LogInner>,
}

impl PortalLogService {
    pub fn new(fs: PortalFileSystem, bus: Arc<MessageBus>) -> Self {
        Self {
            inner: Arc::new(LogInner {
                fs,
                bus,
                tailers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wire the service to the bus: subscription edges on portal log topics
    /// start and stop tailers from here on.
    pub fn start(&self) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        self.inner.bus.subscribe(topics::LIFECYCLE, tx);

        let service = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::FirstSubscriber { topic } => {
                        if let Some(id) = topics::parse_portal_log(&topic) {
                            service.start_tailing(id);
                        }
                    }
                    Message::LastSubscriber { topic } => {
                        if let Some(id) = topics::parse_portal_log(&topic) {
                            service.stop_tailing(id);
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    /// Full current content of the portal's log file.
    pub async fn cat(&self, id: PortalId) -> Result<String> {
        let path = self.inner.fs.log_file(id);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Begin tailing a portal's log. Idempotent: a second call while a
    /// tailer is active does nothing.
    pub fn start_tailing(&self, id: PortalId) {
        let mut tailers = self.inner.tailers.lock().expect("tailer registry poisoned");
        if tailers.contains_key(&id) {
            debug!(id, "already tailing");
            return;
        }

        info!(id, path = %self.inner.fs.log_file(id).display(), "tailing portal log");
        let service = self.clone();
        let task = tokio::spawn(async move { service.tail(id).await });
        tailers.insert(id, task);
    }

    /// Stop tailing a portal's log. Idempotent: no-op when not tailing. No
    /// further lines are published after this returns.
    pub fn stop_tailing(&self, id: PortalId) {
        let mut tailers = self.inner.tailers.lock().expect("tailer registry poisoned");
        if let Some(task) = tailers.remove(&id) {
            info!(id, "stopped tailing portal log");
            task.abort();
        }
    }

    /// Stop every active tailer. Called on process shutdown.
    pub fn shutdown(&self) {
        let mut tailers = self.inner.tailers.lock().expect("tailer registry poisoned");
        for (id, task) in tailers.drain() {
            debug!(id, "stopping tailer on shutdown");
            task.abort();
        }
    }

    #[cfg(test)]
    fn active_tailers(&self) -> usize {
        self.inner.tailers.lock().unwrap().len()
    }

    /// Tail loop: publish each appended line to the portal's log topic.
    ///
    /// Starts at the current end of file. Tolerates the file not existing
    /// yet (keeps retrying) and rotation/truncation (a shrinking file resets
    /// the cursor to the start).
    async fn tail(&self, id: PortalId) {
        let path = self.inner.fs.log_file(id);
        let topic = topics::portal_log(id);
        let mut position: Option<u64> = None;
        let mut pending = String::new();

        loop {
            tokio::time::sleep(TAIL_POLL_INTERVAL).await;

            let Ok(mut file) = tokio::fs::File::open(&path).await else {
                // Not written yet (or rotated away); try again later.
                continue;
            };
            let Ok(metadata) = file.metadata().await else {
                continue;
            };
            let len = metadata.len();

            let pos = match position {
                // First sighting: skip history, tail from the end.
                None => {
                    position = Some(len);
                    continue;
                }
                Some(pos) if len < pos => {
                    // Truncated or replaced; start over from the top.
                    pending.clear();
                    0
                }
                Some(pos) => pos,
            };
            if len == pos {
                position = Some(pos);
                continue;
            }

            if file.seek(SeekFrom::Start(pos)).await.is_err() {
                continue;
            }
            let mut chunk = Vec::with_capacity((len - pos) as usize);
            let read = match file.take(len - pos).read_to_end(&mut chunk).await {
                Ok(read) => read as u64,
                Err(e) => {
                    warn!(id, error = %e, "failed to read portal log");
                    continue;
                }
            };
            position = Some(pos + read);

            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                self.inner.bus.publish(
                    &topic,
                    Message::PortalLog {
                        portal_id: id,
                        line: line.trim_end_matches(['\n', '\r']).to_string(),
                    },
                );
            }
        }
    }
}
