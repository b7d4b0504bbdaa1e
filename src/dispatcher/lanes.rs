use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::update::{SessionId, Update};

/// One FIFO worker per active session: updates from the same session run
/// strictly in arrival order, different sessions run concurrently.
pub struct SessionLanes {
    lanes: DashMap<SessionId, UnboundedSender<Update>>,
    tracker: TaskTracker,
    idle: Duration,
    closed: AtomicBool,
}

impl SessionLanes {
    pub fn new(idle: Duration) -> Self {
        Self {
            lanes: DashMap::new(),
            tracker: TaskTracker::new(),
            idle,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue `update` on its session's lane, opening the lane if needed.
    /// `process` is only used when a new lane has to be started.
    /// Returns false, dropping the update, once `close` has been called.
    pub fn push<F, Fut>(self: &Arc<Self>, update: Update, process: F) -> bool
    where
        F: Fn(Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let session = update.source.clone();

        // Sends happen while the shard is locked so a retiring lane never
        // misses an update (see `run`), and `close` cannot clear the map
        // between the closed check and the insert.
        let entry = self.lanes.entry(session.clone());
        if self.closed.load(Ordering::SeqCst) {
            debug!("Lanes closed; dropping update {} from {}", update.id, session);
            return false;
        }
        match entry {
            Entry::Occupied(mut entry) => {
                if let Err(SendError(update)) = entry.get().send(update) {
                    warn!("Lane for session {} died; reopening", session);
                    let tx = self.open(session, process);
                    let _ = tx.send(update);
                    entry.insert(tx);
                }
            }
            Entry::Vacant(entry) => {
                let tx = self.open(session, process);
                let _ = tx.send(update);
                entry.insert(tx);
            }
        }
        true
    }

    fn open<F, Fut>(self: &Arc<Self>, session: SessionId, process: F) -> UnboundedSender<Update>
    where
        F: Fn(Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("Opening lane for session {}", session);
        self.tracker.spawn(Arc::clone(self).run(session, rx, process));
        tx
    }

    async fn run<F, Fut>(
        self: Arc<Self>,
        session: SessionId,
        mut rx: UnboundedReceiver<Update>,
        process: F,
    ) where
        F: Fn(Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let update = match tokio::time::timeout(self.idle, rx.recv()).await {
                Ok(Some(update)) => update,
                Ok(None) => break,
                Err(_) => {
                    // Idle: retire under the shard lock unless an update raced in.
                    if let Entry::Occupied(entry) = self.lanes.entry(session.clone()) {
                        match rx.try_recv() {
                            Ok(update) => {
                                drop(entry);
                                update
                            }
                            Err(_) => {
                                entry.remove();
                                debug!("Retired idle lane for session {}", session);
                                break;
                            }
                        }
                    } else {
                        // Detached by close(); drain until the channel ends.
                        continue;
                    }
                }
            };

            process(update).await;
        }
    }

    /// Sessions with an open lane
    pub fn active(&self) -> usize {
        self.lanes.len()
    }

    /// Lane tasks still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work: lanes drain what is queued, then exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lanes.clear();
        self.tracker.close();
    }

    /// Wait for all lanes to finish. Returns false if `grace` elapsed first.
    pub async fn wait(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}
