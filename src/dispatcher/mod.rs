pub mod dedup;
pub mod lanes;
pub mod registry;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{DeliveryConfig, DispatcherConfig};
use crate::error::DispatchError;
use crate::platform::{self, OutboundAction, Reply, Transport};
use crate::update::{SessionId, Update};

use self::dedup::DedupWindow;
use self::lanes::SessionLanes;
pub use self::registry::{handler_fn, Handler, HandlerRegistry};

/// Routes inbound updates to their handlers and delivers the replies.
///
/// Owns the process-wide state: the handler registry (read-only after
/// construction) and the deduplication window (behind a mutex).
pub struct Dispatcher {
    registry: HandlerRegistry,
    /// Ids are unique per source stream, so the key carries the session
    dedup: Mutex<DedupWindow<(SessionId, u64)>>,
    lanes: Arc<SessionLanes>,
    transport: Arc<dyn Transport>,
    delivery: DeliveryConfig,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Fails if the registry has no fallback handler.
    pub fn new(
        registry: HandlerRegistry,
        config: &DispatcherConfig,
        delivery: DeliveryConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DispatchError> {
        registry.validate()?;

        info!(
            "Dispatcher ready: {} handler(s), dedup window {}",
            registry.len(),
            config.dedup_window
        );

        Ok(Self {
            registry,
            dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
            lanes: Arc::new(SessionLanes::new(config.lane_idle())),
            transport,
            delivery,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        Ok(())
    }

    /// Decode a raw envelope and check it against the dedup window.
    /// `Ok(None)` means the id was already seen and the update must be skipped.
    pub async fn ingest(&self, raw: &[u8]) -> Result<Option<Update>, DispatchError> {
        self.ensure_open()?;
        let update = Update::from_json(raw)?;
        self.accept(update).await
    }

    /// Dedup check for an update that was already decoded.
    pub async fn accept(&self, update: Update) -> Result<Option<Update>, DispatchError> {
        self.ensure_open()?;
        let fresh = self
            .dedup
            .lock()
            .await
            .insert((update.source.clone(), update.id));
        if fresh {
            Ok(Some(update))
        } else {
            debug!(
                "Dropping duplicate update {} from session {}",
                update.id, update.source
            );
            Ok(None)
        }
    }

    /// Run the handler for `update` and return what it wants sent back.
    /// Handler errors and panics become an error reply to the source session.
    pub async fn dispatch(&self, update: &Update) -> Result<Option<OutboundAction>, DispatchError> {
        let handler = self.registry.resolve(update)?;
        let key = update.route_key();

        debug!(
            "Dispatching update {} ({}) from session {}",
            update.id, key, update.source
        );

        let reply = match AssertUnwindSafe(handler.handle(update)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                error!(
                    "Handler '{}' failed on update {}: {:#}",
                    key, update.id, e
                );
                Some(Reply::text(format!("Error: {}", e)))
            }
            Err(_) => {
                error!("Handler '{}' panicked on update {}", key, update.id);
                Some(Reply::text(
                    "Error: something went wrong while handling your message.",
                ))
            }
        };

        Ok(reply.map(|reply| OutboundAction::new(update.source.clone(), reply)))
    }

    /// Queue an accepted update on its session lane. Updates from the same
    /// session are dispatched one at a time in submission order.
    pub fn submit(self: &Arc<Self>, update: Update) -> Result<(), DispatchError> {
        self.ensure_open()?;
        let dispatcher = Arc::clone(self);
        let queued = self.lanes.push(update, move |update| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.process(update).await }
        });
        // shutdown may have closed the lanes after `ensure_open` passed
        if !queued {
            return Err(DispatchError::ShuttingDown);
        }
        Ok(())
    }

    /// Dedup and queue a decoded update. Returns false for duplicates.
    pub async fn handle_update(self: &Arc<Self>, update: Update) -> Result<bool, DispatchError> {
        match self.accept(update).await? {
            Some(update) => {
                self.submit(update)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Ingest and queue a raw envelope. Malformed input is logged and dropped.
    pub async fn handle_raw(self: &Arc<Self>, raw: &[u8]) -> Result<bool, DispatchError> {
        match self.ingest(raw).await {
            Ok(Some(update)) => {
                self.submit(update)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e @ DispatchError::MalformedPayload(_)) => {
                warn!("Dropping inbound payload: {}", e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn process(&self, update: Update) {
        match self.dispatch(&update).await {
            Ok(Some(action)) => {
                platform::deliver(self.transport.as_ref(), &action, &self.delivery).await;
            }
            Ok(None) => {}
            Err(e) => error!("Update {} was not dispatched: {}", update.id, e),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting updates and let in-flight work finish within `grace`.
    /// Returns false if work was still running when the deadline passed.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return self.lanes.wait(grace).await;
        }

        info!(
            "Dispatcher shutting down; waiting up to {:?} for {} session lane(s)",
            grace,
            self.lanes.active()
        );
        self.lanes.close();

        let drained = self.lanes.wait(grace).await;
        if drained {
            info!("All in-flight updates finished");
        } else {
            warn!(
                "Shutdown grace period elapsed with {} lane(s) still running",
                self.lanes.in_flight()
            );
        }
        drained
    }

    #[cfg(test)]
    async fn seen_ids(&self) -> usize {
        self.dedup.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::RecordingTransport;
    use crate::update::Payload;
    use std::sync::atomic::AtomicUsize;

    fn settings(window: usize) -> DispatcherConfig {
        DispatcherConfig {
            dedup_window: window,
            lane_idle_secs: 60,
            shutdown_grace_secs: 5,
        }
    }

    fn fast_delivery() -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: 2,
            send_timeout_secs: 1,
            base_delay_ms: 1,
            max_delay_secs: 1,
        }
    }

    fn counting(counter: Arc<AtomicUsize>, text: &'static str) -> Arc<dyn Handler> {
        handler_fn(move |_update| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Reply::text(text)))
            }
        })
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        transport: Arc<RecordingTransport>,
        ping_calls: Arc<AtomicUsize>,
        fallback_calls: Arc<AtomicUsize>,
    }

    fn fixture(window: usize) -> Fixture {
        let ping_calls = Arc::new(AtomicUsize::new(0));
        let fallback_calls = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        registry
            .register("ping", counting(ping_calls.clone(), "pong"))
            .unwrap();
        registry.set_fallback(counting(fallback_calls.clone(), "fallback"));

        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(
            registry,
            &settings(window),
            fast_delivery(),
            transport.clone(),
        )
        .unwrap();

        Fixture {
            dispatcher: Arc::new(dispatcher),
            transport,
            ping_calls,
            fallback_calls,
        }
    }

    #[tokio::test]
    async fn test_ping_pong_then_redelivery_is_skipped() {
        let f = fixture(16);
        let raw = br#"{"id":1,"kind":"ping","source":"s1"}"#;

        let update = f.dispatcher.ingest(raw).await.unwrap().unwrap();
        let action = f.dispatcher.dispatch(&update).await.unwrap().unwrap();
        assert_eq!(action.text, "pong");
        assert_eq!(action.session.as_str(), "s1");

        assert!(f.dispatcher.ingest(raw).await.unwrap().is_none());
        assert_eq!(f.ping_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_leaves_state_unchanged() {
        let f = fixture(16);
        f.dispatcher
            .ingest(br#"{"id":1,"kind":"ping","source":"s1"}"#)
            .await
            .unwrap();

        let err = f.dispatcher.ingest(b"{not json").await.unwrap_err();
        assert!(matches!(err, DispatchError::MalformedPayload(_)));
        assert_eq!(f.dispatcher.seen_ids().await, 1);
    }

    #[tokio::test]
    async fn test_unregistered_kind_hits_fallback_once() {
        let f = fixture(16);
        let update = f
            .dispatcher
            .ingest(br#"{"id":5,"kind":"text","source":"s1","text":"hello"}"#)
            .await
            .unwrap()
            .unwrap();

        let action = f.dispatcher.dispatch(&update).await.unwrap().unwrap();
        assert_eq!(action.text, "fallback");
        assert_eq!(f.fallback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.ping_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registry_without_fallback_is_rejected() {
        let err = Dispatcher::new(
            HandlerRegistry::new(),
            &settings(16),
            fast_delivery(),
            Arc::new(RecordingTransport::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DispatchError::UnhandledUpdate(_)));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_reply() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "boom",
                handler_fn(|_update| async { Err(anyhow::anyhow!("sheet unavailable")) }),
            )
            .unwrap();
        registry.set_fallback(handler_fn(|_update| async { Ok(None) }));
        let dispatcher = Dispatcher::new(
            registry,
            &settings(16),
            fast_delivery(),
            Arc::new(RecordingTransport::default()),
        )
        .unwrap();

        let update = Update::new(
            1,
            "s1",
            Payload::Event {
                kind: "boom".to_string(),
            },
        );
        let action = dispatcher.dispatch(&update).await.unwrap().unwrap();
        assert_eq!(action.text, "Error: sheet unavailable");
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl Handler for Panicking {
        async fn handle(&self, _update: &Update) -> anyhow::Result<Option<Reply>> {
            panic!("handler exploded")
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry.register("explode", Arc::new(Panicking)).unwrap();
        registry.set_fallback(handler_fn(|_update| async { Ok(None) }));
        let dispatcher = Dispatcher::new(
            registry,
            &settings(16),
            fast_delivery(),
            Arc::new(RecordingTransport::default()),
        )
        .unwrap();

        let update = Update::new(
            1,
            "s1",
            Payload::Event {
                kind: "explode".to_string(),
            },
        );
        let action = dispatcher.dispatch(&update).await.unwrap().unwrap();
        assert!(action.text.starts_with("Error:"));

        // still serving afterwards
        assert!(dispatcher.dispatch(&update).await.is_ok());
    }

    #[tokio::test]
    async fn test_submitted_updates_are_delivered_in_order() {
        let f = fixture(16);
        for (id, kind) in [(1, "ping"), (2, "other"), (3, "ping")] {
            let raw = format!(r#"{{"id":{},"kind":"{}","source":"s1"}}"#, id, kind);
            assert!(f.dispatcher.handle_raw(raw.as_bytes()).await.unwrap());
        }
        // redelivery of id 2 is ignored
        assert!(!f
            .dispatcher
            .handle_raw(br#"{"id":2,"kind":"other","source":"s1"}"#)
            .await
            .unwrap());

        assert!(f.dispatcher.shutdown(Duration::from_secs(5)).await);
        assert_eq!(f.transport.texts().await, vec!["pong", "fallback", "pong"]);
        assert_eq!(f.ping_calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_updates_accepted_after_shutdown() {
        let f = fixture(16);
        assert!(f.dispatcher.shutdown(Duration::from_secs(1)).await);
        assert!(f.dispatcher.is_shutting_down());

        let err = f
            .dispatcher
            .handle_raw(br#"{"id":1,"kind":"ping","source":"s1"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ShuttingDown));
        assert_eq!(f.dispatcher.seen_ids().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_racing_shutdown_is_refused() {
        let f = fixture(16);
        let update = f
            .dispatcher
            .ingest(br#"{"id":1,"kind":"ping","source":"s1"}"#)
            .await
            .unwrap()
            .unwrap();

        // lanes close between the open check and the push
        f.dispatcher.lanes.close();
        assert!(matches!(
            f.dispatcher.submit(update),
            Err(DispatchError::ShuttingDown)
        ));
        assert_eq!(f.dispatcher.lanes.active(), 0);

        assert!(f.dispatcher.shutdown(Duration::from_secs(1)).await);
        assert_eq!(f.ping_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_same_id_from_two_sources_is_dispatched_twice() {
        let f = fixture(16);
        for source in ["s1", "s2"] {
            let raw = format!(r#"{{"id":1,"kind":"ping","source":"{}"}}"#, source);
            assert!(f.dispatcher.handle_raw(raw.as_bytes()).await.unwrap());
        }
        assert!(!f
            .dispatcher
            .handle_raw(br#"{"id":1,"kind":"ping","source":"s2"}"#)
            .await
            .unwrap());

        assert!(f.dispatcher.shutdown(Duration::from_secs(5)).await);
        assert_eq!(f.ping_calls.load(Ordering::SeqCst), 2);
        let sent = f.transport.sent.lock().await;
        let mut sessions: Vec<&str> = sent.iter().map(|a| a.session.as_str()).collect();
        sessions.sort();
        assert_eq!(sessions, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_window_evicts_old_ids() {
        let f = fixture(2);
        for id in 1..=3 {
            let raw = format!(r#"{{"id":{},"kind":"ping","source":"s1"}}"#, id);
            assert!(f.dispatcher.ingest(raw.as_bytes()).await.unwrap().is_some());
        }
        // id 1 fell out of the window
        assert!(f
            .dispatcher
            .ingest(br#"{"id":1,"kind":"ping","source":"s1"}"#)
            .await
            .unwrap()
            .is_some());
        assert!(f
            .dispatcher
            .ingest(br#"{"id":3,"kind":"ping","source":"s1"}"#)
            .await
            .unwrap()
            .is_none());
    }
}
