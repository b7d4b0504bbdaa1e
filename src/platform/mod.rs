pub mod telegram;
pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, error, warn};

use crate::config::DeliveryConfig;
use crate::update::SessionId;

/// Reply keyboard attached to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Markup {
    /// Rows of button labels; pressing one sends its label as text
    Keyboard(Vec<Vec<String>>),
    /// Hide a previously shown keyboard
    RemoveKeyboard,
}

/// What a handler wants sent back to the session that triggered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub markup: Option<Markup>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markup: None,
        }
    }

    pub fn with_markup(mut self, markup: Markup) -> Self {
        self.markup = Some(markup);
        self
    }
}

/// A response bound for a specific session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAction {
    pub session: SessionId,
    pub text: String,
    pub markup: Option<Markup>,
}

impl OutboundAction {
    pub fn new(session: SessionId, reply: Reply) -> Self {
        Self {
            session,
            text: reply.text,
            markup: reply.markup,
        }
    }
}

/// Sends outbound actions to the chat platform
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, action: &OutboundAction) -> Result<()>;
}

/// Deliver an action with a per-attempt timeout and exponential backoff.
/// After `max_attempts` failures the action is logged and dropped.
/// Returns whether the action was delivered.
pub async fn deliver(
    transport: &dyn Transport,
    action: &OutboundAction,
    config: &DeliveryConfig,
) -> bool {
    let timeout = config.send_timeout();
    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.base_delay())
        .with_max_delay(config.max_delay())
        .with_max_times(config.max_attempts.saturating_sub(1) as usize);

    let attempt = move || async move {
        match tokio::time::timeout(timeout, transport.send(action)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("send timed out after {:?}", timeout)),
        }
    };

    let result = attempt
        .retry(backoff)
        .notify(|err: &anyhow::Error, delay| {
            warn!(
                "Send to session {} failed: {:#}; retrying in {:?}",
                action.session, err, delay
            );
        })
        .await;

    match result {
        Ok(()) => {
            debug!("Delivered reply to session {}", action.session);
            true
        }
        Err(e) => {
            error!(
                "Dropping reply to session {} after {} attempt(s): {:#}",
                action.session, config.max_attempts, e
            );
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Records every action; fails the first `failures` sends.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<OutboundAction>>,
        pub attempts: AtomicUsize,
        failures: usize,
    }

    impl RecordingTransport {
        pub fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Self::default()
            }
        }

        pub async fn texts(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|a| a.text.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, action: &OutboundAction) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                anyhow::bail!("platform unavailable (attempt {})", attempt + 1);
            }
            self.sent.lock().await.push(action.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;
    use std::sync::atomic::Ordering;

    fn fast_config(max_attempts: u32) -> DeliveryConfig {
        DeliveryConfig {
            max_attempts,
            send_timeout_secs: 1,
            base_delay_ms: 1,
            max_delay_secs: 1,
        }
    }

    fn action() -> OutboundAction {
        OutboundAction::new(SessionId::from("s1"), Reply::text("hello"))
    }

    #[tokio::test]
    async fn test_deliver_first_try() {
        let transport = RecordingTransport::default();
        assert!(deliver(&transport, &action(), &fast_config(3)).await);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(transport.texts().await, vec!["hello"]);
    }

    #[tokio::test]
    async fn test_deliver_retries_transient_failures() {
        let transport = RecordingTransport::failing(2);
        assert!(deliver(&transport, &action(), &fast_config(3)).await);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(transport.texts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_gives_up_after_max_attempts() {
        let transport = RecordingTransport::failing(10);
        assert!(!deliver(&transport, &action(), &fast_config(3)).await);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert!(transport.texts().await.is_empty());
    }

    struct StuckTransport;

    #[async_trait]
    impl Transport for StuckTransport {
        async fn send(&self, _action: &OutboundAction) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_times_out_hung_sends() {
        assert!(!deliver(&StuckTransport, &action(), &fast_config(2)).await);
    }
}
