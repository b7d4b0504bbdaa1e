use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::error::DispatchError;
use crate::platform::Reply;
use crate::update::{RouteKey, Update};

/// Handles one kind of update. `Ok(None)` means nothing to send back.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, update: &Update) -> Result<Option<Reply>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Update) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Reply>>> + Send + 'static,
{
    async fn handle(&self, update: &Update) -> Result<Option<Reply>> {
        (self.0)(update.clone()).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Update) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Reply>>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Match key → handler, plus the fallback for everything unmatched.
/// Built at startup, read-only once handed to the dispatcher.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<RouteKey, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with handlers every bot wants: a generic `/start`,
    /// `/ping`, and silent acks for edits and membership changes.
    /// Bots rebind any of them with `register_override`.
    pub fn with_defaults() -> Self {
        let ignore = || handler_fn(|_update| async { Ok(None) });
        let defaults = [
            (
                "/start",
                handler_fn(|_update| async { Ok(Some(Reply::text("Hi! The bot is running."))) }),
            ),
            (
                "/ping",
                handler_fn(|_update| async { Ok(Some(Reply::text("pong"))) }),
            ),
            ("edited_message", ignore()),
            ("my_chat_member", ignore()),
        ];

        let mut registry = Self::new();
        for (key, handler) in defaults {
            registry.handlers.insert(RouteKey::parse(key), handler);
        }
        registry
    }

    /// Bind a handler to `/command` or an update kind (`text`, `callback`, ...).
    pub fn register(
        &mut self,
        key: impl AsRef<str>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), DispatchError> {
        let key = RouteKey::parse(key.as_ref());
        if self.handlers.contains_key(&key) {
            return Err(DispatchError::Conflict(key.to_string()));
        }
        info!("Registered handler: {}", key);
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Bind a handler, replacing any existing binding for the key
    pub fn register_override(
        &mut self,
        key: impl AsRef<str>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        let key = RouteKey::parse(key.as_ref());
        info!("Registered handler (override): {}", key);
        self.handlers.insert(key, handler)
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn Handler>) {
        self.fallback = Some(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Startup check: every update must have somewhere to go.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.fallback.is_none() {
            return Err(DispatchError::UnhandledUpdate("<fallback>".to_string()));
        }
        Ok(())
    }

    /// Find the handler for an update: exact key match, else the fallback.
    pub fn resolve(&self, update: &Update) -> Result<&Arc<dyn Handler>, DispatchError> {
        let key = update.route_key();
        self.handlers
            .get(&key)
            .or(self.fallback.as_ref())
            .ok_or_else(|| DispatchError::UnhandledUpdate(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Payload;

    fn reply_with(text: &'static str) -> Arc<dyn Handler> {
        handler_fn(move |_update| async move { Ok(Some(Reply::text(text))) })
    }

    fn event(kind: &str) -> Update {
        Update::new(
            1,
            "s1",
            Payload::Event {
                kind: kind.to_string(),
            },
        )
    }

    async fn resolved_text(registry: &HandlerRegistry, update: &Update) -> String {
        registry
            .resolve(update)
            .unwrap()
            .handle(update)
            .await
            .unwrap()
            .unwrap()
            .text
    }

    #[test]
    fn test_duplicate_key_conflicts() {
        let mut registry = HandlerRegistry::new();
        registry.register("ping", reply_with("pong")).unwrap();
        let err = registry.register("ping", reply_with("again")).unwrap_err();
        assert!(matches!(err, DispatchError::Conflict(key) if key == "ping"));
        assert_eq!(registry.len(), 1);
    }

    fn command(text: &str) -> Update {
        Update::new(2, "s1", Payload::from_text(text))
    }

    #[tokio::test]
    async fn test_commands_and_kinds_are_separate_keys() {
        let mut registry = HandlerRegistry::new();
        registry.register("/start", reply_with("command")).unwrap();
        registry.register("start", reply_with("event")).unwrap();
        registry.register("text", reply_with("plain")).unwrap();
        registry.set_fallback(reply_with("fallback"));
        assert!(matches!(
            registry.register("/START", reply_with("again")),
            Err(DispatchError::Conflict(key)) if key == "/start"
        ));

        assert_eq!(resolved_text(&registry, &command("/start")).await, "command");
        assert_eq!(resolved_text(&registry, &event("start")).await, "event");
        assert_eq!(resolved_text(&registry, &command("hello")).await, "plain");
        // a command named like a kind is still a command
        assert_eq!(resolved_text(&registry, &command("/text")).await, "fallback");
    }

    #[tokio::test]
    async fn test_defaults_can_be_overridden() {
        let mut registry = HandlerRegistry::with_defaults();
        registry.set_fallback(reply_with("fallback"));
        assert!(registry.register("/ping", reply_with("again")).is_err());

        assert_eq!(resolved_text(&registry, &command("/ping")).await, "pong");
        let edit = event("edited_message");
        assert!(registry
            .resolve(&edit)
            .unwrap()
            .handle(&edit)
            .await
            .unwrap()
            .is_none());

        assert!(registry
            .register_override("/start", reply_with("welcome"))
            .is_some());
        assert_eq!(resolved_text(&registry, &command("/start")).await, "welcome");
    }

    #[tokio::test]
    async fn test_override_replaces_binding() {
        let mut registry = HandlerRegistry::new();
        registry.set_fallback(reply_with("fallback"));
        registry.register("ping", reply_with("pong")).unwrap();
        assert!(registry.register_override("ping", reply_with("PONG")).is_some());

        assert_eq!(resolved_text(&registry, &event("ping")).await, "PONG");
    }

    #[tokio::test]
    async fn test_unknown_key_goes_to_fallback() {
        let mut registry = HandlerRegistry::new();
        registry.register("ping", reply_with("pong")).unwrap();
        registry.set_fallback(reply_with("fallback"));

        assert_eq!(resolved_text(&registry, &event("ping")).await, "pong");
        assert_eq!(resolved_text(&registry, &event("other")).await, "fallback");
    }

    #[test]
    fn test_missing_fallback() {
        let mut registry = HandlerRegistry::new();
        registry.register("ping", reply_with("pong")).unwrap();

        assert!(matches!(
            registry.validate(),
            Err(DispatchError::UnhandledUpdate(_))
        ));
        assert!(registry.resolve(&event("ping")).is_ok());
        assert!(matches!(
            registry.resolve(&event("other")),
            Err(DispatchError::UnhandledUpdate(key)) if key == "other"
        ));
    }
}
