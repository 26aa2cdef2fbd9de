//! Event dispatcher: multiplexes one subscriber across typed handlers.
//!
//! The dispatcher is a process-wide service with an explicit
//! `start`/`stop` lifecycle. Handlers are passed in as explicit values
//! keyed by event type; there is no module-level registry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::subscriber::Subscriber;
use crate::types::{EventType, StreamEntry, WaveMessage};

/// Result returned by an event handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    pub success: bool,
    pub data: serde_json::Value,
    pub action_taken: String,
    pub next_action: Option<String>,
}

impl HandlerResult {
    /// A successful result describing the action taken.
    pub fn ok(action_taken: impl Into<String>) -> Self {
        Self {
            success: true,
            data: serde_json::Value::Null,
            action_taken: action_taken.into(),
            next_action: None,
        }
    }
}

/// A typed event handler.
pub type EventHandler = Arc<dyn Fn(&WaveMessage) -> Result<HandlerResult> + Send + Sync>;

/// Callback fired after every dispatch, for observability.
pub type DispatchCallback = Arc<dyn Fn(&EventType, &HandlerResult) + Send + Sync>;

/// Multiplexes one subscriber across handlers registered per event type.
pub struct EventDispatcher {
    handlers: HashMap<EventType, EventHandler>,
    on_dispatch: Option<DispatchCallback>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<Result<()>>>,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            on_dispatch: None,
            cancel: CancellationToken::new(),
            worker: None,
        }
    }

    /// Register a handler for an event type, replacing any existing one.
    pub fn register(&mut self, event_type: EventType, handler: EventHandler) {
        self.handlers.insert(event_type, handler);
    }

    /// Set the observability callback fired after each dispatch.
    pub fn on_dispatch(&mut self, callback: DispatchCallback) {
        self.on_dispatch = Some(callback);
    }

    /// Whether a handler is registered for an event type.
    pub fn handles(&self, event_type: EventType) -> bool {
        self.handlers.contains_key(&event_type)
    }

    /// Dispatch a single message to its handler.
    ///
    /// Returns `None` when no handler is registered for the message's
    /// event type.
    pub fn dispatch(&self, message: &WaveMessage) -> Option<Result<HandlerResult>> {
        let handler = self.handlers.get(&message.event_type)?;
        let result = handler(message);
        if let (Some(callback), Ok(handled)) = (&self.on_dispatch, &result) {
            callback(&message.event_type, handled);
        }
        Some(result)
    }

    /// Start the dispatch loop on a subscriber.
    ///
    /// Unhandled event types are acknowledged and skipped. Handler
    /// errors propagate into the subscriber's dead-letter path.
    pub fn start(&mut self, mut subscriber: Subscriber) {
        let handlers = self.handlers.clone();
        let on_dispatch = self.on_dispatch.clone();
        let cancel = self.cancel.clone();

        let worker = tokio::spawn(async move {
            let handle = move |entry: &StreamEntry| -> Result<()> {
                let Some(handler) = handlers.get(&entry.message.event_type) else {
                    tracing::debug!(
                        event = %entry.message.event_type,
                        "no handler registered, skipping"
                    );
                    return Ok(());
                };
                let result = handler(&entry.message)?;
                if let Some(ref callback) = on_dispatch {
                    callback(&entry.message.event_type, &result);
                }
                Ok(())
            };
            subscriber.listen(handle, cancel).await
        });

        self.worker = Some(worker);
    }

    /// Stop the dispatch loop and wait for it to exit.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            worker.await??;
        }
        Ok(())
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(event_type: EventType) -> WaveMessage {
        WaveMessage::new(event_type, serde_json::json!({}), "test", "proj")
    }

    #[test]
    fn dispatch_routes_to_registered_handler() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(
            EventType::GatePassed,
            Arc::new(|_| Ok(HandlerResult::ok("recorded gate"))),
        );

        let result = dispatcher
            .dispatch(&message(EventType::GatePassed))
            .expect("handler should exist")
            .expect("handler should succeed");
        assert!(result.success);
        assert_eq!(result.action_taken, "recorded gate");
    }

    #[test]
    fn dispatch_returns_none_without_handler() {
        let dispatcher = EventDispatcher::new();
        assert!(dispatcher.dispatch(&message(EventType::AgentError)).is_none());
    }

    #[test]
    fn dispatch_callback_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(
            EventType::StoryStarted,
            Arc::new(|_| Ok(HandlerResult::ok("started"))),
        );
        dispatcher.on_dispatch(Arc::new(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let _ = dispatcher.dispatch(&message(EventType::StoryStarted));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_replaces_existing_handler() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(
            EventType::GateFailed,
            Arc::new(|_| Ok(HandlerResult::ok("first"))),
        );
        dispatcher.register(
            EventType::GateFailed,
            Arc::new(|_| Ok(HandlerResult::ok("second"))),
        );

        let result = dispatcher
            .dispatch(&message(EventType::GateFailed))
            .unwrap()
            .unwrap();
        assert_eq!(result.action_taken, "second");
    }
}
