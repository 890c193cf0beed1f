//! Event system infrastructure for the announcement gateway.
//!
//! This crate provides the broadcast hub that decouples whoever produces an
//! announcement (the inbound TCP path, an upstream SSE mirror, a REST layer)
//! from whoever delivers it (the TCP gateway, a logger, an SSE relay).
//!
//! # Architecture
//!
//! - **DomainEvent**: Enum representing all business events in the system
//! - **EventHandler**: Trait for implementing event sinks
//! - **EventPublisher**: Publishes events to registered sinks in registration order
//!
//! This crate has no dependencies on internal crates (gateway, domain, etc.),
//! avoiding circular dependencies.

use log::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

mod announcement;

pub use announcement::Announcement;

/// Error type returned by an [`EventHandler`] that failed to process an event.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Domain events that represent business-level changes in the system.
/// These events are emitted when domain operations complete successfully.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// Emitted when a new announcement has been created or relayed from upstream.
    /// Triggers a fan-out to every connected gateway client.
    AnnouncementCreated { announcement: Announcement },
}

/// Trait for handling domain events.
/// Implementations can perform side effects like pushing frames to sockets,
/// relaying to SSE clients, logging, etc.
///
/// Handlers are invoked synchronously on the publishing thread, so they must
/// not block. Hand work off to another thread when it can.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;

    /// Label used when logging failures of this handler.
    fn name(&self) -> &str {
        "event-handler"
    }
}

/// Adapts a closure into an [`EventHandler`].
struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Publishes domain events to registered handlers.
/// Handlers are called sequentially in registration order.
///
/// Clones share the same handler list, so a handler registered through one
/// clone is seen by every other clone.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a new event handler. It will run after every handler
    /// registered before it.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        debug!("Registering event handler '{}'", handler.name());
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    /// Register a closure as an event handler.
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnHandler {
            name: name.into(),
            f,
        }));
    }

    /// Builder form of [`EventPublisher::register`].
    pub fn with_handler(self, handler: Arc<dyn EventHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Publish an event to all registered handlers and return how many of
    /// them handled it successfully.
    ///
    /// If a handler errors or panics we log it and continue with the
    /// remaining handlers. The handler list is snapshotted first, so a
    /// handler may publish again from inside `handle`.
    pub fn publish(&self, event: DomainEvent) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut delivered = 0;
        for handler in handlers.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!("Event handler '{}' failed: {e}", handler.name());
                }
                Err(_) => {
                    error!("Event handler '{}' panicked", handler.name());
                }
            }
        }
        delivered
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    fn created(id: u64) -> DomainEvent {
        DomainEvent::AnnouncementCreated {
            announcement: Announcement::new(id, "alice", "Hi", "Hello", Utc::now()),
        }
    }

    fn recorder(
        publisher: &EventPublisher,
        name: &'static str,
        calls: &Arc<Mutex<Vec<&'static str>>>,
    ) {
        let calls = Arc::clone(calls);
        publisher.register_fn(name, move |_| {
            calls.lock().unwrap().push(name);
            Ok(())
        });
    }

    #[test]
    fn test_publish_invokes_handlers_in_registration_order() {
        let publisher = EventPublisher::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        recorder(&publisher, "first", &calls);
        recorder(&publisher, "second", &calls);
        recorder(&publisher, "third", &calls);

        let delivered = publisher.publish(created(1));

        assert_eq!(delivered, 3);
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_handler_does_not_block_later_handlers() {
        let publisher = EventPublisher::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        publisher.register_fn("broken", |_| Err("socket gone".into()));
        recorder(&publisher, "after-error", &calls);

        assert_eq!(publisher.publish(created(1)), 1);
        assert_eq!(*calls.lock().unwrap(), vec!["after-error"]);
    }

    #[test]
    fn test_panicking_handler_does_not_block_later_handlers() {
        let publisher = EventPublisher::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        publisher.register_fn("panics", |_| panic!("sink exploded"));
        recorder(&publisher, "after-panic", &calls);

        assert_eq!(publisher.publish(created(1)), 1);
        assert_eq!(*calls.lock().unwrap(), vec!["after-panic"]);
    }

    #[test]
    fn test_publish_with_no_handlers_is_a_no_op() {
        let publisher = EventPublisher::default();
        assert_eq!(publisher.publish(created(1)), 0);
        assert_eq!(publisher.handler_count(), 0);
    }

    #[test]
    fn test_clones_share_registrations() {
        let publisher = EventPublisher::new();
        let clone = publisher.clone();
        let calls = Arc::new(Mutex::new(Vec::new()));
        recorder(&clone, "late", &calls);

        assert_eq!(publisher.handler_count(), 1);
        assert_eq!(publisher.publish(created(2)), 1);
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let publisher = EventPublisher::new();
        let inner = publisher.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = Arc::clone(&seen);
        publisher.register_fn("echo", move |event| {
            let DomainEvent::AnnouncementCreated { announcement } = event;
            seen_by_handler.lock().unwrap().push(announcement.id);
            if announcement.id == 1 {
                inner.publish(created(2));
            }
            Ok(())
        });

        publisher.publish(created(1));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
