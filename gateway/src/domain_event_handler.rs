use crate::handoff::Broadcaster;
use events::{DomainEvent, EventHandler, HandlerError};
use log::*;

/// Handles domain events by fanning them out to every gateway client.
///
/// Registered on the [`events::EventPublisher`] next to any other sinks
/// (SSE relays, loggers). It only enqueues frames, so it never blocks the
/// publishing thread.
pub struct GatewayEventHandler {
    broadcaster: Broadcaster,
}

impl GatewayEventHandler {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }
}

impl EventHandler for GatewayEventHandler {
    fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        match event {
            DomainEvent::AnnouncementCreated { announcement } => {
                debug!(
                    "Handling AnnouncementCreated event for announcement #{} ({} client(s) connected)",
                    announcement.id,
                    self.broadcaster.connected_count()
                );
                self.broadcaster.broadcast(announcement);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tcp-gateway"
    }
}
