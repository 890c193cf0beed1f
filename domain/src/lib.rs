//! Domain layer for announcements.
//!
//! Owns the in-memory announcement list and id sequence, and emits
//! `DomainEvent`s through the `events` hub so delivery (TCP gateway, SSE,
//! logging) stays decoupled from creation.

pub mod announcement;

pub use events::{Announcement, DomainEvent, EventPublisher};
