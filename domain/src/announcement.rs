use chrono::Utc;
use events::{Announcement, DomainEvent, EventPublisher};
use log::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Creates announcements and publishes them to every registered sink.
///
/// Announcements are kept in memory only, newest first. Cloning shares the
/// same list and id sequence.
#[derive(Clone)]
pub struct AnnouncementService {
    announcements: Arc<RwLock<Vec<Announcement>>>,
    sequence: Arc<AtomicU64>,
    publisher: EventPublisher,
}

impl AnnouncementService {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            announcements: Arc::new(RwLock::new(Vec::new())),
            sequence: Arc::new(AtomicU64::new(0)),
            publisher,
        }
    }

    /// Stores a new announcement and publishes `AnnouncementCreated`.
    ///
    /// Publishing happens after the write lock is released, so sinks may
    /// read the list (or create more announcements) re-entrantly.
    pub fn create_announcement(
        &self,
        author: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Announcement {
        let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let announcement = Announcement::new(id, author, title, content, Utc::now());

        self.announcements
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(0, announcement.clone());
        info!(
            "New announcement added: #{} by {}",
            announcement.id, announcement.author
        );

        let delivered = self.publisher.publish(DomainEvent::AnnouncementCreated {
            announcement: announcement.clone(),
        });
        debug!(
            "Announcement #{} published to {delivered} sink(s)",
            announcement.id
        );

        announcement
    }

    /// All announcements, most recent first.
    pub fn all(&self) -> Vec<Announcement> {
        self.announcements
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
