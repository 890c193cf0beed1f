//! Thread-safe entry point for pushing frames to every connected session.
//!
//! Callers never touch sessions or interest flags. They enqueue
//! [`Assignment`]s and wake the multiplexer. The reactor drains the queue at
//! the top of its next iteration and applies the assignments itself.

use crate::codec::{encode_announcement, Frame};
use crate::session::{ConnectedSet, SessionId};
use events::Announcement;
use log::*;
use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// One pending buffer destined for one session.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub session: SessionId,
    pub frame: Frame,
}

/// State shared between the reactor thread and every broadcaster.
pub(crate) struct Shared {
    pub(crate) running: AtomicBool,
    pub(crate) connected: ConnectedSet,
    waker: Waker,
    queue: UnboundedSender<Assignment>,
}

impl Shared {
    pub(crate) fn new(
        waker: Waker,
        connected: ConnectedSet,
    ) -> (Arc<Self>, UnboundedReceiver<Assignment>) {
        let (queue, assignments) = tokio::sync::mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            running: AtomicBool::new(false),
            connected,
            waker,
            queue,
        });
        (shared, assignments)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake gateway reactor: {e}");
        }
    }
}

/// Cloneable handle that any thread can use to fan a frame out to every
/// session connected at the time of the call.
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Encodes `announcement` once and queues it for every connected session.
    /// Returns how many sessions it was queued for.
    pub fn broadcast(&self, announcement: &Announcement) -> usize {
        let queued = self.broadcast_frame(encode_announcement(announcement));
        if queued > 0 {
            info!(
                "Broadcast queued announcement #{} '{}' by {} for {} client(s)",
                announcement.id, announcement.title, announcement.author, queued
            );
        } else {
            info!(
                "No gateway clients connected when announcement #{} '{}' was broadcast",
                announcement.id, announcement.title
            );
        }
        queued
    }

    /// Queues an already encoded frame for every connected session and wakes
    /// the reactor once. Zero recipients is not an error.
    pub fn broadcast_frame(&self, frame: Frame) -> usize {
        if !self.shared.is_running() {
            warn!("Cannot broadcast: gateway not running");
            return 0;
        }

        let mut queued = 0;
        for session in self.shared.connected.ids() {
            let assignment = Assignment {
                session,
                frame: frame.clone(),
            };
            if self.shared.queue.send(assignment).is_err() {
                // Receiver gone: the reactor has already exited.
                debug!("Gateway reactor stopped while broadcasting");
                return 0;
            }
            queued += 1;
        }

        if queued > 0 {
            self.shared.wake();
        }
        queued
    }

    /// Number of sessions a broadcast would currently target.
    pub fn connected_count(&self) -> usize {
        self.shared.connected.len()
    }
}
