//! Non-blocking TCP fan-out gateway for announcements.
//!
//! A single reactor thread multiplexes every client connection with `mio`
//! and pushes each announcement to all connected clients. Clients may also
//! post announcements back over the same connection.
//!
//! # Architecture
//!
//! - **Single reactor thread**: accepts, reads and writes all happen on one
//!   thread that blocks only in the multiplexer wait.
//! - **Session arena**: per-connection state lives in a keyed map owned by
//!   the reactor; a concurrent connected-set mirrors it for other threads.
//! - **Broadcast hand-off**: foreign threads never touch sessions. They queue
//!   buffer assignments and wake the reactor, which applies them itself.
//! - **Overwrite on backlog**: a session holds at most one outbound buffer; a
//!   broadcast that arrives before the previous one drained replaces it.
//! - **Line framing**: inbound bytes are accumulated per session and split on
//!   `\n`, so commands may span reads or share one.
//!
//! # Message Flow
//!
//! 1. A producer publishes `DomainEvent::AnnouncementCreated` on the hub
//! 2. `GatewayEventHandler` encodes it once and queues it per session
//! 3. The reactor wakes, assigns the buffers and flushes them
//! 4. Unfinished writes keep write interest and resume on the next event
//!
//! # Example
//!
//! ```rust,ignore
//! use gateway::{Gateway, GatewayEventHandler, Settings};
//! use std::sync::Arc;
//!
//! let gateway = Gateway::start(Settings::with_port(6001), Arc::new(|message| {
//!     log::info!("client posted: {}", message.raw);
//! }))?;
//! publisher.register(Arc::new(GatewayEventHandler::new(gateway.broadcaster())));
//! ```
//!
//! # Modules
//!
//! - `codec`: wire format, command parsing and the inbound frame decoder
//! - `session`: per-connection state machine, session arena and connected-set
//! - `handoff`: the thread-safe `Broadcaster`
//! - `server`: `Gateway` lifecycle and the reactor loop
//! - `domain_event_handler`: hub sink that feeds the gateway

pub mod codec;
pub mod domain_event_handler;
pub mod error;
pub mod handoff;
pub mod server;
pub mod session;


pub use codec::{Command, Frame};
pub use domain_event_handler::GatewayEventHandler;
pub use error::{Error, GatewayErrorKind};
pub use handoff::Broadcaster;
pub use server::{Gateway, InboundConsumer, InboundMessage, Settings};
pub use session::SessionId;
