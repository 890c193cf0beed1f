//! Error types for the gateway.
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Errors that stop the gateway from starting.
///
/// Only `start` returns errors to the caller. Everything that goes wrong
/// once the reactor is running is recovered locally and logged.
#[derive(Debug)]
pub struct Error {
    // Underlying OS error, if any
    pub source: Option<io::Error>,
    // Enum representing which category of error
    pub error_kind: GatewayErrorKind,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GatewayErrorKind {
    // The listening address is unavailable (in use, no permission, ...)
    Bind { addr: SocketAddr },
    // Creating the poll instance or registering the listener/waker failed
    Multiplexer,
    // The reactor thread could not be spawned
    Spawn,
}

impl Error {
    pub(crate) fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Error {
            source: Some(source),
            error_kind: GatewayErrorKind::Bind { addr },
        }
    }

    pub(crate) fn multiplexer(source: io::Error) -> Self {
        Error {
            source: Some(source),
            error_kind: GatewayErrorKind::Multiplexer,
        }
    }

    pub(crate) fn spawn(source: io::Error) -> Self {
        Error {
            source: Some(source),
            error_kind: GatewayErrorKind::Spawn,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            GatewayErrorKind::Bind { addr } => write!(f, "Gateway Error: cannot bind {addr}")?,
            GatewayErrorKind::Multiplexer => {
                write!(f, "Gateway Error: multiplexer setup failed")?
            }
            GatewayErrorKind::Spawn => write!(f, "Gateway Error: cannot spawn reactor thread")?,
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}
