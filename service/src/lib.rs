//! Infrastructure shared by the gateway binaries: command line / environment
//! configuration and console logging.

pub mod config;
pub mod logging;
