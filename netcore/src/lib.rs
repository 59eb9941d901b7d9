//! Cross-platform networking toolkit: addresses, sockets, a readiness
//! multiplexer, threaded TCP/UDP servers, and a signal/slot dispatch engine
//! used throughout to expose lifecycle and I/O events.

pub mod error;
pub mod event_queue;
pub mod inet;
pub mod init;
pub mod poll;
pub mod server;
pub mod signal;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use error::{Error, Result};
