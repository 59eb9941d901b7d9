//! Socket handle ownership, options, and the timeout-aware primitives that
//! `tcp` and `udp` build on.

mod options;
mod socket_core;

pub use options::OptionValue;
pub use socket_core::{PollMode, SockKind, SocketCore};
