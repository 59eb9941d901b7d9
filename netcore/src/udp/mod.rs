//! Datagram endpoint: unconnected `send_to`/`recv_from`, connected-mode
//! `send`/`recv`, broadcast, and multicast membership.

mod socket;

pub use socket::UdpSocket;

/// Maximum UDP payload this crate will send in one call.
pub const MAX_DATAGRAM_SIZE: usize = 65507;
