//! Threaded TCP and UDP servers built on the primitives in [`crate::tcp`],
//! [`crate::udp`], and [`crate::signal`]: an acceptor/receiver thread feeding
//! a bounded queue, drained by a fixed worker pool.

mod queue;
mod tcp_connection;
mod tcp_server;
mod udp_handler;
mod udp_server;

pub use tcp_connection::{ConnectionContext, TcpServerConnection};
pub use tcp_server::{TcpServer, TcpServerStats};
pub use udp_handler::UdpHandler;
pub use udp_server::{HandlerFactory, UdpServer, UdpServerStats};
