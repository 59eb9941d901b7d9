//! Stream-socket endpoints: a connected client, a listening server socket,
//! and a buffered facade over the client.

mod client;
mod server_socket;
mod stream;

pub use client::TcpClient;
pub use server_socket::ServerSocket;
pub use stream::SocketStream;
