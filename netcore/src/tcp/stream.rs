use super::client::TcpClient;
use crate::error::{Error, Result};
use std::io;
use std::net::Shutdown;

/// Default buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// A buffered byte-stream facade over a [`TcpClient`].
///
/// Reads fill the buffer from the socket only when it's empty, then serve
/// out of it. Writes accumulate in the buffer and flush on overflow or an
/// explicit [`SocketStream::flush`]. `close` flushes, shuts down the write
/// side, then closes the underlying socket.
pub struct SocketStream {
    client: TcpClient,
    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
    capacity: usize,
}

impl SocketStream {
    pub fn new(client: TcpClient) -> Self {
        Self::with_capacity(client, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(client: TcpClient, capacity: usize) -> Self {
        SocketStream {
            client,
            read_buf: Vec::new(),
            read_pos: 0,
            write_buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn fill_buffer(&mut self) -> Result<usize> {
        self.read_buf.resize(self.capacity, 0);
        let n = self.client.recv_bytes(&mut self.read_buf)?;
        self.read_buf.truncate(n);
        self.read_pos = 0;
        Ok(n)
    }

    /// Reads into `buf`, filling the internal buffer from the socket first
    /// if it is currently empty. Returns `0` on peer-closed, matching
    /// `TcpClient::recv_bytes`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.read_pos >= self.read_buf.len() && self.fill_buffer()? == 0 {
            return Ok(0);
        }
        let available = &self.read_buf[self.read_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.read_pos += n;
        Ok(n)
    }

    /// Accumulates `buf` in the write buffer, flushing first if it would
    /// overflow the configured capacity.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.write_buf.len() + buf.len() > self.capacity {
            self.flush()?;
        }
        if buf.len() >= self.capacity {
            return self.client.send_bytes_all(buf);
        }
        self.write_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Writes the buffered bytes with `send_bytes_all` semantics.
    pub fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let sent = self.client.send_bytes_all(&self.write_buf)?;
        self.write_buf.drain(..sent);
        Ok(())
    }

    /// Flushes, shuts down the write side, then closes the socket.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        let _ = self.client.shutdown(Shutdown::Write);
        self.client.close();
        Ok(())
    }

    pub fn client(&self) -> &TcpClient {
        &self.client
    }
}

fn to_io_error(e: Error) -> io::Error {
    match e {
        Error::Io { source, .. } => source,
        Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, e),
        Error::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, e),
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl io::Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SocketStream::read(self, buf).map_err(to_io_error)
    }
}

impl io::Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SocketStream::write(self, buf).map_err(to_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        SocketStream::flush(self).map_err(to_io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inet::Address;
    use crate::tcp::ServerSocket;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn buffers_small_writes_until_flush() {
        let server = ServerSocket::new();
        server.bind(&Address::parse("127.0.0.1:0").unwrap()).unwrap();
        server.listen(8).unwrap();
        let local = server.local_address().unwrap();

        let handle = thread::spawn(move || {
            let (client, _) = server.accept().unwrap();
            let mut buf = [0u8; 11];
            let n = client.recv_bytes_exact(&mut buf).unwrap();
            String::from_utf8(buf[..n].to_vec()).unwrap()
        });

        let client = TcpClient::new();
        client.connect(&local).unwrap();
        let mut stream = SocketStream::new(client);
        stream.write_all(b"hello ").unwrap();
        stream.write_all(b"world").unwrap();
        stream.flush().unwrap();

        assert_eq!(handle.join().unwrap(), "hello world");
    }
}
