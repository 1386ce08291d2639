//! Byte transports a session can run over.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};

/// Any bidirectional byte stream usable as a transport.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Tcp,
    Unix,
    /// Supplied by a custom [`Connector`](super::Connector)
    Custom,
}

/// Buffered reads, unbuffered writes. Writers flush explicitly.
pub struct Stream {
    io: BufReader<Box<dyn AsyncReadWrite>>,
    transport: Transport,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("transport", &self.transport)
            .field("buffered", &self.io.buffer().len())
            .finish()
    }
}

impl Stream {
    fn wrap(io: Box<dyn AsyncReadWrite>, transport: Transport) -> Self {
        Self {
            io: BufReader::new(io),
            transport,
        }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        Self::wrap(Box::new(stream), Transport::Tcp)
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self::wrap(Box::new(stream), Transport::Unix)
    }

    pub fn boxed<S: AsyncReadWrite + 'static>(stream: S) -> Self {
        Self::wrap(Box::new(stream), Transport::Custom)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.io.read_exact(buf).await?;
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.io.get_mut().write_all(buf).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.io.get_mut().flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.io.get_mut().shutdown().await
    }

    /// Local transport where the clear-text password may be sent.
    pub fn is_unix(&self) -> bool {
        self.transport == Transport::Unix
    }
}
