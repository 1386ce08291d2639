//! Establishing authenticated sessions.

use std::future::Future;
use std::pin::Pin;

use tokio::net::{TcpStream, UnixStream};

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::types::capabilities::{CLIENT_COMPRESS, CLIENT_DEPRECATE_EOF};
use crate::state::{HandshakeStateMachine, HandshakeStep};

use super::framed::PacketIo;
use super::stream::Stream;

/// An authenticated session, ready for the command phase.
#[derive(Debug)]
pub struct Session {
    pub(crate) io: PacketIo,
    pub capabilities: u32,
    pub server_version: String,
    pub connection_id: u32,
}

impl Session {
    /// Run the connection phase over an already-open stream.
    pub async fn establish(stream: Stream, opts: &Opts) -> Result<Self> {
        let secure = stream.is_unix();
        let mut io = PacketIo::new(stream);
        let mut machine = HandshakeStateMachine::new(opts, secure);
        let mut payload = Vec::new();

        io.reset_seq();
        loop {
            io.read_packet(&mut payload).await?;
            match machine.step(&payload)? {
                HandshakeStep::Write(response) => io.write_payload(&response).await?,
                HandshakeStep::NeedPacket => {}
                HandshakeStep::Finished => break,
            }
        }

        let capabilities = machine.capabilities();
        if capabilities & CLIENT_COMPRESS != 0 {
            io.enable_compression();
        }
        tracing::debug!(
            connection_id = machine.connection_id(),
            server_version = machine.server_version(),
            compressed = io.is_compressed(),
            "session established"
        );
        Ok(Self {
            io,
            capabilities,
            server_version: machine.server_version().to_string(),
            connection_id: machine.connection_id(),
        })
    }

    /// Rows end with an OK packet instead of EOF.
    pub fn deprecate_eof(&self) -> bool {
        self.capabilities & CLIENT_DEPRECATE_EOF != 0
    }
}

/// Boxed future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>>;

/// Produces authenticated sessions for new connections.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, opts: &'a Opts) -> ConnectFuture<'a>;
}

/// TCP or Unix socket connector, bounded by `Opts::connect_timeout`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    async fn open(opts: &Opts) -> Result<Session> {
        let stream = if let Some(socket_path) = &opts.socket {
            Stream::unix(UnixStream::connect(socket_path).await?)
        } else {
            if opts.host.is_empty() {
                return Err(Error::InvalidUsage("host is empty".into()));
            }
            let tcp = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
            tcp.set_nodelay(true)?;
            Stream::tcp(tcp)
        };
        Session::establish(stream, opts).await
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, opts: &'a Opts) -> ConnectFuture<'a> {
        Box::pin(async move {
            match opts.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, Self::open(opts))
                    .await
                    .map_err(|e| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("connecting to {}: {e}", opts.address()),
                        ))
                    })?,
                None => Self::open(opts).await,
            }
        })
    }
}
