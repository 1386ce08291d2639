//! Asynchronous MySQL client using Tokio.

mod conn;
mod connector;
mod engine;
mod framed;
mod pool;
mod result;
mod statement;
mod statement_pool;
mod stream;
mod transaction;

pub use conn::Connection;
pub use connector::{ConnectFuture, Connector, Session, TcpConnector};
pub use engine::ProtocolEngine;
pub use framed::PacketIo;
pub use pool::{Pool, PooledConn};
pub use result::ResultStream;
pub use statement::PreparedStatement;
pub use statement_pool::PooledStatement;
pub use stream::{AsyncReadWrite, Stream};
pub use transaction::{Transaction, savepoint_name};
