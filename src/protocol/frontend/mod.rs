//! MySQL frontend (client → server) packets.
//!
//! Writers produce the packet payload only; the caller frames it with
//! [`write_packets`](crate::protocol::packet::write_packets).

pub mod command;
pub mod handshake;

pub use command::{
    write_init_db, write_ping, write_query, write_quit, write_refresh, write_stmt_close,
    write_stmt_execute, write_stmt_prepare, write_stmt_reset,
};
pub use handshake::{
    HandshakeResponse, charset_id, scramble_caching_sha2, scramble_native, write_handshake_response,
};
