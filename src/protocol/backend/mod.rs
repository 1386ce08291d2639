//! MySQL backend (server → client) packets.

pub mod generic;
pub mod handshake;
pub mod prepared;
pub mod result;

pub use generic::{EofPacket, ErrPacket, OkPacket, is_eof_packet};
pub use handshake::{AuthMoreData, AuthSwitchRequest, HandshakeV10};
pub use prepared::StmtPrepareOk;
pub use result::{parse_binary_row, parse_column_definition, parse_text_row};

/// First byte of a response payload.
pub mod header {
    /// OK packet
    pub const OK: u8 = 0x00;
    /// Extra auth data (caching_sha2_password)
    pub const AUTH_MORE_DATA: u8 = 0x01;
    /// LOCAL INFILE request
    pub const LOCAL_INFILE: u8 = 0xFB;
    /// EOF packet, or auth switch request during the handshake
    pub const EOF: u8 = 0xFE;
    /// ERR packet
    pub const ERR: u8 = 0xFF;
}
