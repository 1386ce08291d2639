//! MySQL wire protocol implementation.
//!
//! This module contains the low-level protocol encoding and decoding.
//!
//! # Structure
//!
//! - `backend`: Server → Client packets (parsing)
//! - `frontend`: Client → Server packets (encoding)
//! - `packet`: Packet framing, multi-packet splitting and compression
//! - `codec`: Low-level encoding/decoding primitives
//! - `types`: Common protocol constants (capabilities, commands, column types)

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod packet;
pub mod types;

pub use types::{ColumnType, Command, IsolationLevel};
