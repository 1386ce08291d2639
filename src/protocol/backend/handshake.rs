//! Connection phase packets sent by the server.

use crate::error::{Error, Result};
use crate::protocol::codec::{read_bytes, read_cstr, read_u8, read_u16, read_u32};
use crate::protocol::types::capabilities::{CLIENT_PLUGIN_AUTH, CLIENT_SECURE_CONNECTION};

use super::header;

/// Initial handshake packet (protocol version 10).
#[derive(Debug, Clone)]
pub struct HandshakeV10 {
    pub server_version: String,
    pub connection_id: u32,
    /// Full auth nonce (part 1 + part 2, without the trailing NUL)
    pub auth_data: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

impl HandshakeV10 {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.first() == Some(&header::ERR) {
            return Err(super::ErrPacket::parse(payload)?.into_error());
        }
        let (protocol_version, data) = read_u8(payload)?;
        if protocol_version != 10 {
            return Err(Error::Unsupported(format!(
                "handshake protocol version {protocol_version}"
            )));
        }
        let (server_version, data) = read_cstr(data)?;
        let (connection_id, data) = read_u32(data)?;
        let (auth_1, data) = read_bytes(data, 8)?;
        let (_filler, data) = read_u8(data)?;
        let (cap_lower, data) = read_u16(data)?;
        let (charset, data) = read_u8(data)?;
        let (status_flags, data) = read_u16(data)?;
        let (cap_upper, data) = read_u16(data)?;
        let (auth_len, data) = read_u8(data)?;
        let (_reserved, mut data) = read_bytes(data, 10)?;
        let capabilities = u32::from(cap_lower) | (u32::from(cap_upper) << 16);

        let mut auth_data = auth_1.to_vec();
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = usize::from(auth_len.saturating_sub(8)).max(13).min(data.len());
            let (auth_2, rest) = read_bytes(data, len)?;
            let end = memchr::memchr(0, auth_2).unwrap_or(auth_2.len());
            auth_data.extend_from_slice(&auth_2[..end]);
            data = rest;
        }

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !data.is_empty() {
            // Some servers omit the terminating NUL on the plugin name
            match read_cstr(data) {
                Ok((name, _)) => name.to_string(),
                Err(_) => String::from_utf8_lossy(data).into_owned(),
            }
        } else {
            "mysql_native_password".to_string()
        };

        Ok(Self {
            server_version: server_version.to_string(),
            connection_id,
            auth_data,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
        })
    }
}

/// Auth switch request (`0xFE` during the connection phase).
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub auth_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (head, data) = read_u8(payload)?;
        if head != header::EOF {
            return Err(Error::Protocol(format!(
                "expected auth switch request, got header 0x{head:02X}"
            )));
        }
        let (plugin, data) = read_cstr(data)?;
        let auth_data = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
        Ok(Self {
            plugin: plugin.to_string(),
            auth_data,
        })
    }
}

/// Extra authentication data (`0x01`), used by `caching_sha2_password`.
#[derive(Debug, Clone, Copy)]
pub struct AuthMoreData<'a>(pub &'a [u8]);

impl<'a> AuthMoreData<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (head, data) = read_u8(payload)?;
        if head != header::AUTH_MORE_DATA {
            return Err(Error::Protocol(format!(
                "expected auth more data, got header 0x{head:02X}"
            )));
        }
        Ok(Self(data))
    }
}
