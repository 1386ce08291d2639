//! Connection phase packets sent by the client.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::protocol::codec::{write_bytes, write_cstr, write_lenenc_bytes, write_u8, write_u32};
use crate::protocol::packet::MAX_PAYLOAD;
use crate::protocol::types::capabilities::{CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH};

/// HandshakeResponse41 fields.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
}

/// Write a HandshakeResponse41 payload.
///
/// `capabilities` must already be masked against what the server offers.
pub fn write_handshake_response(buf: &mut Vec<u8>, resp: &HandshakeResponse<'_>) {
    write_u32(buf, resp.capabilities);
    write_u32(buf, MAX_PAYLOAD as u32);
    write_u8(buf, resp.charset);
    write_bytes(buf, &[0u8; 23]);
    write_cstr(buf, resp.user);
    write_lenenc_bytes(buf, resp.auth_response);
    if resp.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        write_cstr(buf, resp.database.unwrap_or(""));
    }
    if resp.capabilities & CLIENT_PLUGIN_AUTH != 0 {
        write_cstr(buf, resp.auth_plugin);
    }
}

/// Collation id sent in the handshake for a charset name.
///
/// Only the handful of charsets that matter at connect time are known here;
/// the session charset is set with `SET NAMES` afterwards anyway.
pub fn charset_id(charset: &str) -> u8 {
    match charset.to_ascii_lowercase().as_str() {
        "latin1" => 8,
        "utf8" | "utf8mb3" => 33,
        "binary" => 63,
        _ => 45, // utf8mb4_general_ci
    }
}

fn xor(mut lhs: Vec<u8>, rhs: &[u8]) -> Vec<u8> {
    for (a, b) in lhs.iter_mut().zip(rhs) {
        *a ^= b;
    }
    lhs
}

/// `mysql_native_password`: `SHA1(pw) XOR SHA1(nonce + SHA1(SHA1(pw)))`.
pub fn scramble_native(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(stage2);
    xor(stage1.to_vec(), &hasher.finalize())
}

/// `caching_sha2_password` fast auth:
/// `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + nonce)`.
pub fn scramble_caching_sha2(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(nonce);
    xor(stage1.to_vec(), &hasher.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::codec::write_u16;
    use crate::protocol::types::capabilities::{BASE_CLIENT_FLAGS, CLIENT_SECURE_CONNECTION};

    pub(crate) fn encode_handshake(version: &str, conn_id: u32, nonce: &[u8], plugin: &str) -> Vec<u8> {
        let caps = BASE_CLIENT_FLAGS | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        let mut out = vec![10];
        write_cstr(&mut out, version);
        write_u32(&mut out, conn_id);
        out.extend_from_slice(&nonce[..8]);
        write_u8(&mut out, 0);
        write_u16(&mut out, caps as u16);
        write_u8(&mut out, 45);
        write_u16(&mut out, 2);
        write_u16(&mut out, (caps >> 16) as u16);
        write_u8(&mut out, (nonce.len() + 1) as u8);
        out.extend_from_slice(&[0u8; 10]);
        out.extend_from_slice(&nonce[8..]);
        write_u8(&mut out, 0);
        write_cstr(&mut out, plugin);
        out
    }

    #[test]
    fn test_native_scramble_is_20_bytes_and_deterministic() {
        let nonce = b"abcdefghijklmnopqrst";
        let a = scramble_native("secret", nonce);
        assert_eq!(a.len(), 20);
        assert_eq!(a, scramble_native("secret", nonce));
        assert_ne!(a, scramble_native("secret", b"tsrqponmlkjihgfedcba"));
        assert!(scramble_native("", nonce).is_empty());
    }

    #[test]
    fn test_native_scramble_inverts() {
        // Server check: SHA1(nonce + stored) XOR scramble == SHA1(pw), stored = SHA1(SHA1(pw))
        let nonce = b"01234567890123456789";
        let scramble = scramble_native("pw", nonce);
        let stored = Sha1::digest(Sha1::digest(b"pw"));
        let mut hasher = Sha1::new();
        hasher.update(nonce);
        hasher.update(stored);
        let recovered = xor(scramble, &hasher.finalize());
        assert_eq!(Sha1::digest(&recovered).as_slice(), stored.as_slice());
    }

    #[test]
    fn test_caching_sha2_scramble_len() {
        assert_eq!(scramble_caching_sha2("pw", b"01234567890123456789").len(), 32);
    }

    #[test]
    fn test_handshake_response_layout() {
        let mut buf = Vec::new();
        write_handshake_response(
            &mut buf,
            &HandshakeResponse {
                capabilities: CLIENT_PLUGIN_AUTH | CLIENT_CONNECT_WITH_DB,
                charset: 45,
                user: "app",
                auth_response: &[1, 2],
                database: Some("shop"),
                auth_plugin: "mysql_native_password",
            },
        );
        assert_eq!(buf[8], 45);
        assert_eq!(&buf[32..36], b"app\0");
        assert_eq!(&buf[36..39], &[2, 1, 2]);
        assert_eq!(&buf[39..44], b"shop\0");
        assert_eq!(&buf[44..], b"mysql_native_password\0");
    }
}
