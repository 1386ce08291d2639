//! Connection phase state machine: greeting, handshake response and auth.

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::{AuthMoreData, AuthSwitchRequest, ErrPacket, HandshakeV10, header};
use crate::protocol::frontend::{
    HandshakeResponse, charset_id, scramble_caching_sha2, scramble_native, write_handshake_response,
};
use crate::protocol::types::capabilities::{
    BASE_CLIENT_FLAGS, CLIENT_COMPRESS, CLIENT_CONNECT_WITH_DB, CLIENT_LOCAL_FILES,
    CLIENT_PROTOCOL_41,
};

const NATIVE_PASSWORD: &str = "mysql_native_password";
const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// caching_sha2_password: cached hash matched, an OK packet follows.
const FAST_AUTH_SUCCESS: u8 = 0x03;
/// caching_sha2_password: the server needs the clear-text password.
const PERFORM_FULL_AUTH: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingGreeting,
    WaitingAuthResult,
    Finished,
}

/// What the caller should do next.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send this payload as the next packet, then read a packet.
    Write(Vec<u8>),
    /// Read the next packet.
    NeedPacket,
    /// Authenticated; the command phase may begin.
    Finished,
}

/// Drives the connection phase without performing I/O.
pub struct HandshakeStateMachine<'a> {
    opts: &'a Opts,
    secure_transport: bool,
    state: State,
    capabilities: u32,
    plugin: String,
    nonce: Vec<u8>,
    server_version: String,
    connection_id: u32,
}

impl<'a> HandshakeStateMachine<'a> {
    /// `secure_transport` allows sending the clear-text password when the
    /// server requests full authentication (Unix sockets).
    pub fn new(opts: &'a Opts, secure_transport: bool) -> Self {
        Self {
            opts,
            secure_transport,
            state: State::WaitingGreeting,
            capabilities: 0,
            plugin: String::new(),
            nonce: Vec::new(),
            server_version: String::new(),
            connection_id: 0,
        }
    }

    /// Negotiated capabilities (valid after the greeting).
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Feed one packet received from the server.
    pub fn step(&mut self, payload: &[u8]) -> Result<HandshakeStep> {
        match self.state {
            State::WaitingGreeting => self.handle_greeting(payload),
            State::WaitingAuthResult => self.handle_auth_result(payload),
            State::Finished => Err(Error::Protocol("handshake already finished".into())),
        }
    }

    fn handle_greeting(&mut self, payload: &[u8]) -> Result<HandshakeStep> {
        let greeting = HandshakeV10::parse(payload)?;
        if greeting.capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::Unsupported(
                "server does not support protocol 4.1".into(),
            ));
        }

        let mut wanted = BASE_CLIENT_FLAGS;
        if self.opts.database.is_some() {
            wanted |= CLIENT_CONNECT_WITH_DB;
        }
        if self.opts.compress {
            wanted |= CLIENT_COMPRESS;
        }
        if self.opts.local_infile {
            wanted |= CLIENT_LOCAL_FILES;
        }
        self.capabilities = wanted & greeting.capabilities;
        self.server_version = greeting.server_version;
        self.connection_id = greeting.connection_id;
        self.nonce = greeting.auth_data;
        self.plugin = match greeting.auth_plugin.as_str() {
            CACHING_SHA2_PASSWORD => CACHING_SHA2_PASSWORD.to_string(),
            // Unknown plugins get a native scramble; the server switches us
            _ => NATIVE_PASSWORD.to_string(),
        };
        tracing::trace!(
            server_version = %self.server_version,
            connection_id = self.connection_id,
            plugin = %self.plugin,
            "received handshake"
        );

        let auth_response = self.scramble(&self.plugin)?;
        let mut buf = Vec::new();
        write_handshake_response(
            &mut buf,
            &HandshakeResponse {
                capabilities: self.capabilities,
                charset: charset_id(&self.opts.charset),
                user: &self.opts.user,
                auth_response: &auth_response,
                database: self.opts.database.as_deref(),
                auth_plugin: &self.plugin,
            },
        );
        self.state = State::WaitingAuthResult;
        Ok(HandshakeStep::Write(buf))
    }

    fn handle_auth_result(&mut self, payload: &[u8]) -> Result<HandshakeStep> {
        match payload.first() {
            Some(&header::OK) => {
                self.state = State::Finished;
                Ok(HandshakeStep::Finished)
            }
            Some(&header::ERR) => {
                self.state = State::Finished;
                Err(Error::Auth(ErrPacket::parse(payload)?.0.to_string()))
            }
            Some(&header::EOF) => {
                let switch = AuthSwitchRequest::parse(payload)?;
                tracing::trace!(plugin = %switch.plugin, "auth switch requested");
                self.plugin = switch.plugin;
                self.nonce = switch.auth_data;
                Ok(HandshakeStep::Write(self.scramble(&self.plugin)?))
            }
            Some(&header::AUTH_MORE_DATA) => {
                let AuthMoreData(data) = AuthMoreData::parse(payload)?;
                match data {
                    [FAST_AUTH_SUCCESS] => Ok(HandshakeStep::NeedPacket),
                    [PERFORM_FULL_AUTH] if self.secure_transport => {
                        let mut clear = self.password().as_bytes().to_vec();
                        clear.push(0);
                        Ok(HandshakeStep::Write(clear))
                    }
                    [PERFORM_FULL_AUTH] => Err(Error::Unsupported(
                        "caching_sha2_password full authentication requires TLS or RSA key exchange"
                            .into(),
                    )),
                    _ => Err(Error::Unsupported(
                        "caching_sha2_password RSA key exchange".into(),
                    )),
                }
            }
            _ => Err(Error::Protocol(format!(
                "unexpected packet during authentication: {:02X?}",
                payload.first()
            ))),
        }
    }

    fn password(&self) -> &str {
        self.opts.password.as_deref().unwrap_or("")
    }

    fn scramble(&self, plugin: &str) -> Result<Vec<u8>> {
        match plugin {
            NATIVE_PASSWORD => Ok(scramble_native(self.password(), &self.nonce)),
            CACHING_SHA2_PASSWORD => Ok(scramble_caching_sha2(self.password(), &self.nonce)),
            other => Err(Error::Auth(format!(
                "unsupported authentication plugin {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frontend::handshake::tests::encode_handshake;

    fn opts() -> Opts {
        Opts {
            user: "app".into(),
            password: Some("pw".into()),
            database: Some("shop".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_native_flow() {
        let opts = opts();
        let mut sm = HandshakeStateMachine::new(&opts, false);
        let nonce: Vec<u8> = (1..=20).collect();
        let greeting = encode_handshake("8.0.36", 7, &nonce, "mysql_native_password");
        let HandshakeStep::Write(response) = sm.step(&greeting).unwrap() else {
            panic!("expected handshake response");
        };
        assert!(sm.capabilities() & CLIENT_CONNECT_WITH_DB != 0);
        assert!(sm.capabilities() & CLIENT_COMPRESS == 0);
        assert!(response.windows(5).any(|w| w == b"shop\0"));
        assert_eq!(sm.connection_id(), 7);
        assert!(matches!(
            sm.step(&[0, 0, 0, 2, 0, 0, 0]).unwrap(),
            HandshakeStep::Finished
        ));
    }

    #[test]
    fn test_caching_sha2_fast_auth() {
        let opts = opts();
        let mut sm = HandshakeStateMachine::new(&opts, false);
        let nonce: Vec<u8> = (1..=20).collect();
        sm.step(&encode_handshake("8.0.36", 1, &nonce, "caching_sha2_password"))
            .unwrap();
        assert!(matches!(
            sm.step(&[0x01, FAST_AUTH_SUCCESS]).unwrap(),
            HandshakeStep::NeedPacket
        ));
        assert!(matches!(
            sm.step(&[0, 0, 0, 2, 0, 0, 0]).unwrap(),
            HandshakeStep::Finished
        ));
    }

    #[test]
    fn test_full_auth_needs_secure_transport() {
        let opts = opts();
        let nonce: Vec<u8> = (1..=20).collect();
        let greeting = encode_handshake("8.0.36", 1, &nonce, "caching_sha2_password");

        let mut sm = HandshakeStateMachine::new(&opts, false);
        sm.step(&greeting).unwrap();
        assert!(matches!(
            sm.step(&[0x01, PERFORM_FULL_AUTH]),
            Err(Error::Unsupported(_))
        ));

        let mut sm = HandshakeStateMachine::new(&opts, true);
        sm.step(&greeting).unwrap();
        let HandshakeStep::Write(clear) = sm.step(&[0x01, PERFORM_FULL_AUTH]).unwrap() else {
            panic!("expected clear-text password");
        };
        assert_eq!(clear, b"pw\0");
    }

    #[test]
    fn test_auth_switch_and_reject() {
        let opts = opts();
        let mut sm = HandshakeStateMachine::new(&opts, false);
        let nonce: Vec<u8> = (1..=20).collect();
        sm.step(&encode_handshake("5.7.44", 1, &nonce, "caching_sha2_password"))
            .unwrap();
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0abcdefghijklmnopqrst\0");
        let HandshakeStep::Write(scramble) = sm.step(&switch).unwrap() else {
            panic!("expected scramble");
        };
        assert_eq!(scramble, scramble_native("pw", b"abcdefghijklmnopqrst"));

        let mut denied = vec![0xFF, 0x15, 0x04, b'#'];
        denied.extend_from_slice(b"28000Access denied");
        assert!(matches!(sm.step(&denied), Err(Error::Auth(_))));
    }
}
