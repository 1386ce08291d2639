//! In-process mock MySQL server for integration tests.
//!
//! Each connection gets a `tokio::io::duplex` pair. The server side speaks
//! just enough of the protocol for the client: a native-password handshake,
//! `SELECT <literal>` echo, OK for every other query, and prepare/execute
//! with `?` counting. A few canned queries misbehave on purpose:
//!
//! - `HANGUP` replies OK and then closes the socket.
//! - `BAD COLUMN` sends a truncated column definition.
//! - `MULTI` returns two result sets (`1`, then `'two'`).
//!
//! Every command is recorded.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use zero_mysql::Opts;
use zero_mysql::tokio::{ConnectFuture, Connector, Session, Stream};

const CAPABILITIES: u32 = 0x0100_0000 // DEPRECATE_EOF
    | 0x0020_0000 // PLUGIN_AUTH_LENENC_CLIENT_DATA
    | 0x0008_0000 // PLUGIN_AUTH
    | 0x0004_0000 // PS_MULTI_RESULTS
    | 0x0002_0000 // MULTI_RESULTS
    | 0x0001_0000 // MULTI_STATEMENTS
    | 0x8000 // SECURE_CONNECTION
    | 0x2000 // TRANSACTIONS
    | 0x0200 // PROTOCOL_41
    | 0x0008 // CONNECT_WITH_DB
    | 0x0004 // LONG_FLAG
    | 0x0002 // FOUND_ROWS
    | 0x0001; // LONG_PASSWORD

const TYPE_LONGLONG: u8 = 0x08;
const TYPE_VAR_STRING: u8 = 0xFD;

/// A parameter value as decoded by the mock server.
#[derive(Debug, Clone, PartialEq)]
pub enum MockValue {
    Null,
    Int(i64),
    Text(String),
}

/// A command received by the mock server.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Query(String),
    Prepare(String),
    Execute { id: u32, params: Vec<MockValue> },
    Reset(u32),
    Close(u32),
    Ping,
    InitDb(String),
    Quit,
}

#[derive(Debug, Default)]
struct State {
    /// (server connection id, command)
    commands: Vec<(u32, Command)>,
    connects: u32,
    open: usize,
    max_open: usize,
    bytes_received: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<State>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opts(&self) -> Opts {
        Opts {
            user: "test".into(),
            password: Some("secret".into()),
            pool_idle_timeout: None,
            ..Default::default()
        }
    }

    pub fn commands(&self) -> Vec<(u32, Command)> {
        self.state.lock().commands.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|(_, c)| match c {
                Command::Query(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    pub fn executions(&self) -> Vec<Vec<MockValue>> {
        self.commands()
            .into_iter()
            .filter_map(|(_, c)| match c {
                Command::Execute { params, .. } => Some(params),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    pub fn max_open_connections(&self) -> usize {
        self.state.lock().max_open
    }

    /// Bytes received in the command phase.
    pub fn bytes_received(&self) -> usize {
        self.state.lock().bytes_received
    }

    fn record(&self, conn_id: u32, command: Command) {
        self.state.lock().commands.push((conn_id, command));
    }
}

impl Connector for MockServer {
    fn connect<'a>(&'a self, opts: &'a Opts) -> ConnectFuture<'a> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let conn_id = {
                let mut state = self.state.lock();
                state.connects += 1;
                state.open += 1;
                state.max_open = state.max_open.max(state.open);
                state.connects
            };
            let mock = self.clone();
            tokio::spawn(async move {
                let mut server = server;
                let _ = mock.serve(&mut server, conn_id).await;
                mock.state.lock().open -= 1;
            });
            Session::establish(Stream::boxed(client), opts).await
        })
    }
}

async fn read_packet(io: &mut DuplexStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match io.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

struct Writer<'a> {
    io: &'a mut DuplexStream,
    seq: u8,
}

impl Writer<'_> {
    async fn send(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let len = payload.len() as u32;
        let mut packet = len.to_le_bytes()[..3].to_vec();
        packet.push(self.seq);
        packet.extend_from_slice(payload);
        self.seq = self.seq.wrapping_add(1);
        self.io.write_all(&packet).await
    }
}

fn lenenc_int(out: &mut Vec<u8>, v: u64) {
    if v < 251 {
        out.push(v as u8);
    } else if v < 1 << 16 {
        out.push(0xFC);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else {
        out.push(0xFE);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn lenenc_str(out: &mut Vec<u8>, s: &[u8]) {
    lenenc_int(out, s.len() as u64);
    out.extend_from_slice(s);
}

fn greeting(conn_id: u32) -> Vec<u8> {
    let nonce: Vec<u8> = (b'a'..=b't').collect();
    let mut out = vec![10];
    out.extend_from_slice(b"8.0.36-mock\0");
    out.extend_from_slice(&conn_id.to_le_bytes());
    out.extend_from_slice(&nonce[..8]);
    out.push(0);
    out.extend_from_slice(&(CAPABILITIES as u16).to_le_bytes());
    out.push(45);
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&((CAPABILITIES >> 16) as u16).to_le_bytes());
    out.push(21);
    out.extend_from_slice(&[0u8; 10]);
    out.extend_from_slice(&nonce[8..]);
    out.push(0);
    out.extend_from_slice(b"mysql_native_password\0");
    out
}

const STATUS_AUTOCOMMIT: u16 = 0x0002;
const STATUS_MORE_RESULTS: u16 = 0x0008;

fn ok_packet(header: u8) -> Vec<u8> {
    ok_with_status(header, STATUS_AUTOCOMMIT)
}

fn ok_with_status(header: u8, status: u16) -> Vec<u8> {
    let mut out = vec![header, 0, 0];
    out.extend_from_slice(&status.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

fn err_packet(code: u16, message: &str) -> Vec<u8> {
    let mut out = vec![0xFF];
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(b"#42000");
    out.extend_from_slice(message.as_bytes());
    out
}

fn column_def(name: &str, column_type: u8) -> Vec<u8> {
    let mut out = Vec::new();
    for part in ["def", "", "", "", name, name] {
        lenenc_str(&mut out, part.as_bytes());
    }
    out.push(0x0C);
    let charset: u16 = if column_type == TYPE_LONGLONG { 63 } else { 45 };
    out.extend_from_slice(&charset.to_le_bytes());
    out.extend_from_slice(&255u32.to_le_bytes());
    out.push(column_type);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.push(0);
    out.extend_from_slice(&[0, 0]);
    out
}

fn parse_params(body: &[u8], count: usize) -> Vec<MockValue> {
    // statement id (4) + flags (1) + iteration count (4)
    let mut data = &body[9.min(body.len())..];
    if count == 0 || data.is_empty() {
        return Vec::new();
    }
    let bitmap_len = count.div_ceil(8);
    let bitmap = data[..bitmap_len].to_vec();
    data = &data[bitmap_len + 1..];
    let types: Vec<u8> = data[..count * 2].chunks(2).map(|c| c[0]).collect();
    data = &data[count * 2..];

    let mut values = Vec::with_capacity(count);
    for (i, ty) in types.into_iter().enumerate() {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            values.push(MockValue::Null);
            continue;
        }
        match ty {
            TYPE_LONGLONG => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[..8]);
                values.push(MockValue::Int(i64::from_le_bytes(raw)));
                data = &data[8..];
            }
            _ => {
                let len = data[0] as usize;
                let text = String::from_utf8_lossy(&data[1..1 + len]).into_owned();
                values.push(MockValue::Text(text));
                data = &data[1 + len..];
            }
        }
    }
    values
}

impl MockServer {
    async fn serve(&self, io: &mut DuplexStream, conn_id: u32) -> std::io::Result<()> {
        Writer { io: &mut *io, seq: 0 }.send(&greeting(conn_id)).await?;
        if read_packet(io).await?.is_none() {
            return Ok(());
        }
        Writer { io: &mut *io, seq: 2 }.send(&ok_packet(0x00)).await?;

        let mut next_statement = 1u32;
        let mut statements: HashMap<u32, usize> = HashMap::new();

        while let Some(payload) = read_packet(io).await? {
            self.state.lock().bytes_received += payload.len() + 4;
            let Some((&command, body)) = payload.split_first() else {
                continue;
            };
            let mut w = Writer { io: &mut *io, seq: 1 };
            match command {
                0x01 => {
                    self.record(conn_id, Command::Quit);
                    return Ok(());
                }
                0x02 => {
                    self.record(conn_id, Command::InitDb(String::from_utf8_lossy(body).into()));
                    w.send(&ok_packet(0x00)).await?;
                }
                0x03 => {
                    let sql = String::from_utf8_lossy(body).into_owned();
                    self.record(conn_id, Command::Query(sql.clone()));
                    if sql == "HANGUP" {
                        w.send(&ok_packet(0x00)).await?;
                        return Ok(());
                    } else if sql == "BAD COLUMN" {
                        w.send(&[1]).await?;
                        // Catalog length says 3, only one byte follows
                        w.send(&[0x03, b'd']).await?;
                    } else if sql == "MULTI" {
                        for (text, status) in [
                            ("1", STATUS_AUTOCOMMIT | STATUS_MORE_RESULTS),
                            ("two", STATUS_AUTOCOMMIT),
                        ] {
                            let column_type = if text == "1" { TYPE_LONGLONG } else { TYPE_VAR_STRING };
                            w.send(&[1]).await?;
                            w.send(&column_def("v", column_type)).await?;
                            let mut row = Vec::new();
                            lenenc_str(&mut row, text.as_bytes());
                            w.send(&row).await?;
                            w.send(&ok_with_status(0xFE, status)).await?;
                        }
                    } else if let Some(literal) = sql.strip_prefix("SELECT ") {
                        let literal = literal.trim();
                        let (column_type, text) = match literal.parse::<i64>() {
                            Ok(_) => (TYPE_LONGLONG, literal.to_string()),
                            Err(_) => (TYPE_VAR_STRING, literal.trim_matches('\'').to_string()),
                        };
                        w.send(&[1]).await?;
                        w.send(&column_def("v", column_type)).await?;
                        let mut row = Vec::new();
                        lenenc_str(&mut row, text.as_bytes());
                        w.send(&row).await?;
                        w.send(&ok_packet(0xFE)).await?;
                    } else if sql.starts_with("FAIL") {
                        w.send(&err_packet(1064, "You have an error in your SQL syntax"))
                            .await?;
                    } else {
                        w.send(&ok_packet(0x00)).await?;
                    }
                }
                0x0E => {
                    self.record(conn_id, Command::Ping);
                    w.send(&ok_packet(0x00)).await?;
                }
                0x16 => {
                    let sql = String::from_utf8_lossy(body).into_owned();
                    self.record(conn_id, Command::Prepare(sql.clone()));
                    let params = sql.matches('?').count();
                    let id = next_statement;
                    next_statement += 1;
                    statements.insert(id, params);

                    let mut ok = vec![0x00];
                    ok.extend_from_slice(&id.to_le_bytes());
                    ok.extend_from_slice(&0u16.to_le_bytes());
                    ok.extend_from_slice(&(params as u16).to_le_bytes());
                    ok.push(0);
                    ok.extend_from_slice(&0u16.to_le_bytes());
                    w.send(&ok).await?;
                    for _ in 0..params {
                        w.send(&column_def("?", TYPE_VAR_STRING)).await?;
                    }
                }
                0x17 => {
                    let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    match statements.get(&id) {
                        Some(&count) => {
                            let params = parse_params(body, count);
                            self.record(conn_id, Command::Execute { id, params });
                            w.send(&ok_packet(0x00)).await?;
                        }
                        None => {
                            w.send(&err_packet(1243, "Unknown prepared statement handler"))
                                .await?;
                        }
                    }
                }
                0x19 => {
                    let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    statements.remove(&id);
                    self.record(conn_id, Command::Close(id));
                }
                0x1A => {
                    let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    self.record(conn_id, Command::Reset(id));
                    w.send(&ok_packet(0x00)).await?;
                }
                _ => {
                    w.send(&err_packet(1047, "Unknown command")).await?;
                }
            }
        }
        Ok(())
    }
}
