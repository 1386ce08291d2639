//! Per-connection protocol engine.
//!
//! The engine owns the packet stream. A command holds the I/O lock from the
//! moment its first byte is written until its whole response has been read,
//! so commands on one connection are strictly serialized.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::params::{ParamLayout, Params, PreBound};
use crate::protocol::backend::{ErrPacket, OkPacket, header};
use crate::protocol::frontend::{
    write_init_db, write_ping, write_query, write_quit, write_refresh, write_stmt_close,
    write_stmt_execute, write_stmt_prepare, write_stmt_reset,
};
use crate::ref_queue::{RefGuard, ReferenceQueue};
use crate::state::{PrepareStateMachine, PreparedInfo, RowFormat};

use super::connector::Session;
use super::framed::PacketIo;
use super::result::ResultStream;

/// I/O half of the engine, guarded by the command lock.
#[derive(Debug)]
pub(crate) struct EngineIo {
    packets: Option<PacketIo>,
    pub(crate) payload: Vec<u8>,
}

impl EngineIo {
    fn packets(&mut self) -> Result<&mut PacketIo> {
        self.packets.as_mut().ok_or(Error::ConnectionUnavailable)
    }

    /// Write a new command payload (sequence ids restart).
    pub(crate) async fn send_command(&mut self, write: impl FnOnce(&mut Vec<u8>)) -> Result<()> {
        let mut buf = std::mem::take(&mut self.payload);
        buf.clear();
        write(&mut buf);
        let result = async {
            let packets = self.packets()?;
            packets.reset_seq();
            packets.write_payload(&buf).await
        }
        .await;
        self.payload = buf;
        result
    }

    /// Write a continuation payload within the current command.
    pub(crate) async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.packets()?.write_payload(payload).await
    }

    /// Read the next packet into `self.payload`.
    pub(crate) async fn read(&mut self) -> Result<()> {
        let packets = self.packets.as_mut().ok_or(Error::ConnectionUnavailable)?;
        packets.read_packet(&mut self.payload).await
    }

    async fn read_ok(&mut self) -> Result<OkPacket> {
        self.read().await?;
        match self.payload.first() {
            Some(&header::ERR) => Err(ErrPacket::parse(&self.payload)?.into_error()),
            _ => OkPacket::parse(&self.payload),
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut packets) = self.packets.take() {
            if let Err(e) = packets.shutdown().await {
                tracing::debug!(error = %e, "error shutting down stream");
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    io: Arc<Mutex<EngineIo>>,
    alive: AtomicBool,
    /// Died on a command write, before the server saw the command.
    died_unsent: AtomicBool,
    poison: parking_lot::Mutex<Option<String>>,
    last_activity: parking_lot::Mutex<Instant>,
    refs: Arc<ReferenceQueue>,
    statements: parking_lot::Mutex<HashSet<u32>>,
    capabilities: u32,
    deprecate_eof: bool,
    server_version: String,
    connection_id: u32,
    local_infile: bool,
}

/// Speaks the wire protocol over one authenticated session.
///
/// Cloning yields another handle to the same session.
#[derive(Debug, Clone)]
pub struct ProtocolEngine {
    shared: Arc<Shared>,
}

impl ProtocolEngine {
    pub fn new(session: Session, local_infile: bool) -> Self {
        let deprecate_eof = session.deprecate_eof();
        Self {
            shared: Arc::new(Shared {
                io: Arc::new(Mutex::new(EngineIo {
                    packets: Some(session.io),
                    payload: Vec::new(),
                })),
                alive: AtomicBool::new(true),
                died_unsent: AtomicBool::new(false),
                poison: parking_lot::Mutex::new(None),
                last_activity: parking_lot::Mutex::new(Instant::now()),
                refs: Arc::new(ReferenceQueue::new()),
                statements: parking_lot::Mutex::new(HashSet::new()),
                capabilities: session.capabilities,
                deprecate_eof,
                server_version: session.server_version,
                connection_id: session.connection_id,
                local_infile,
            }),
        }
    }

    pub fn server_version(&self) -> &str {
        &self.shared.server_version
    }

    /// Server-side connection (thread) id.
    pub fn connection_id(&self) -> u32 {
        self.shared.connection_id
    }

    pub fn capabilities(&self) -> u32 {
        self.shared.capabilities
    }

    pub(crate) fn local_infile(&self) -> bool {
        self.shared.local_infile
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Alive and no command in flight.
    pub fn is_ready(&self) -> bool {
        self.is_alive() && self.shared.io.try_lock().is_ok()
    }

    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock()
    }

    pub(crate) fn touch(&self) {
        *self.shared.last_activity.lock() = Instant::now();
    }

    pub fn reference(&self) {
        self.shared.refs.reference();
    }

    pub fn unreference(&self) {
        self.shared.refs.unreference();
    }

    /// Scoped reference on the engine.
    pub fn hold(&self) -> RefGuard {
        self.shared.refs.hold()
    }

    pub fn ref_count(&self) -> usize {
        self.shared.refs.count()
    }

    /// Statement ids currently open on the server.
    pub fn open_statements(&self) -> Vec<u32> {
        self.shared.statements.lock().iter().copied().collect()
    }

    pub(crate) fn is_statement_open(&self, statement_id: u32) -> bool {
        self.shared.statements.lock().contains(&statement_id)
    }

    /// Mark the engine dead after a connectivity or protocol failure.
    pub(crate) fn mark_dead(&self, reason: &str) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                connection_id = self.shared.connection_id,
                reason,
                "connection marked dead"
            );
            *self.shared.poison.lock() = Some(reason.to_string());
            self.schedule_teardown();
        }
    }

    /// Mark dead if the error leaves the stream unusable, then pass it on.
    pub(crate) fn check(&self, err: Error) -> Error {
        if err.is_connection_broken() {
            self.mark_dead(&err.to_string());
        }
        err
    }

    /// The engine died while writing a command, so the server never ran the
    /// command that failed.
    pub(crate) fn died_unsent(&self) -> bool {
        self.shared.died_unsent.load(Ordering::Acquire)
    }

    /// Write a command; a broken write is recorded as unsent before the
    /// engine is marked dead.
    async fn send(&self, io: &mut EngineIo, write: impl FnOnce(&mut Vec<u8>)) -> Result<()> {
        io.send_command(write).await.map_err(|e| {
            if e.is_connection_broken() && self.is_alive() {
                self.shared.died_unsent.store(true, Ordering::Release);
            }
            self.check(e)
        })
    }

    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => {
                self.touch();
                Ok(v)
            }
            Err(e) => Err(self.check(e)),
        }
    }

    fn unavailable(&self) -> Error {
        match self.shared.poison.lock().as_ref() {
            Some(reason) => Error::Protocol(format!("connection failed earlier: {reason}")),
            None => Error::ConnectionUnavailable,
        }
    }

    /// Wait for the command lock.
    pub(crate) async fn acquire(&self) -> Result<OwnedMutexGuard<EngineIo>> {
        if !self.is_alive() {
            return Err(self.unavailable());
        }
        let guard = Arc::clone(&self.shared.io).lock_owned().await;
        // The engine may have died while we waited
        if !self.is_alive() {
            return Err(self.unavailable());
        }
        Ok(guard)
    }

    /// COM_QUERY.
    pub async fn query(&self, sql: &str) -> Result<ResultStream> {
        tracing::trace!(connection_id = self.shared.connection_id, sql, "query");
        let mut io = self.acquire().await?;
        self.send(&mut io, |buf| write_query(buf, sql)).await?;
        ResultStream::start(self.clone(), io, RowFormat::Text, self.shared.deprecate_eof).await
    }

    /// COM_STMT_PREPARE. The statement id is recorded as open.
    pub async fn prepare(&self, sql: &str) -> Result<PreparedInfo> {
        tracing::trace!(connection_id = self.shared.connection_id, sql, "prepare");
        let mut io = self.acquire().await?;
        let result = async {
            self.send(&mut io, |buf| write_stmt_prepare(buf, sql)).await?;
            let mut machine = PrepareStateMachine::new(self.shared.deprecate_eof);
            loop {
                io.read().await?;
                if let Some(info) = machine.step(&io.payload)? {
                    return Ok(info);
                }
            }
        }
        .await;
        let info = self.finish(result)?;
        self.shared.statements.lock().insert(info.statement_id);
        Ok(info)
    }

    /// COM_STMT_EXECUTE.
    ///
    /// Parameters are resolved before the command lock is taken; a missing
    /// or invalid parameter never reaches the wire.
    pub async fn execute(
        &self,
        statement_id: u32,
        layout: &ParamLayout,
        prebound: &PreBound,
        params: &Params,
    ) -> Result<ResultStream> {
        let values = layout.resolve(prebound, params)?;
        if !self.is_statement_open(statement_id) {
            return Err(Error::Closed("statement"));
        }
        tracing::trace!(
            connection_id = self.shared.connection_id,
            statement_id,
            params = values.len(),
            "execute"
        );
        let mut io = self.acquire().await?;
        self.send(&mut io, |buf| write_stmt_execute(buf, statement_id, &values))
            .await?;
        ResultStream::start(self.clone(), io, RowFormat::Binary, self.shared.deprecate_eof).await
    }

    /// COM_STMT_RESET.
    pub async fn reset_statement(&self, statement_id: u32) -> Result<()> {
        if !self.is_statement_open(statement_id) {
            return Err(Error::Closed("statement"));
        }
        let mut io = self.acquire().await?;
        let result = async {
            self.send(&mut io, |buf| write_stmt_reset(buf, statement_id)).await?;
            io.read_ok().await.map(|_| ())
        }
        .await;
        self.finish(result)
    }

    /// COM_STMT_CLOSE. Closing an unknown or already closed id is a no-op,
    /// as is closing on a dead connection.
    pub async fn close_statement(&self, statement_id: u32) -> Result<()> {
        if !self.shared.statements.lock().remove(&statement_id) || !self.is_alive() {
            return Ok(());
        }
        tracing::trace!(connection_id = self.shared.connection_id, statement_id, "close statement");
        let mut io = self.acquire().await?;
        self.send(&mut io, |buf| write_stmt_close(buf, statement_id))
            .await?;
        self.touch();
        Ok(())
    }

    /// COM_INIT_DB.
    pub async fn use_database(&self, database: &str) -> Result<()> {
        let mut io = self.acquire().await?;
        let result = async {
            self.send(&mut io, |buf| write_init_db(buf, database)).await?;
            io.read_ok().await.map(|_| ())
        }
        .await;
        self.finish(result)
    }

    /// `SET NAMES charset [COLLATE collation]`.
    pub async fn set_charset(&self, charset: &str, collation: Option<&str>) -> Result<()> {
        let valid = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_');
        if !valid(charset) || !collation.is_none_or(valid) {
            return Err(Error::InvalidUsage(format!(
                "invalid charset/collation: {charset} {collation:?}"
            )));
        }
        let sql = match collation {
            Some(collation) => format!("SET NAMES {charset} COLLATE {collation}"),
            None => format!("SET NAMES {charset}"),
        };
        self.query(&sql).await?.drain().await.map(|_| ())
    }

    /// COM_PING.
    pub async fn ping(&self) -> Result<()> {
        let mut io = self.acquire().await?;
        let result = async {
            self.send(&mut io, write_ping).await?;
            io.read_ok().await.map(|_| ())
        }
        .await;
        self.finish(result)
    }

    /// COM_REFRESH.
    pub async fn refresh(&self, flags: u8) -> Result<()> {
        let mut io = self.acquire().await?;
        let result = async {
            self.send(&mut io, |buf| write_refresh(buf, flags)).await?;
            io.read_ok().await.map(|_| ())
        }
        .await;
        self.finish(result)
    }

    /// Send COM_QUIT after any in-flight command, then close the stream.
    pub async fn send_graceful_close(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let mut io = self.acquire().await?;
        self.shared.alive.store(false, Ordering::Release);
        self.shared.statements.lock().clear();
        let result = io.send_command(write_quit).await;
        io.teardown().await;
        tracing::debug!(connection_id = self.shared.connection_id, "connection closed");
        result
    }

    /// Hard close. The stream is released once no derived object references
    /// the engine any more.
    pub fn close(&self) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            self.shared.statements.lock().clear();
            self.schedule_teardown();
        }
    }

    fn schedule_teardown(&self) {
        let io = Arc::clone(&self.shared.io);
        let teardown = move || {
            if let Ok(mut guard) = Arc::clone(&io).try_lock_owned() {
                // Dropping the stream closes the socket
                guard.packets = None;
            } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    io.lock().await.teardown().await;
                });
            }
        };
        self.shared.refs.on_idle(teardown);
    }
}
