//! Asynchronous MySQL connection.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::params::Params;
use crate::protocol::IsolationLevel;
use crate::row::FromRow;
use crate::state::CommandOutcome;

use super::connector::{Connector, TcpConnector};
use super::engine::ProtocolEngine;
use super::result::ResultStream;
use super::statement::{PreparedStatement, StatementScope};
use super::transaction::Transaction;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waiter {
    Op,
    Exclusive,
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    waiters: VecDeque<(Waiter, oneshot::Sender<()>)>,
}

/// Per-connection exclusivity lock held by an active transaction.
///
/// Operations arriving while the gate is closed queue up and are released
/// in arrival order when it opens. A queued transaction takes the gate over
/// and stops the release at its position.
#[derive(Debug, Default)]
pub(crate) struct BusyGate {
    state: parking_lot::Mutex<GateState>,
}

/// A granted-but-unobserved exclusive wait reopens the gate when cancelled.
struct ExclusiveWait<'a> {
    gate: &'a BusyGate,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for ExclusiveWait<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.gate.open();
            }
        }
    }
}

impl BusyGate {
    /// Wait until no transaction holds the gate.
    pub(crate) async fn pass(&self) {
        let rx = {
            let mut state = self.state.lock();
            if !state.closed {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back((Waiter::Op, tx));
            rx
        };
        // A dropped sender means the gate itself is gone
        let _ = rx.await;
    }

    /// Wait for the gate and close it behind us.
    pub(crate) async fn close(&self) {
        let rx = {
            let mut state = self.state.lock();
            if !state.closed {
                state.closed = true;
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back((Waiter::Exclusive, tx));
            rx
        };
        let mut wait = ExclusiveWait {
            gate: self,
            rx: Some(rx),
        };
        if let Some(rx) = wait.rx.as_mut() {
            let _ = rx.await;
        }
        wait.rx = None;
    }

    /// Release queued operations up to the next queued transaction, which
    /// receives the gate.
    pub(crate) fn open(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        while let Some((kind, tx)) = state.waiters.pop_front() {
            match kind {
                Waiter::Op => {
                    let _ = tx.send(());
                }
                Waiter::Exclusive => {
                    if tx.send(()).is_ok() {
                        state.closed = true;
                        break;
                    }
                }
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[derive(Debug)]
struct ConnInner {
    id: u64,
    engine: ProtocolEngine,
    gate: BusyGate,
    /// Held for as long as the connection lives (the slot of an extracted
    /// pool connection).
    slot: parking_lot::Mutex<Option<Box<dyn Any + Send>>>,
}

/// Asynchronous MySQL connection.
///
/// Cloning yields another handle to the same connection. Commands from all
/// handles are serialized on the wire; while a [`Transaction`] begun on this
/// connection is active, other operations wait for it to finish.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Connect to a MySQL server.
    pub async fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        Self::connect_with(&opts, &TcpConnector).await
    }

    /// Connect through a custom [`Connector`].
    pub async fn connect_with(opts: &Opts, connector: &dyn Connector) -> Result<Self> {
        let session = connector.connect(opts).await?;
        let conn = Self::from_engine(ProtocolEngine::new(session, opts.local_infile));

        let default_charset =
            opts.charset.eq_ignore_ascii_case("utf8mb4") && opts.collation.is_none();
        if !default_charset {
            if let Err(e) = conn
                .inner
                .engine
                .set_charset(&opts.charset, opts.collation.as_deref())
                .await
            {
                conn.inner.engine.close();
                return Err(e);
            }
        }
        Ok(conn)
    }

    pub(crate) fn from_engine(engine: ProtocolEngine) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                engine,
                gate: BusyGate::default(),
                slot: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Process-unique id of this connection handle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Server-side connection (thread) id.
    pub fn connection_id(&self) -> u32 {
        self.inner.engine.connection_id()
    }

    pub fn server_version(&self) -> &str {
        self.inner.engine.server_version()
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.inner.engine
    }

    pub fn is_alive(&self) -> bool {
        self.inner.engine.is_alive()
    }

    /// Time of the last successful command.
    pub fn last_used_at(&self) -> Instant {
        self.inner.engine.last_activity()
    }

    /// A transaction currently holds this connection.
    pub fn in_transaction(&self) -> bool {
        self.inner.gate.is_closed()
    }

    pub(crate) fn gate(&self) -> &BusyGate {
        &self.inner.gate
    }

    pub(crate) fn set_slot(&self, slot: Box<dyn Any + Send>) {
        *self.inner.slot.lock() = Some(slot);
    }

    /// Execute a text query.
    pub async fn query(&self, sql: &str) -> Result<ResultStream> {
        self.inner.gate.pass().await;
        let guard = self.inner.engine.hold();
        let mut stream = self.inner.engine.query(sql).await?;
        stream.attach(guard);
        Ok(stream)
    }

    /// Prepare a statement. `:name` markers become named parameters.
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        self.inner.gate.pass().await;
        PreparedStatement::prepare(
            self.inner.engine.clone(),
            StatementScope::Connection(self.clone()),
            sql,
            None,
        )
        .await
    }

    /// Prepare, execute and close a statement.
    pub async fn execute(&self, sql: &str, params: impl Into<Params>) -> Result<ResultStream> {
        let params = params.into();
        let stmt = self.prepare(sql).await?;
        stmt.execute(params).await
    }

    /// Start a transaction. Other operations on this connection wait until
    /// it is committed or rolled back.
    pub async fn begin_transaction(&self, isolation: IsolationLevel) -> Result<Transaction> {
        Transaction::begin(self.clone(), isolation, None).await
    }

    /// COM_INIT_DB.
    pub async fn use_database(&self, database: &str) -> Result<()> {
        self.inner.gate.pass().await;
        self.inner.engine.use_database(database).await
    }

    /// `SET NAMES`.
    pub async fn set_charset(&self, charset: &str, collation: Option<&str>) -> Result<()> {
        self.inner.gate.pass().await;
        self.inner.engine.set_charset(charset, collation).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.inner.gate.pass().await;
        self.inner.engine.ping().await
    }

    /// COM_REFRESH with [`refresh`](crate::protocol::types::refresh) flags.
    pub async fn refresh(&self, flags: u8) -> Result<()> {
        self.inner.gate.pass().await;
        self.inner.engine.refresh(flags).await
    }

    /// Close the connection gracefully. No-op if it is already dead.
    pub async fn close(&self) -> Result<()> {
        let result = if self.is_alive() {
            self.inner.engine.send_graceful_close().await
        } else {
            Ok(())
        };
        self.inner.slot.lock().take();
        result
    }

    /// Execute a query and discard its rows.
    pub async fn query_drop(&self, sql: &str) -> Result<CommandOutcome> {
        self.query(sql).await?.drain().await
    }

    /// Execute a query and collect the rows of its first result set.
    pub async fn query_collect<T: FromRow>(&self, sql: &str) -> Result<Vec<T>> {
        let mut stream = self.query(sql).await?;
        let rows = stream.collect().await?;
        stream.drain().await?;
        Ok(rows)
    }

    /// Execute a query and return its first row.
    pub async fn query_first<T: FromRow>(&self, sql: &str) -> Result<Option<T>> {
        self.query(sql).await?.first().await
    }

    /// Execute a statement and discard its rows.
    pub async fn exec_drop(&self, sql: &str, params: impl Into<Params>) -> Result<CommandOutcome> {
        self.execute(sql, params).await?.drain().await
    }

    /// Execute a statement and collect the rows of its first result set.
    pub async fn exec_collect<T: FromRow>(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> Result<Vec<T>> {
        let mut stream = self.execute(sql, params).await?;
        let rows = stream.collect().await?;
        stream.drain().await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_open_passes_immediately() {
        let gate = BusyGate::default();
        tokio::time::timeout(Duration::from_millis(100), gate.pass())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_gate_releases_waiters_in_order() {
        let gate = Arc::new(BusyGate::default());
        gate.close().await;
        assert!(gate.is_closed());

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                gate.pass().await;
                order.lock().push(i);
            }));
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(order.lock().is_empty());

        gate.open();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(!gate.is_closed());
    }

    #[tokio::test]
    async fn test_gate_hands_over_to_queued_transaction() {
        let gate = Arc::new(BusyGate::default());
        gate.close().await;

        let g = Arc::clone(&gate);
        let second = tokio::spawn(async move { g.close().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let g = Arc::clone(&gate);
        let op = tokio::spawn(async move { g.pass().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        gate.open();
        second.await.unwrap();
        assert!(gate.is_closed());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!op.is_finished());

        gate.open();
        op.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_exclusive_wait_reopens_gate() {
        let gate = Arc::new(BusyGate::default());
        gate.close().await;
        let g = Arc::clone(&gate);
        let waiter = tokio::spawn(async move { g.close().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;
        gate.open();
        assert!(!gate.is_closed());
    }
}
