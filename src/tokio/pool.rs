//! Asynchronous connection pool.

use std::any::Any;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::params::Params;
use crate::protocol::IsolationLevel;
use crate::row::FromRow;
use crate::state::CommandOutcome;

use super::conn::Connection;
use super::connector::{Connector, TcpConnector};
use super::result::ResultStream;
use super::statement_pool::PooledStatement;
use super::transaction::Transaction;

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// One unit of the connection limit. Released when dropped.
#[derive(Debug)]
struct SlotPermit {
    permit: Option<OwnedSemaphorePermit>,
    pool: Weak<PoolInner>,
    extracted: bool,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        // Release before notifying so woken waiters can take the slot
        self.permit.take();
        if let Some(pool) = self.pool.upgrade() {
            if self.extracted {
                pool.extracted.fetch_sub(1, Ordering::AcqRel);
            } else {
                pool.live.fetch_sub(1, Ordering::AcqRel);
            }
            pool.notify.notify_waiters();
        }
    }
}

#[derive(Debug)]
struct PoolEntry {
    conn: Connection,
    permit: SlotPermit,
    idle_since: Instant,
}

struct PoolInner {
    opts: Opts,
    connector: Arc<dyn Connector>,
    idle: ArrayQueue<PoolEntry>,
    slots: Arc<Semaphore>,
    notify: Notify,
    live: AtomicUsize,
    extracted: AtomicUsize,
    closed: AtomicBool,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("address", &self.opts.address())
            .field("limit", &self.opts.pool_max_conn)
            .field("idle", &self.idle.len())
            .field("live", &self.live.load(Ordering::Relaxed))
            .field("extracted", &self.extracted.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolInner {
    fn is_expired(&self, entry: &PoolEntry) -> bool {
        self.opts
            .pool_idle_timeout
            .is_some_and(|timeout| entry.idle_since.elapsed() >= timeout)
    }

    /// Pop the oldest usable idle connection, discarding dead and expired
    /// ones on the way.
    fn take_idle(&self) -> Option<PoolEntry> {
        while let Some(entry) = self.idle.pop() {
            if !entry.conn.is_alive() {
                tracing::debug!(id = entry.conn.id(), "dropping dead connection");
                continue;
            }
            if self.is_expired(&entry) {
                tracing::debug!(id = entry.conn.id(), "closing idle-expired connection");
                retire(entry);
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// Close idle connections past the idle timeout.
    fn reap(&self) {
        for _ in 0..self.idle.len() {
            let Some(entry) = self.idle.pop() else {
                break;
            };
            if !entry.conn.is_alive() {
                continue;
            }
            if self.is_expired(&entry) {
                tracing::debug!(id = entry.conn.id(), "reaping idle connection");
                retire(entry);
                continue;
            }
            if let Err(entry) = self.idle.push(entry) {
                retire(entry);
            }
        }
    }

    fn check_in(&self, entry: PoolEntry) {
        if !entry.conn.is_alive() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            retire(entry);
            return;
        }
        if let Err(entry) = self.idle.push(entry) {
            retire(entry);
        }
        self.notify.notify_waiters();
    }
}

/// Close a connection in the background; its slot is released afterwards.
fn retire(entry: PoolEntry) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        entry.conn.engine().close();
        return;
    };
    handle.spawn(async move {
        if let Err(e) = entry.conn.close().await {
            tracing::debug!(id = entry.conn.id(), error = %e, "error closing pooled connection");
        }
        drop(entry);
    });
}

/// Whether a failed operation on a connection taken from the idle set can
/// run again elsewhere: the connection went away while idle and the failing
/// command never reached the server.
fn died_while_idle(conn: &Connection, reused: bool, err: &Error) -> bool {
    let stale = reused && err.is_connection_broken() && conn.engine().died_unsent();
    if stale {
        tracing::debug!(id = conn.id(), error = %err, "idle connection went away, retrying");
    }
    stale
}

/// A connection leased from the pool. Returned to the idle set on drop.
#[derive(Debug)]
pub struct PooledConn {
    conn: Connection,
    permit: Option<SlotPermit>,
    pool: Arc<PoolInner>,
    /// Taken from the idle set rather than freshly connected.
    reused: bool,
}

impl PooledConn {
    pub(crate) fn should_retry(&self, err: &Error) -> bool {
        died_while_idle(&self.conn, self.reused, err)
    }
}

impl Deref for PooledConn {
    type Target = Connection;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.pool.check_in(PoolEntry {
                conn: self.conn.clone(),
                permit,
                idle_since: Instant::now(),
            });
        }
    }
}

/// Pool of connections, created lazily up to `Opts::pool_max_conn`.
///
/// Operations lease an idle connection (or create one) and return it when
/// their result stream is fully read or dropped. Dead connections are
/// replaced transparently at selection time.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(opts: Opts) -> Result<Self> {
        Self::with_connector(opts, TcpConnector)
    }

    pub fn with_connector(opts: Opts, connector: impl Connector) -> Result<Self> {
        if opts.pool_max_conn == 0 {
            return Err(Error::InvalidUsage("pool_max_conn must be at least 1".into()));
        }
        let inner = Arc::new(PoolInner {
            idle: ArrayQueue::new(opts.pool_max_conn),
            slots: Arc::new(Semaphore::new(opts.pool_max_conn)),
            notify: Notify::new(),
            live: AtomicUsize::new(0),
            extracted: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            connector: Arc::new(connector),
            opts,
        });
        spawn_reaper(&inner);
        Ok(Self { inner })
    }

    pub fn connection_limit(&self) -> usize {
        self.inner.opts.pool_max_conn
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.len()
    }

    /// Connections owned by the pool (idle or leased).
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Connections handed out by [`extract_connection`](Self::extract_connection)
    /// and not yet closed.
    pub fn extracted_count(&self) -> usize {
        self.inner.extracted.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Lease a connection: an idle one, a new one if under the limit, or
    /// the next one to be returned.
    pub async fn get(&self) -> Result<PooledConn> {
        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();

            if let Some(entry) = self.inner.take_idle() {
                return Ok(PooledConn {
                    conn: entry.conn,
                    permit: Some(entry.permit),
                    pool: Arc::clone(&self.inner),
                    reused: true,
                });
            }
            if let Ok(permit) = Arc::clone(&self.inner.slots).try_acquire_owned() {
                return self.create(permit).await;
            }
            notified.await;
        }
    }

    async fn create(&self, permit: OwnedSemaphorePermit) -> Result<PooledConn> {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        let permit = SlotPermit {
            permit: Some(permit),
            pool: Arc::downgrade(&self.inner),
            extracted: false,
        };
        let conn = Connection::connect_with(&self.inner.opts, self.inner.connector.as_ref()).await?;
        tracing::debug!(
            id = conn.id(),
            live = self.live_count(),
            "created pooled connection"
        );
        Ok(PooledConn {
            conn,
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
            reused: false,
        })
    }

    /// Run a text query on a leased connection. An idle connection that
    /// turns out to be gone is replaced without surfacing its error.
    pub async fn query(&self, sql: &str) -> Result<ResultStream> {
        loop {
            let conn = self.get().await?;
            match conn.query(sql).await {
                Ok(mut stream) => {
                    stream.attach(conn);
                    return Ok(stream);
                }
                Err(e) if conn.should_retry(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn execute(&self, sql: &str, params: impl Into<Params>) -> Result<ResultStream> {
        let params = params.into();
        loop {
            let conn = self.get().await?;
            match conn.execute(sql, params.clone()).await {
                Ok(mut stream) => {
                    stream.attach(conn);
                    return Ok(stream);
                }
                Err(e) if conn.should_retry(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Prepare a statement that can run on any pooled connection.
    pub async fn prepare(&self, sql: &str) -> Result<PooledStatement> {
        PooledStatement::prepare(self.clone(), sql).await
    }

    /// Start a transaction. The connection stays leased until the
    /// transaction ends and everything derived from it is released.
    pub async fn begin_transaction(&self, isolation: IsolationLevel) -> Result<Transaction> {
        loop {
            let conn = self.get().await?;
            let target = conn.conn.clone();
            let reused = conn.reused;
            let lease: Box<dyn Any + Send> = Box::new(conn);
            match Transaction::begin(target.clone(), isolation, Some(lease)).await {
                Err(e) if died_while_idle(&target, reused, &e) => continue,
                result => return result,
            }
        }
    }

    /// Remove a connection from the pool for exclusive use.
    ///
    /// The connection keeps occupying one slot of the limit until it is
    /// closed.
    pub async fn extract_connection(&self) -> Result<Connection> {
        let mut leased = self.get().await?;
        let Some(mut permit) = leased.permit.take() else {
            return Err(Error::Protocol("leased connection without a slot".into()));
        };
        permit.extracted = true;
        self.inner.live.fetch_sub(1, Ordering::AcqRel);
        self.inner.extracted.fetch_add(1, Ordering::AcqRel);
        let conn = leased.conn.clone();
        conn.set_slot(Box::new(permit));
        tracing::debug!(id = conn.id(), "extracted connection from pool");
        Ok(conn)
    }

    /// Close every idle connection. Leased connections are closed when
    /// returned; later leases fail with [`Error::PoolClosed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        while let Some(entry) = self.inner.idle.pop() {
            if let Err(e) = entry.conn.close().await {
                tracing::debug!(id = entry.conn.id(), error = %e, "error closing pooled connection");
            }
        }
        self.inner.notify.notify_waiters();
    }

    pub async fn query_drop(&self, sql: &str) -> Result<CommandOutcome> {
        self.query(sql).await?.drain().await
    }

    pub async fn query_collect<T: FromRow>(&self, sql: &str) -> Result<Vec<T>> {
        let mut stream = self.query(sql).await?;
        let rows = stream.collect().await?;
        stream.drain().await?;
        Ok(rows)
    }

    pub async fn query_first<T: FromRow>(&self, sql: &str) -> Result<Option<T>> {
        self.query(sql).await?.first().await
    }

    pub async fn exec_drop(&self, sql: &str, params: impl Into<Params>) -> Result<CommandOutcome> {
        self.execute(sql, params).await?.drain().await
    }

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

/// Periodically close idle-expired connections. The task holds only a weak
/// reference and exits with the pool.
fn spawn_reaper(inner: &Arc<PoolInner>) {
    let Some(timeout) = inner.opts.pool_idle_timeout else {
        return;
    };
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let weak = Arc::downgrade(inner);
    let period = (timeout / 2).max(MIN_REAP_INTERVAL);
    handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(pool) = weak.upgrade() else {
                break;
            };
            if pool.closed.load(Ordering::Acquire) {
                break;
            }
            pool.reap();
        }
    });
}
