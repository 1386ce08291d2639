//! Transactions over a [`Connection`].

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::params::Params;
use crate::protocol::IsolationLevel;
use crate::ref_queue::{RefGuard, ReferenceQueue};
use crate::row::FromRow;
use crate::state::CommandOutcome;

use super::conn::Connection;
use super::result::ResultStream;
use super::statement::{PreparedStatement, StatementScope};

/// Prefix of generated savepoint identifiers.
const SAVEPOINT_PREFIX: &str = "zm_sp_";

/// Savepoint identifier derived from a caller-supplied name.
///
/// The name never reaches the SQL text; the identifier is a fixed prefix
/// followed by the first 8 bytes of its SHA-256 in hex.
pub fn savepoint_name(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    format!("{SAVEPOINT_PREFIX}{:016x}", u64::from_be_bytes(head))
}

#[derive(Debug)]
struct TxShared {
    conn: Connection,
    isolation: IsolationLevel,
    active: Arc<AtomicBool>,
    refs: Arc<ReferenceQueue>,
    /// Reference held while the transaction is active.
    base: parking_lot::Mutex<Option<RefGuard>>,
}

impl Drop for TxShared {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                connection_id = self.conn.connection_id(),
                "transaction dropped while active, rolling back"
            );
            let op = self.refs.hold();
            let engine = self.conn.engine().clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let result = async { engine.query("ROLLBACK").await?.drain().await }.await;
                        if let Err(e) = result {
                            tracing::debug!(error = %e, "implicit rollback failed");
                        }
                        drop(op);
                    });
                }
                Err(_) => {
                    // Without a runtime the session state is unknown
                    engine.mark_dead("transaction dropped outside a runtime");
                    drop(op);
                }
            }
        }
        self.base.get_mut().take();
    }
}

/// An active database transaction.
///
/// The transaction holds its connection exclusively: other operations on the
/// same [`Connection`] wait until it is committed or rolled back and every
/// result stream and statement derived from it has been released. Dropping
/// the last handle of an active transaction rolls it back.
#[derive(Debug, Clone)]
pub struct Transaction {
    shared: Arc<TxShared>,
}

impl Transaction {
    /// Close the connection's gate, set the isolation level and start the
    /// transaction. `lease` is dropped once the transaction is over and
    /// released.
    pub(crate) async fn begin(
        conn: Connection,
        isolation: IsolationLevel,
        lease: Option<Box<dyn Any + Send>>,
    ) -> Result<Self> {
        conn.gate().close().await;

        let engine = conn.engine();
        let started = async {
            engine
                .query(&format!(
                    "SET SESSION TRANSACTION ISOLATION LEVEL {}",
                    isolation.as_sql()
                ))
                .await?
                .drain()
                .await?;
            engine.query("START TRANSACTION").await?.drain().await
        }
        .await;
        if let Err(e) = started {
            conn.gate().open();
            return Err(e);
        }
        tracing::trace!(
            connection_id = conn.connection_id(),
            isolation = isolation.as_sql(),
            "transaction started"
        );

        let refs = Arc::new(ReferenceQueue::new());
        let released = conn.clone();
        refs.on_release(move || {
            released.gate().open();
            drop(lease);
        });
        let base = refs.hold();

        Ok(Self {
            shared: Arc::new(TxShared {
                conn,
                isolation,
                active: Arc::new(AtomicBool::new(true)),
                refs,
                base: parking_lot::Mutex::new(Some(base)),
            }),
        })
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.shared.conn.is_alive()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.shared.isolation
    }

    /// The connection this transaction runs on.
    pub fn connection(&self) -> &Connection {
        &self.shared.conn
    }

    /// Reference held for the duration of one derived operation.
    fn enter(&self) -> Result<RefGuard> {
        if !self.is_active() {
            return Err(Error::TransactionClosed);
        }
        Ok(self.shared.refs.hold())
    }

    pub async fn query(&self, sql: &str) -> Result<ResultStream> {
        let op = self.enter()?;
        let mut stream = self.shared.conn.engine().query(sql).await?;
        stream.attach(op);
        Ok(stream)
    }

    /// Prepare a statement scoped to this transaction. It keeps the
    /// connection out of the pool until it is dropped.
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        let op = self.enter()?;
        PreparedStatement::prepare(
            self.shared.conn.engine().clone(),
            StatementScope::Transaction {
                active: Arc::clone(&self.shared.active),
                refs: Arc::clone(&self.shared.refs),
            },
            sql,
            Some(op),
        )
        .await
    }

    pub async fn execute(&self, sql: &str, params: impl Into<Params>) -> Result<ResultStream> {
        let params = params.into();
        let stmt = self.prepare(sql).await?;
        stmt.execute(params).await
    }

    pub async fn commit(&self) -> Result<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&self, sql: &str) -> Result<()> {
        if !self.shared.active.swap(false, Ordering::AcqRel) {
            return Err(Error::TransactionClosed);
        }
        let _op = self.shared.refs.hold();
        self.shared.base.lock().take();
        self.shared.conn.engine().query(sql).await?.drain().await?;
        Ok(())
    }

    /// `SAVEPOINT`.
    pub async fn create_savepoint(&self, id: &str) -> Result<()> {
        self.savepoint_command("SAVEPOINT", id).await
    }

    /// `ROLLBACK TO SAVEPOINT`.
    pub async fn rollback_to(&self, id: &str) -> Result<()> {
        self.savepoint_command("ROLLBACK TO SAVEPOINT", id).await
    }

    /// `RELEASE SAVEPOINT`.
    pub async fn release_savepoint(&self, id: &str) -> Result<()> {
        self.savepoint_command("RELEASE SAVEPOINT", id).await
    }

    async fn savepoint_command(&self, command: &str, id: &str) -> Result<()> {
        let sql = format!("{command} {}", savepoint_name(id));
        self.query(&sql).await?.drain().await?;
        Ok(())
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
