//! Prepared statements spread over a connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::params::{BindTarget, ParamLayout, Params, PreBound, parse_placeholders};
use crate::row::{Column, FromRow};
use crate::state::CommandOutcome;
use crate::value::Value;

use super::conn::Connection;
use super::pool::Pool;
use super::result::ResultStream;
use super::statement::PreparedStatement;

#[derive(Debug, Default)]
struct BindState {
    /// Every bind in call order, replayed onto per-connection copies.
    log: Vec<(BindTarget, Value)>,
    /// Local view of the binds, for validation before leasing.
    prebound: PreBound,
}

#[derive(Debug)]
struct PooledInner {
    pool: Pool,
    sql: String,
    layout: ParamLayout,
    binds: parking_lot::Mutex<BindState>,
    /// Per-connection copies, keyed by [`Connection::id`].
    copies: parking_lot::Mutex<HashMap<u64, PreparedStatement>>,
    closed: AtomicBool,
}

/// A prepared statement usable on any connection of a [`Pool`].
///
/// Each connection gets its own server-side copy, prepared on first use.
/// Pre-bound values live here and are replayed onto the copy before each
/// execution.
#[derive(Debug, Clone)]
pub struct PooledStatement {
    inner: Arc<PooledInner>,
}

impl PooledStatement {
    /// Prepare on one pooled connection so SQL errors surface immediately.
    pub(crate) async fn prepare(pool: Pool, sql: &str) -> Result<Self> {
        let (conn, stmt) = loop {
            let conn = pool.get().await?;
            match conn.prepare(sql).await {
                Ok(stmt) => break (conn, stmt),
                Err(e) if conn.should_retry(&e) => continue,
                Err(e) => return Err(e),
            }
        };
        let layout = ParamLayout::new(parse_placeholders(sql).slots);
        let layout = if layout.len() == stmt.param_count() {
            layout
        } else {
            ParamLayout::unnamed(stmt.param_count())
        };
        let mut copies = HashMap::new();
        copies.insert(conn.id(), stmt);
        Ok(Self {
            inner: Arc::new(PooledInner {
                pool,
                sql: sql.to_string(),
                layout,
                binds: parking_lot::Mutex::new(BindState::default()),
                copies: parking_lot::Mutex::new(copies),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    pub fn param_count(&self) -> usize {
        self.inner.layout.len()
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire) && !self.inner.pool.is_closed()
    }

    fn check_usable(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("statement"));
        }
        if self.inner.pool.is_closed() {
            return Err(Error::PoolClosed);
        }
        Ok(())
    }

    /// Pre-bind a value by slot index or `:name`. Applies to whichever
    /// connection runs the next execution.
    pub fn bind(&self, target: impl Into<BindTarget>, value: impl Into<Value>) -> Result<()> {
        self.check_usable()?;
        let target = target.into();
        let value = value.into();
        let mut binds = self.inner.binds.lock();
        let BindState { log, prebound } = &mut *binds;
        self.inner.layout.bind(prebound, &target, value.clone())?;
        log.push((target, value));
        Ok(())
    }

    /// Forget all pre-bound values.
    pub fn reset(&self) -> Result<()> {
        self.check_usable()?;
        let mut binds = self.inner.binds.lock();
        binds.log.clear();
        binds.prebound.clear();
        Ok(())
    }

    /// Copy of the statement on `conn`, prepared if missing or dead.
    async fn copy_for(&self, conn: &Connection) -> Result<PreparedStatement> {
        {
            let mut copies = self.inner.copies.lock();
            copies.retain(|_, stmt| stmt.is_alive());
            if let Some(stmt) = copies.get(&conn.id()) {
                return Ok(stmt.clone());
            }
        }
        let stmt = conn.prepare(&self.inner.sql).await?;
        self.inner.copies.lock().insert(conn.id(), stmt.clone());
        Ok(stmt)
    }

    /// Lease a connection, replay the pre-bound values onto its copy and
    /// execute. The connection returns to the pool with the stream.
    pub async fn execute(&self, params: impl Into<Params>) -> Result<ResultStream> {
        self.check_usable()?;
        let params = params.into();
        let log = {
            let binds = self.inner.binds.lock();
            self.inner.layout.resolve(&binds.prebound, &params)?;
            binds.log.clone()
        };

        loop {
            let conn = self.inner.pool.get().await?;
            match self.execute_on(&conn, &log, &params).await {
                Ok(mut stream) => {
                    stream.attach(conn);
                    return Ok(stream);
                }
                Err(e) if conn.should_retry(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_on(
        &self,
        conn: &Connection,
        log: &[(BindTarget, Value)],
        params: &Params,
    ) -> Result<ResultStream> {
        let stmt = self.copy_for(conn).await?;
        if !log.is_empty() || stmt.has_prebound() {
            stmt.reset().await?;
            for (target, value) in log {
                stmt.bind(target.clone(), value.clone())?;
            }
        }
        stmt.execute(params.clone()).await
    }

    /// Result column metadata, read from one connection's copy.
    pub async fn fields(&self) -> Result<Arc<[Column]>> {
        self.check_usable()?;
        let conn = self.inner.pool.get().await?;
        let stmt = self.copy_for(&conn).await?;
        Ok(stmt.fields())
    }

    /// Close every per-connection copy.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let copies: Vec<_> = self.inner.copies.lock().drain().map(|(_, s)| s).collect();
        for stmt in copies {
            if let Err(e) = stmt.close().await {
                tracing::debug!(statement_id = stmt.id(), error = %e, "failed to close statement");
            }
        }
        Ok(())
    }

    pub async fn exec_drop(&self, params: impl Into<Params>) -> Result<CommandOutcome> {
        self.execute(params).await?.drain().await
    }

    pub async fn exec_collect<T: FromRow>(&self, params: impl Into<Params>) -> Result<Vec<T>> {
        let mut stream = self.execute(params).await?;
        let rows = stream.collect().await?;
        stream.drain().await?;
        Ok(rows)
    }
}
