//! Server-side prepared statements.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::params::{BindTarget, ParamLayout, Params, PreBound, parse_placeholders};
use crate::ref_queue::{RefGuard, ReferenceQueue};
use crate::row::{Column, FromRow};
use crate::state::CommandOutcome;
use crate::value::Value;

use super::conn::Connection;
use super::engine::ProtocolEngine;
use super::result::ResultStream;

/// Where a statement was prepared, which decides how its operations wait.
#[derive(Debug)]
pub(crate) enum StatementScope {
    /// Operations pass the connection's busy-gate.
    Connection(Connection),
    /// Operations require the transaction to be active and hold a reference
    /// on it while they run.
    Transaction {
        active: Arc<AtomicBool>,
        refs: Arc<ReferenceQueue>,
    },
}

#[derive(Debug)]
struct StatementInner {
    engine: ProtocolEngine,
    scope: StatementScope,
    statement_id: u32,
    sql: String,
    layout: ParamLayout,
    params: Arc<[Column]>,
    columns: Arc<[Column]>,
    prebound: parking_lot::Mutex<PreBound>,
    closed: AtomicBool,
    _engine_ref: RefGuard,
    _scope_ref: Option<RefGuard>,
}

impl Drop for StatementInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) || !self.engine.is_alive() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let engine = self.engine.clone();
        let statement_id = self.statement_id;
        handle.spawn(async move {
            if let Err(e) = engine.close_statement(statement_id).await {
                tracing::debug!(statement_id, error = %e, "failed to close statement");
            }
        });
    }
}

/// A prepared statement bound to one connection.
///
/// Cloning yields another handle; the server-side statement is closed in the
/// background once the last handle (including those held by unfinished
/// result streams) is dropped.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    inner: Arc<StatementInner>,
}

impl PreparedStatement {
    /// `scope_ref` is held for the statement's whole lifetime.
    pub(crate) async fn prepare(
        engine: ProtocolEngine,
        scope: StatementScope,
        sql: &str,
        scope_ref: Option<RefGuard>,
    ) -> Result<Self> {
        let parsed = parse_placeholders(sql);
        let info = engine.prepare(&parsed.sql).await?;

        let layout = if parsed.slots.len() == info.params.len() {
            ParamLayout::new(parsed.slots)
        } else if parsed.slots.iter().all(Option::is_none) {
            ParamLayout::unnamed(info.params.len())
        } else {
            if let Err(e) = engine.close_statement(info.statement_id).await {
                tracing::debug!(error = %e, "failed to close statement");
            }
            return Err(Error::InvalidUsage(format!(
                "statement has {} placeholders but the server reports {} parameters",
                parsed.slots.len(),
                info.params.len()
            )));
        };

        let engine_ref = engine.hold();
        Ok(Self {
            inner: Arc::new(StatementInner {
                statement_id: info.statement_id,
                sql: sql.to_string(),
                layout,
                params: info.params.into(),
                columns: info.columns.into(),
                prebound: parking_lot::Mutex::new(PreBound::default()),
                closed: AtomicBool::new(false),
                _engine_ref: engine_ref,
                _scope_ref: scope_ref,
                engine,
                scope,
            }),
        })
    }

    /// Server-assigned statement id.
    pub fn id(&self) -> u32 {
        self.inner.statement_id
    }

    /// SQL text as given to `prepare`.
    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Number of parameter slots.
    pub fn param_count(&self) -> usize {
        self.inner.layout.len()
    }

    /// Parameter metadata reported by the server.
    pub fn params(&self) -> &[Column] {
        &self.inner.params
    }

    /// Result column metadata.
    pub fn fields(&self) -> Arc<[Column]> {
        Arc::clone(&self.inner.columns)
    }

    pub fn has_prebound(&self) -> bool {
        !self.inner.prebound.lock().is_empty()
    }

    /// Not closed, and the connection is alive.
    pub fn is_alive(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && self.inner.engine.is_alive()
            && self.inner.engine.is_statement_open(self.inner.statement_id)
    }

    fn check_usable(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("statement"));
        }
        if !self.inner.engine.is_alive() {
            return Err(Error::ConnectionUnavailable);
        }
        Ok(())
    }

    async fn enter(&self) -> Result<Option<RefGuard>> {
        self.check_usable()?;
        match &self.inner.scope {
            StatementScope::Connection(conn) => {
                conn.gate().pass().await;
                Ok(None)
            }
            StatementScope::Transaction { active, refs } => {
                if !active.load(Ordering::Acquire) {
                    return Err(Error::TransactionClosed);
                }
                Ok(Some(refs.hold()))
            }
        }
    }

    /// Pre-bind a value by zero-based slot index or `:name`.
    ///
    /// Binding the same target again appends to the bound value. A name that
    /// occurs several times in the SQL text binds every occurrence.
    pub fn bind(&self, target: impl Into<BindTarget>, value: impl Into<Value>) -> Result<()> {
        self.check_usable()?;
        let target = target.into();
        let mut prebound = self.inner.prebound.lock();
        self.inner.layout.bind(&mut prebound, &target, value.into())
    }

    /// Execute with `params`, falling back to pre-bound values for omitted
    /// slots.
    pub async fn execute(&self, params: impl Into<Params>) -> Result<ResultStream> {
        let params = params.into();
        let op = self.enter().await?;
        let prebound = self.inner.prebound.lock().clone();
        let mut stream = self
            .inner
            .engine
            .execute(self.inner.statement_id, &self.inner.layout, &prebound, &params)
            .await?;
        stream.attach(self.clone());
        if let Some(op) = op {
            stream.attach(op);
        }
        Ok(stream)
    }

    /// COM_STMT_RESET and clear pre-bound values.
    pub async fn reset(&self) -> Result<()> {
        let _op = self.enter().await?;
        self.inner
            .engine
            .reset_statement(self.inner.statement_id)
            .await?;
        self.inner.prebound.lock().clear();
        Ok(())
    }

    /// Close the server-side statement. Later operations fail with
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner
            .engine
            .close_statement(self.inner.statement_id)
            .await
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

    pub async fn exec_first<T: FromRow>(&self, params: impl Into<Params>) -> Result<Option<T>> {
        self.execute(params).await?.first().await
    }
}
