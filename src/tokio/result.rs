//! Lazily decoded command responses.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use crate::error::{Error, Result};
use crate::row::{Column, FromRow, Row};
use crate::state::{CommandOutcome, ResultSetStateMachine, RowFormat, Step};

use super::engine::{EngineIo, ProtocolEngine};

/// Size of each packet sent in reply to a LOCAL INFILE request.
const INFILE_CHUNK: usize = 64 * 1024;

/// A response whose packets have not all been read yet. Holds the engine's
/// command lock.
#[derive(Debug)]
struct ActiveResponse {
    engine: ProtocolEngine,
    io: OwnedMutexGuard<EngineIo>,
    machine: ResultSetStateMachine,
    infile_error: Option<Error>,
}

impl ActiveResponse {
    /// Read packets until the machine produces something other than
    /// `NeedPacket`. LOCAL INFILE requests are answered in place.
    async fn advance(&mut self) -> Result<Step> {
        loop {
            self.io.read().await?;
            match self.machine.step(&self.io.payload)? {
                Step::NeedPacket => {}
                Step::LocalInfile(path) => self.send_local_infile(&path).await?,
                step => return Ok(step),
            }
        }
    }

    async fn send_local_infile(&mut self, path: &str) -> Result<()> {
        if self.engine.local_infile() {
            match tokio::fs::read(path).await {
                Ok(data) => {
                    for chunk in data.chunks(INFILE_CHUNK) {
                        self.io.send(chunk).await?;
                    }
                }
                Err(e) => {
                    self.infile_error =
                        Some(Error::InvalidUsage(format!("LOCAL INFILE {path}: {e}")));
                }
            }
        } else {
            self.infile_error = Some(Error::InvalidUsage(format!(
                "server requested LOCAL INFILE {path} but local_infile is disabled"
            )));
        }
        self.io.send(&[]).await
    }

    /// Consume the rest of the response.
    async fn drain(&mut self) -> Result<()> {
        while !self.machine.is_finished() {
            self.advance().await?;
        }
        Ok(())
    }
}

/// Rows and outcomes of one query or execute call.
///
/// A response is a chain of result sets. [`next_row`](Self::next_row) walks
/// the rows of the current set; [`next_result_set`](Self::next_result_set)
/// moves to the next set. A set without columns is a non-tabular outcome
/// (see [`outcome`](Self::outcome)).
///
/// The connection serves no other command until the stream is fully read or
/// dropped. Dropping an unfinished stream drains it in the background.
#[derive(Debug)]
pub struct ResultStream {
    active: Option<ActiveResponse>,
    columns: Option<Arc<[Column]>>,
    outcome: Option<CommandOutcome>,
    set_done: bool,
    attachments: Vec<Box<dyn Any + Send>>,
}

impl ResultStream {
    /// Read the first result set header of a response whose command has
    /// already been written.
    pub(crate) async fn start(
        engine: ProtocolEngine,
        io: OwnedMutexGuard<EngineIo>,
        format: RowFormat,
        deprecate_eof: bool,
    ) -> Result<Self> {
        let mut stream = Self {
            active: Some(ActiveResponse {
                engine,
                io,
                machine: ResultSetStateMachine::new(format, deprecate_eof),
                infile_error: None,
            }),
            columns: None,
            outcome: None,
            set_done: false,
            attachments: Vec::new(),
        };
        stream.read_set_header().await?;
        Ok(stream)
    }

    /// Keep `item` alive until the response is complete.
    ///
    /// Used to tie leases, statement handles and reference guards to the
    /// lifetime of the response.
    pub(crate) fn attach(&mut self, item: impl Any + Send) {
        if self.active.is_some() {
            self.attachments.push(Box::new(item));
        }
    }

    /// Columns of the current result set; `None` for a non-tabular outcome.
    pub fn columns(&self) -> Option<&Arc<[Column]>> {
        self.columns.as_ref()
    }

    /// Outcome of the current result set, once it has been read to the end.
    pub fn outcome(&self) -> Option<&CommandOutcome> {
        self.outcome.as_ref()
    }

    /// Every packet of the response has been read.
    pub fn is_complete(&self) -> bool {
        self.active.is_none()
    }

    /// Next row of the current result set.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.set_done {
            return Ok(None);
        }
        let Some(columns) = self.columns.clone() else {
            return Ok(None);
        };
        match self.step().await? {
            Step::Row(values) => Ok(Some(Row::new(columns, values))),
            Step::ResultSetDone(outcome) => {
                self.end_set(outcome)?;
                Ok(None)
            }
            other => Err(self.unexpected(&other)),
        }
    }

    /// Skip what is left of the current set and move to the next one.
    /// Returns `false` when the response has no more result sets.
    pub async fn next_result_set(&mut self) -> Result<bool> {
        while self.next_row().await?.is_some() {}
        if self.active.is_none() {
            return Ok(false);
        }
        self.columns = None;
        self.outcome = None;
        self.set_done = false;
        self.read_set_header().await?;
        Ok(true)
    }

    /// Collect the rows of the current result set.
    pub async fn collect<T: FromRow>(&mut self) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row.decode()?);
        }
        Ok(rows)
    }

    /// First row of the current result set; the rest of the response is
    /// discarded.
    pub async fn first<T: FromRow>(&mut self) -> Result<Option<T>> {
        let first = match self.next_row().await? {
            Some(row) => Some(row.decode()?),
            None => None,
        };
        self.drain().await?;
        Ok(first)
    }

    /// Read the whole response and return the outcome of the last result
    /// set.
    pub async fn drain(&mut self) -> Result<CommandOutcome> {
        while self.next_result_set().await? {}
        Ok(self.outcome.clone().unwrap_or_default())
    }

    async fn read_set_header(&mut self) -> Result<()> {
        match self.step().await? {
            Step::Columns(columns) => {
                self.columns = Some(columns);
                Ok(())
            }
            Step::ResultSetDone(outcome) => self.end_set(outcome),
            other => Err(self.unexpected(&other)),
        }
    }

    async fn step(&mut self) -> Result<Step> {
        let Some(active) = self.active.as_mut() else {
            return Err(Error::Protocol("result stream already complete".into()));
        };
        match active.advance().await {
            Ok(step) => Ok(step),
            Err(e) => {
                let err = active.engine.check(e);
                self.release();
                Err(err)
            }
        }
    }

    fn end_set(&mut self, outcome: CommandOutcome) -> Result<()> {
        self.set_done = true;
        let more = outcome.has_more_results();
        self.outcome = Some(outcome);
        if more {
            return Ok(());
        }
        let infile_error = self.active.as_mut().and_then(|a| a.infile_error.take());
        if let Some(active) = &self.active {
            active.engine.touch();
        }
        self.release();
        match infile_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn unexpected(&mut self, step: &Step) -> Error {
        let err = Error::Protocol(format!("unexpected response step: {step:?}"));
        if let Some(active) = &self.active {
            active.engine.mark_dead(&err.to_string());
        }
        self.release();
        err
    }

    /// Give the command lock back, then drop attachments.
    fn release(&mut self) {
        self.active = None;
        self.attachments.clear();
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let attachments = std::mem::take(&mut self.attachments);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = active.drain().await {
                        tracing::debug!(error = %e, "error draining abandoned result stream");
                        active.engine.check(e);
                    }
                    drop(active);
                    drop(attachments);
                });
            }
            Err(_) => {
                let engine = active.engine.clone();
                drop(active);
                engine.mark_dead("result stream dropped outside a runtime");
                drop(attachments);
            }
        }
    }
}
