//! COM_STMT_PREPARE response state machine.

use crate::error::{Error, Result};
use crate::protocol::backend::{EofPacket, ErrPacket, StmtPrepareOk, header, parse_column_definition};
use crate::row::Column;

/// Server-side description of a prepared statement.
#[derive(Debug, Clone)]
pub struct PreparedInfo {
    pub statement_id: u32,
    pub params: Vec<Column>,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Params { remaining: usize },
    ParamsEof,
    Columns { remaining: usize },
    ColumnsEof,
    Finished,
}

/// State machine over the packets of a COM_STMT_PREPARE response.
#[derive(Debug)]
pub struct PrepareStateMachine {
    state: State,
    deprecate_eof: bool,
    statement_id: u32,
    num_columns: usize,
    params: Vec<Column>,
    columns: Vec<Column>,
}

impl PrepareStateMachine {
    pub fn new(deprecate_eof: bool) -> Self {
        Self {
            state: State::Header,
            deprecate_eof,
            statement_id: 0,
            num_columns: 0,
            params: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Feed one packet. Returns the statement description once complete.
    pub fn step(&mut self, payload: &[u8]) -> Result<Option<PreparedInfo>> {
        match self.state {
            State::Header => {
                if payload.first() == Some(&header::ERR) {
                    self.state = State::Finished;
                    return Err(ErrPacket::parse(payload)?.into_error());
                }
                let ok = StmtPrepareOk::parse(payload)?;
                self.statement_id = ok.statement_id();
                self.num_columns = usize::from(ok.num_columns());
                let num_params = usize::from(ok.num_params());
                self.params.reserve(num_params);
                self.columns.reserve(self.num_columns);
                self.state = if num_params > 0 {
                    State::Params {
                        remaining: num_params,
                    }
                } else {
                    self.columns_state()
                };
            }
            State::Params { remaining } => {
                self.params.push(parse_column_definition(payload)?);
                self.state = if remaining > 1 {
                    State::Params {
                        remaining: remaining - 1,
                    }
                } else if self.deprecate_eof {
                    self.columns_state()
                } else {
                    State::ParamsEof
                };
            }
            State::ParamsEof => {
                EofPacket::parse(payload)?;
                self.state = self.columns_state();
            }
            State::Columns { remaining } => {
                self.columns.push(parse_column_definition(payload)?);
                self.state = if remaining > 1 {
                    State::Columns {
                        remaining: remaining - 1,
                    }
                } else if self.deprecate_eof {
                    State::Finished
                } else {
                    State::ColumnsEof
                };
            }
            State::ColumnsEof => {
                EofPacket::parse(payload)?;
                self.state = State::Finished;
            }
            State::Finished => {
                return Err(Error::Protocol(
                    "packet received after prepare completed".into(),
                ));
            }
        }

        if self.state != State::Finished {
            return Ok(None);
        }
        Ok(Some(PreparedInfo {
            statement_id: self.statement_id,
            params: std::mem::take(&mut self.params),
            columns: std::mem::take(&mut self.columns),
        }))
    }

    fn columns_state(&self) -> State {
        if self.num_columns > 0 {
            State::Columns {
                remaining: self.num_columns,
            }
        } else {
            State::Finished
        }
    }
}
