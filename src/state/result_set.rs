//! Command response state machine (COM_QUERY and COM_STMT_EXECUTE).
//!
//! A response is a sequence of result sets. Each one is either a bare OK
//! packet (non-tabular) or `column count → column definitions → [EOF] →
//! rows → EOF/OK`. The terminating status flags say whether another result
//! set follows (`SERVER_MORE_RESULTS_EXISTS`).

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::backend::{
    EofPacket, ErrPacket, OkPacket, header, is_eof_packet, parse_binary_row,
    parse_column_definition, parse_text_row,
};
use crate::protocol::codec::read_lenenc_int;
use crate::protocol::packet::MAX_PAYLOAD;
use crate::protocol::types::status::SERVER_MORE_RESULTS_EXISTS;
use crate::row::Column;
use crate::value::Value;

/// Outcome of a statement that completed without (or after) a result table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub status_flags: u16,
    pub info: String,
}

impl CommandOutcome {
    /// Another result set follows this one.
    pub fn has_more_results(&self) -> bool {
        self.status_flags & SERVER_MORE_RESULTS_EXISTS != 0
    }
}

impl From<OkPacket> for CommandOutcome {
    fn from(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            status_flags: ok.status_flags,
            info: ok.info,
        }
    }
}

/// Row encoding of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// COM_QUERY
    Text,
    /// COM_STMT_EXECUTE
    Binary,
}

/// What the caller should do after feeding a packet.
#[derive(Debug)]
pub enum Step {
    /// Read the next packet and call `step()` again.
    NeedPacket,
    /// Column metadata of the current result set is complete.
    Columns(Arc<[Column]>),
    /// One row of the current result set.
    Row(Vec<Value>),
    /// The current result set ended. If `outcome.has_more_results()`, keep
    /// reading; otherwise the response is complete.
    ResultSetDone(CommandOutcome),
    /// The server asks for a local file. Send its contents (or nothing)
    /// followed by an empty packet, then read the next packet.
    LocalInfile(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Header,
    ColumnDefinitions { remaining: usize },
    ColumnEof,
    Rows,
    Finished,
}

/// State machine over the packets of one command response.
#[derive(Debug)]
pub struct ResultSetStateMachine {
    state: State,
    format: RowFormat,
    deprecate_eof: bool,
    columns: Vec<Column>,
    current: Option<Arc<[Column]>>,
}

impl ResultSetStateMachine {
    pub fn new(format: RowFormat, deprecate_eof: bool) -> Self {
        Self {
            state: State::Header,
            format,
            deprecate_eof,
            columns: Vec::new(),
            current: None,
        }
    }

    /// The whole response (every result set) has been read.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Columns of the current result set, once known.
    pub fn columns(&self) -> Option<&Arc<[Column]>> {
        self.current.as_ref()
    }

    /// Feed one packet payload.
    ///
    /// A server ERR packet finishes the response and is returned as
    /// `Error::Server`; any other error means the stream is out of sync.
    pub fn step(&mut self, payload: &[u8]) -> Result<Step> {
        match self.state {
            State::Header => self.handle_header(payload),
            State::ColumnDefinitions { remaining } => {
                self.columns.push(parse_column_definition(payload)?);
                if remaining > 1 {
                    self.state = State::ColumnDefinitions {
                        remaining: remaining - 1,
                    };
                    return Ok(Step::NeedPacket);
                }
                if self.deprecate_eof {
                    Ok(self.columns_done())
                } else {
                    self.state = State::ColumnEof;
                    Ok(Step::NeedPacket)
                }
            }
            State::ColumnEof => {
                EofPacket::parse(payload)?;
                Ok(self.columns_done())
            }
            State::Rows => self.handle_row(payload),
            State::Finished => Err(Error::Protocol(
                "packet received after the response completed".into(),
            )),
        }
    }

    fn handle_header(&mut self, payload: &[u8]) -> Result<Step> {
        match payload.first() {
            None => Err(Error::Protocol("empty response packet".into())),
            Some(&header::OK) => {
                let outcome = CommandOutcome::from(OkPacket::parse(payload)?);
                Ok(self.result_set_done(outcome))
            }
            Some(&header::ERR) => {
                self.state = State::Finished;
                Err(ErrPacket::parse(payload)?.into_error())
            }
            Some(&header::LOCAL_INFILE) => {
                let filename = String::from_utf8_lossy(&payload[1..]).into_owned();
                Ok(Step::LocalInfile(filename))
            }
            Some(_) => {
                let (count, _) = read_lenenc_int(payload)?;
                if count == 0 {
                    return Err(Error::Protocol("column count of zero".into()));
                }
                let count = usize::try_from(count)
                    .map_err(|e| Error::Protocol(format!("column count overflow: {e}")))?;
                self.columns.clear();
                self.current = None;
                self.state = State::ColumnDefinitions { remaining: count };
                Ok(Step::NeedPacket)
            }
        }
    }

    fn columns_done(&mut self) -> Step {
        let columns: Arc<[Column]> = std::mem::take(&mut self.columns).into();
        self.current = Some(Arc::clone(&columns));
        self.state = State::Rows;
        Step::Columns(columns)
    }

    fn handle_row(&mut self, payload: &[u8]) -> Result<Step> {
        match payload.first() {
            Some(&header::ERR) => {
                self.state = State::Finished;
                Err(ErrPacket::parse(payload)?.into_error())
            }
            Some(&header::EOF) if self.is_row_terminator(payload) => {
                let outcome = if self.deprecate_eof {
                    CommandOutcome::from(OkPacket::parse(payload)?)
                } else {
                    let eof = EofPacket::parse(payload)?;
                    CommandOutcome {
                        warnings: eof.warnings.get(),
                        status_flags: eof.status_flags.get(),
                        ..Default::default()
                    }
                };
                Ok(self.result_set_done(outcome))
            }
            _ => {
                let Some(columns) = self.current.as_ref() else {
                    return Err(Error::Protocol("row before column metadata".into()));
                };
                let values = match self.format {
                    RowFormat::Text => parse_text_row(payload, columns)?,
                    RowFormat::Binary => parse_binary_row(payload, columns)?,
                };
                Ok(Step::Row(values))
            }
        }
    }

    fn is_row_terminator(&self, payload: &[u8]) -> bool {
        if self.deprecate_eof {
            payload.len() < MAX_PAYLOAD
        } else {
            is_eof_packet(payload)
        }
    }

    fn result_set_done(&mut self, outcome: CommandOutcome) -> Step {
        self.state = if outcome.has_more_results() {
            State::Header
        } else {
            State::Finished
        };
        Step::ResultSetDone(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::backend::result::tests::encode_column;
    use crate::protocol::types::ColumnType;

    fn ok(status: u16, affected: u8) -> Vec<u8> {
        let mut p = vec![0x00, affected, 0];
        p.extend_from_slice(&status.to_le_bytes());
        p.extend_from_slice(&[0, 0]);
        p
    }

    fn eof(status: u16) -> Vec<u8> {
        let mut p = vec![0xFE, 0, 0];
        p.extend_from_slice(&status.to_le_bytes());
        p
    }

    #[test]
    fn test_non_tabular() {
        let mut sm = ResultSetStateMachine::new(RowFormat::Text, true);
        match sm.step(&ok(0x0002, 3)).unwrap() {
            Step::ResultSetDone(outcome) => assert_eq!(outcome.affected_rows, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sm.is_finished());
    }

    #[test]
    fn test_text_result_with_eof() {
        let mut sm = ResultSetStateMachine::new(RowFormat::Text, false);
        assert!(matches!(sm.step(&[1]).unwrap(), Step::NeedPacket));
        assert!(matches!(
            sm.step(&encode_column("v", ColumnType::LongLong, 0)).unwrap(),
            Step::NeedPacket
        ));
        match sm.step(&eof(0)).unwrap() {
            Step::Columns(cols) => assert_eq!(cols[0].name, "v"),
            other => panic!("unexpected {other:?}"),
        }
        match sm.step(&[1, b'7']).unwrap() {
            Step::Row(values) => assert_eq!(values, vec![Value::Int(7)]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(sm.step(&eof(0)).unwrap(), Step::ResultSetDone(_)));
        assert!(sm.is_finished());
        assert!(sm.step(&eof(0)).is_err());
    }

    #[test]
    fn test_multiple_result_sets() {
        let mut sm = ResultSetStateMachine::new(RowFormat::Text, true);
        sm.step(&[1]).unwrap();
        assert!(matches!(
            sm.step(&encode_column("a", ColumnType::VarString, 0)).unwrap(),
            Step::Columns(_)
        ));
        let mut terminator = ok(SERVER_MORE_RESULTS_EXISTS, 0);
        terminator[0] = 0xFE;
        match sm.step(&terminator).unwrap() {
            Step::ResultSetDone(outcome) => assert!(outcome.has_more_results()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!sm.is_finished());
        assert!(sm.columns().is_some());
        assert!(matches!(sm.step(&ok(0, 1)).unwrap(), Step::ResultSetDone(_)));
        assert!(sm.is_finished());
    }

    #[test]
    fn test_server_error_finishes() {
        let mut sm = ResultSetStateMachine::new(RowFormat::Binary, true);
        let err = sm.step(&[0xFF, 0x28, 0x04, b'x']).unwrap_err();
        assert!(matches!(err, Error::Server(_)));
        assert!(sm.is_finished());
    }

    #[test]
    fn test_local_infile_request() {
        let mut sm = ResultSetStateMachine::new(RowFormat::Text, true);
        match sm.step(b"\xFB/tmp/data.csv").unwrap() {
            Step::LocalInfile(name) => assert_eq!(name, "/tmp/data.csv"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(sm.step(&ok(0, 2)).unwrap(), Step::ResultSetDone(_)));
    }
}
