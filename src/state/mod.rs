//! Sans-I/O state machines for the MySQL protocol.
//!
//! These state machines handle the protocol logic without performing any I/O.
//! The caller feeds them packet payloads and acts on the step they return.

pub mod handshake;
pub mod prepare;
pub mod result_set;

pub use handshake::{HandshakeStateMachine, HandshakeStep};
pub use prepare::{PrepareStateMachine, PreparedInfo};
pub use result_set::{CommandOutcome, ResultSetStateMachine, RowFormat, Step};
