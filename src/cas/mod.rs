//! Everything that talks to the computation engine: statements, the wire
//! codec, the connection and the sessions built on top of them.

pub mod codec;
pub mod connection;
pub mod expression;
pub mod keyval;
pub mod options;
pub mod session;
pub mod statement;
pub mod text;

pub use codec::{CasProtocolCodec, DecodedResponse, EngineErrorRecord, ProtocolError};
pub use connection::{CasConnection, ConnectionError, ProcessConnection};
pub use expression::{parse_expression, Expression, ExpressionError, LoopClause};
pub use keyval::{KeyVal, KeyValError};
pub use options::CasOptions;
pub use session::{EvaluationSession, SessionError};
pub use statement::{ErrorKind, SecurityLevel, Statement};
