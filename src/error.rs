use thiserror::Error;

use crate::cas::{ConnectionError, KeyValError, ProtocolError, SessionError};
use crate::prt::PrtError;
use crate::question::QuestionError;
use crate::state::{RepositoryError, StateError, StateScopeError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Key/value error: {0}")]
    KeyVal(#[from] KeyValError),
    // state
    #[error("State error: {0}")]
    State(#[from] StateError),
    #[error("State scope error: {0}")]
    StateScope(#[from] StateScopeError),
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("PRT error: {0}")]
    Prt(#[from] PrtError),
    #[error("Question error: {0}")]
    Question(#[from] QuestionError),

    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
