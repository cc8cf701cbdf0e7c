//! Named state variables: declaration scanning, the per-request snapshot and
//! its persistence.

pub mod export;
pub mod references;
pub mod repository;
pub mod scope;
pub mod store;

use thiserror::Error;

pub use export::{parse_state_export, state_export_statement, ExportedVariable, STATE_EXPORT_KEY};
pub use references::{scan_state_references, StateReferences, StateScopeError};
pub use repository::{
    AttemptContext, AttemptSnapshot, InMemoryAttemptSnapshot, InMemoryStateRepository,
    InMemoryUserDirectory, RepositoryError, StateRepository, StateVariableRecord, UserDirectory,
    UserProfile,
};
pub use scope::{Scope, StateSnapshot, WriteDeclarations, ACTIVE_STEP_MARKER};
pub use store::{LoadOutcome, StateScopeStore, StoreOutcome};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Malformed state export: {0}")]
    MalformedExport(String),
}
