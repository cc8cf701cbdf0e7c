use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    codec::{CasProtocolCodec, DecodedResponse, EngineErrorRecord, ProtocolError},
    connection::{CasConnection, ConnectionError},
    expression::Expression,
    options::CasOptions,
    statement::Statement,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cannot instantiate an invalid session: {}", .0.join("; "))]
    InvalidSession(Vec<String>),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// An ordered batch of statements evaluated in one engine round trip.
///
/// Order matters: a statement may read any key bound by an earlier one.
#[derive(Debug, Clone)]
pub struct EvaluationSession {
    id: Uuid,
    statements: Vec<Statement>,
    options: CasOptions,
    seed: i64,
    instantiated: bool,
    timed_out: bool,
    errors: Vec<EngineErrorRecord>,
    engine_version: Option<String>,
}

impl EvaluationSession {
    pub fn new(statements: Vec<Statement>, options: CasOptions, seed: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            statements,
            options,
            seed,
            instantiated: false,
            timed_out: false,
            errors: Vec::new(),
            engine_version: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn options(&self) -> &CasOptions {
        &self.options
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn is_instantiated(&self) -> bool {
        self.instantiated
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn engine_version(&self) -> Option<&str> {
        self.engine_version.as_deref()
    }

    /// Engine error records from the last round trip.
    pub fn errors(&self) -> &[EngineErrorRecord] {
        &self.errors
    }

    pub fn add_statement(&mut self, statement: Statement) {
        self.statements.push(statement);
        self.instantiated = false;
    }

    /// Appends every statement of `other`. The merged session needs a new
    /// round trip.
    pub fn merge_session(&mut self, other: &EvaluationSession) {
        self.statements.extend(other.statements.iter().cloned());
        self.instantiated = false;
    }

    /// True when no statement carries a local or engine error.
    pub fn is_valid(&self) -> bool {
        self.statements.iter().all(Statement::is_valid)
    }

    fn local_errors(&self) -> Vec<String> {
        self.statements
            .iter()
            .filter(|s| !s.is_locally_valid())
            .flat_map(|s| {
                s.errors()
                    .filter(|e| e.is_local())
                    .map(move |e| format!("{}: {}", s.context(), e))
            })
            .collect()
    }

    /// Sends the batch to the engine and writes the results back into the
    /// statements.
    ///
    /// Calling it again without adding statements does not contact the
    /// engine. A timed-out batch still counts as instantiated: every statement
    /// carries `TIMED_OUT` and no value.
    #[tracing::instrument(level = "debug", skip(self, connection), fields(session = %self.id, statements = self.statements.len()))]
    pub async fn instantiate(&mut self, connection: &dyn CasConnection) -> Result<(), SessionError> {
        if self.instantiated || self.statements.is_empty() {
            self.instantiated = true;
            return Ok(());
        }
        let local_errors = self.local_errors();
        if !local_errors.is_empty() {
            return Err(SessionError::InvalidSession(local_errors));
        }

        let command = CasProtocolCodec::encode(&self.statements, &self.options, self.seed);
        let decoded = match connection.execute(&command).await {
            Ok(raw) => CasProtocolCodec::decode(&raw)?,
            Err(ConnectionError::Timeout(after)) => {
                warn!("Engine timed out after {:?}", after);
                DecodedResponse::timed_out()
            }
            Err(e) => return Err(e.into()),
        };

        CasProtocolCodec::apply(&mut self.statements, &decoded);
        debug!(
            "Session instantiated with {} engine errors",
            decoded.errors.len()
        );
        self.timed_out = decoded.timed_out;
        self.engine_version = decoded.engine_version;
        self.errors = decoded.errors;
        self.instantiated = true;
        Ok(())
    }

    fn last_with_key(&self, key: &str) -> Option<&Statement> {
        if !self.instantiated {
            return None;
        }
        self.statements.iter().rev().find(|s| s.key() == Some(key))
    }

    /// Value bound to `key`. When several statements share a key the last
    /// one wins.
    pub fn get_value(&self, key: &str) -> Option<&Expression> {
        self.last_with_key(key).and_then(Statement::value)
    }

    pub fn get_value_text(&self, key: &str) -> Option<&str> {
        self.last_with_key(key).and_then(Statement::value_text)
    }

    pub fn get_display(&self, key: &str) -> Option<&str> {
        self.last_with_key(key).and_then(Statement::presentation)
    }

    pub fn get_statement(&self, key: &str) -> Option<&Statement> {
        self.last_with_key(key)
    }

    /// Result keys in declaration order, without duplicates.
    pub fn get_all_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for key in self.statements.iter().filter_map(Statement::key) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Drops `count` statements starting at `offset`. Out of range slices are
    /// clamped.
    pub fn prune_range(&mut self, count: usize, offset: usize) {
        let start = offset.min(self.statements.len());
        let end = offset.saturating_add(count).min(self.statements.len());
        self.statements.drain(start..end);
    }
}
