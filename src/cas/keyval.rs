//! # Author Key/Value Text
//!
//! Question variables are written by authors as a block of engine
//! assignments, separated by semicolons or newlines:
//!
//! ```text
//! a: rand(5)+1;   /* first coefficient */
//! p: a*x^2
//! stack_state_declare("rw", "instance", "count", 0)
//! ```
//!
//! [`KeyVal`] splits such a block into validated [`Statement`]s.

use thiserror::Error;

use super::{
    options::CasOptions,
    session::EvaluationSession,
    statement::{SecurityLevel, Statement},
    text::{remove_comments, MaskedText},
};
use crate::state::references::{scan_state_references, StateReferences};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyValError {
    #[error("The characters @ and $ are not allowed outside strings")]
    IllegalCharacters,
    #[error("{context}: {message}")]
    Statement { context: String, message: String },
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    raw: String,
    context: String,
    statements: Vec<Statement>,
    errors: Vec<KeyValError>,
}

impl KeyVal {
    pub fn new(raw: impl Into<String>, context: impl Into<String>, security: SecurityLevel) -> Self {
        let raw = raw.into();
        let context = context.into();
        let mut keyval = Self {
            raw,
            context,
            statements: Vec::new(),
            errors: Vec::new(),
        };
        keyval.parse(security);
        keyval
    }

    fn parse(&mut self, security: SecurityLevel) {
        if self.raw.trim().is_empty() {
            return;
        }

        let masked = MaskedText::new(&self.raw);
        if masked.masked().contains(['@', '$']) {
            self.errors.push(KeyValError::IllegalCharacters);
            return;
        }

        let without_comments = remove_comments(masked.masked());
        for (index, item) in without_comments
            .split([';', '\n'])
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .enumerate()
        {
            let source = masked.restore(item, true);
            let statement = Statement::new(source, format!("{}/{}", self.context, index), security);
            for error in statement.errors() {
                self.errors.push(KeyValError::Statement {
                    context: statement.context().to_string(),
                    message: error.to_string(),
                });
            }
            self.statements.push(statement);
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[KeyValError] {
        &self.errors
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// A fresh session holding these statements.
    pub fn session(&self, options: &CasOptions, seed: i64) -> EvaluationSession {
        EvaluationSession::new(self.statements.clone(), options.clone(), seed)
    }

    /// State primitives referenced by this text.
    pub fn state_references(&self) -> StateReferences {
        scan_state_references(&self.raw)
    }
}
