//! # Statements
//!
//! A [`Statement`] is one unit of work for the computation engine: an
//! expression, the author context it came from, an optional result key and the
//! security level it was validated under. Statements are validated locally when
//! they are created; the protocol codec is the only thing that writes results
//! back into them.

use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

use super::expression::{parse_expression, BinaryOp, Expression};

/// Engine functions no author or student text may call.
const DANGEROUS_FUNCTIONS: &[&str] = &[
    "system",
    "eval_string",
    "parse_string",
    "load",
    "loadfile",
    "batch",
    "batchload",
    "writefile",
    "save",
    "stringout",
    "opena",
    "openw",
    "openr",
    "run_testsuite",
    "to_lisp",
    "compile_file",
    "translate_file",
    "kill",
    "remvalue",
    "setup_autoload",
    "with_stdout",
];

/// Prefix shared by every state primitive.
pub const STATE_PRIMITIVE_PREFIX: &str = "stack_state_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Student,
    Teacher,
}

/// Problem attached to a single statement.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum ErrorKind {
    #[error("Syntax error: {0}")]
    Syntax(String),
    #[error("Forbidden: {0}")]
    Security(String),
    #[error("{0}")]
    Engine(String),
    #[error("TIMED_OUT")]
    TimedOut,
    #[error("Engine value for '{key}' could not be parsed: {value}")]
    UnparseableValue { key: String, value: String },
}

impl ErrorKind {
    /// Errors raised before the statement ever reached the engine.
    pub fn is_local(&self) -> bool {
        matches!(self, ErrorKind::Syntax(_) | ErrorKind::Security(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    source: String,
    context: String,
    key: Option<String>,
    security: SecurityLevel,
    wants_presentation: bool,
    evaluation_form: String,
    trusted: bool,
    local_errors: Vec<ErrorKind>,
    engine_errors: Vec<ErrorKind>,
    value: Option<Expression>,
    value_text: Option<String>,
    presentation: Option<String>,
    evaluated: bool,
}

impl Statement {
    /// Parses and validates `source`. A top-level `name: value` assignment
    /// makes `name` the result key.
    pub fn new(
        source: impl Into<String>,
        context: impl Into<String>,
        security: SecurityLevel,
    ) -> Self {
        let source = source.into().trim().to_string();
        let mut statement = Self::blank(source, context.into(), security, false);

        match parse_expression(&statement.source) {
            Ok(expression) => {
                statement.key = expression.assigned_name().map(str::to_string);
                statement.local_errors = security_violations(&expression, security);
            }
            Err(e) => statement.local_errors.push(ErrorKind::Syntax(e.to_string())),
        }
        statement
    }

    /// A statement generated by this crate rather than typed by a person.
    /// Generated statements skip parsing and security checks.
    pub fn generated(source: impl Into<String>, context: impl Into<String>) -> Self {
        Self::blank(source.into(), context.into(), SecurityLevel::Teacher, true)
    }

    fn blank(source: String, context: String, security: SecurityLevel, trusted: bool) -> Self {
        Self {
            evaluation_form: source.clone(),
            source,
            context,
            key: None,
            security,
            wants_presentation: false,
            trusted,
            local_errors: Vec::new(),
            engine_errors: Vec::new(),
            value: None,
            value_text: None,
            presentation: None,
            evaluated: false,
        }
    }

    /// Binds the statement's value to `key`.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        let already_assigned = !self.trusted
            && parse_expression(&self.source)
                .ok()
                .and_then(|e| e.assigned_name().map(|name| name == key))
                .unwrap_or(false);
        self.evaluation_form = if already_assigned {
            self.source.clone()
        } else {
            format!("{}:({})", key, self.source)
        };
        self.key = Some(key);
        self
    }

    /// Requests the typeset form of the value as well.
    pub fn with_presentation(mut self) -> Self {
        self.wants_presentation = true;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn security(&self) -> SecurityLevel {
        self.security
    }

    pub fn wants_presentation(&self) -> bool {
        self.wants_presentation && self.key.is_some()
    }

    pub fn evaluation_form(&self) -> &str {
        &self.evaluation_form
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// True when the statement passed local validation.
    pub fn is_locally_valid(&self) -> bool {
        self.local_errors.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.local_errors.is_empty() && self.engine_errors.is_empty()
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorKind> {
        self.local_errors.iter().chain(self.engine_errors.iter())
    }

    pub fn value(&self) -> Option<&Expression> {
        self.value.as_ref()
    }

    /// The value exactly as the engine printed it.
    pub fn value_text(&self) -> Option<&str> {
        self.value_text.as_deref()
    }

    pub fn presentation(&self) -> Option<&str> {
        self.presentation.as_deref()
    }

    /// Replaces every result of a previous execution.
    pub(crate) fn apply_outcome(
        &mut self,
        errors: Vec<ErrorKind>,
        value_text: Option<String>,
        value: Option<Expression>,
        presentation: Option<String>,
    ) {
        self.engine_errors = errors;
        self.value_text = value_text;
        self.value = value;
        self.presentation = presentation;
        self.evaluated = true;
    }

    pub(crate) fn invalidate(&mut self) {
        self.apply_outcome(Vec::new(), None, None, None);
        self.evaluated = false;
    }
}

fn security_violations(expression: &Expression, security: SecurityLevel) -> Vec<ErrorKind> {
    let mut errors = Vec::new();
    expression.walk(&mut |node| {
        let name = match node {
            Expression::Call { name, .. } | Expression::Symbol(name) => Some(name.as_str()),
            _ => None,
        };
        if let Some(name) = name {
            if DANGEROUS_FUNCTIONS.contains(&name) {
                errors.push(ErrorKind::Security(format!("the function {} is not allowed", name)));
            } else if security == SecurityLevel::Student && name.starts_with(STATE_PRIMITIVE_PREFIX) {
                errors.push(ErrorKind::Security(format!("{} is reserved for question authors", name)));
            }
        }
        if security == SecurityLevel::Student {
            match node {
                Expression::Binary {
                    op: BinaryOp::Assign,
                    ..
                } => errors.push(ErrorKind::Security("assignment is not allowed".to_string())),
                Expression::Binary {
                    op: BinaryOp::Define,
                    ..
                } => errors.push(ErrorKind::Security(
                    "function definitions are not allowed".to_string(),
                )),
                _ => {}
            }
        }
    });
    errors.dedup();
    errors
}
