//! # State References
//!
//! Finds the state primitives an author's variable definitions call and turns
//! them into declarations: which names exist in which scope, their defaults,
//! and which names the engine may write.
//!
//! The scan works on the text itself rather than on evaluated values, so it
//! can run while the question is edited, before any engine is involved.

use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use super::scope::{Scope, StateSnapshot};
use crate::cas::{
    statement::STATE_PRIMITIVE_PREFIX,
    text::{matching_paren, remove_comments, split_top_level, MaskedText},
};

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StateScopeError {
    #[error("State can only be written in the instance and global scopes, not '{scope}' (variable {name})")]
    WriteScope { scope: String, name: String },
    #[error("Unknown state scope '{scope}' (variable {name})")]
    UnknownScope { scope: String, name: String },
    #[error("{function} called with {found} parameters ({parameters}), it takes {expected}")]
    WrongArgumentCount {
        function: String,
        parameters: String,
        found: usize,
        expected: usize,
    },
}

/// Result of scanning author text for state primitives.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateReferences {
    pub declarations: StateSnapshot,
    pub errors: Vec<StateScopeError>,
}

impl StateReferences {
    pub fn has_state_variables(&self) -> bool {
        self.declarations.has_values()
    }

    pub fn has_writable_state_variables(&self) -> bool {
        self.has_state_variables() && !self.declarations.writes.is_empty()
    }
}

/// A primitive call with its arguments. Scope and name arguments have their
/// string quotes removed, value arguments keep them.
struct PrimitiveCall {
    function: String,
    params: Vec<String>,
}

#[tracing::instrument(level = "debug", skip(text))]
pub fn scan_state_references(text: &str) -> StateReferences {
    let mut references = StateReferences::default();
    if !text.contains(STATE_PRIMITIVE_PREFIX) {
        return references;
    }

    let masked = MaskedText::new(text);
    let source = remove_comments(masked.masked());
    for call in primitive_calls(&source, &masked) {
        record_call(&mut references, call);
    }
    references
}

fn primitive_calls(source: &str, masked: &MaskedText) -> Vec<PrimitiveCall> {
    let mut calls = Vec::new();
    let mut from = 0;
    while let Some(found) = source[from..].find(STATE_PRIMITIVE_PREFIX) {
        let start = from + found;
        from = start + STATE_PRIMITIVE_PREFIX.len();

        let name_end = source[start..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .map(|offset| start + offset)
            .unwrap_or(source.len());
        let function = &source[start..name_end];
        let open = name_end + (source[name_end..].len() - source[name_end..].trim_start().len());
        let Some(close) = matching_paren(source, open) else {
            continue;
        };

        let inner = &source[open + 1..close];
        let raw_params = if inner.trim().is_empty() {
            Vec::new()
        } else {
            split_top_level(inner, ',')
        };
        let value_index = match function {
            "stack_state_declare" => Some(3),
            "stack_state_set" => Some(2),
            _ => None,
        };
        let params = raw_params
            .iter()
            .enumerate()
            .map(|(index, param)| masked.restore(param, Some(index) == value_index))
            .collect();
        calls.push(PrimitiveCall {
            function: function.to_string(),
            params,
        });
    }
    calls
}

fn expect_arity(references: &mut StateReferences, call: &PrimitiveCall, expected: usize) -> bool {
    if call.params.len() == expected {
        return true;
    }
    references.errors.push(StateScopeError::WrongArgumentCount {
        function: call.function.clone(),
        parameters: call.params.join(","),
        found: call.params.len(),
        expected,
    });
    false
}

fn parse_scope(references: &mut StateReferences, scope: &str, name: &str) -> Option<Scope> {
    match Scope::from_str(scope) {
        Ok(scope) => Some(scope),
        Err(_) => {
            references.errors.push(StateScopeError::UnknownScope {
                scope: scope.to_string(),
                name: name.to_string(),
            });
            None
        }
    }
}

fn record_write(references: &mut StateReferences, scope: &str, name: &str) -> bool {
    let writable = Scope::from_str(scope)
        .map(|scope| references.declarations.writes.insert(scope, name))
        .unwrap_or(false);
    if !writable {
        references.errors.push(StateScopeError::WriteScope {
            scope: scope.to_string(),
            name: name.to_string(),
        });
    }
    writable
}

fn record_call(references: &mut StateReferences, call: PrimitiveCall) {
    let params = &call.params;
    match call.function.as_str() {
        "stack_state_declare" => {
            if !expect_arity(references, &call, 4) {
                return;
            }
            let (access, scope, name, value) = (&params[0], &params[1], &params[2], &params[3]);
            if access.to_lowercase().contains('w') && !record_write(references, scope, name) {
                return;
            }
            if let Some(scope) = parse_scope(references, scope, name) {
                references.declarations.declare(scope, name.as_str(), value.as_str());
            }
        }
        "stack_state_get" => {
            if !expect_arity(references, &call, 2) {
                return;
            }
            if let Some(scope) = parse_scope(references, &params[0], &params[1]) {
                references.declarations.declare(scope, params[1].as_str(), "false");
            }
        }
        "stack_state_set" => {
            if !expect_arity(references, &call, 3) {
                return;
            }
            if record_write(references, &params[0], &params[1]) {
                if let Some(scope) = parse_scope(references, &params[0], &params[1]) {
                    references
                        .declarations
                        .declare(scope, params[1].as_str(), params[2].as_str());
                }
            }
        }
        "stack_state_increment_once" | "stack_state_decrement_once" => {
            if !expect_arity(references, &call, 1) {
                return;
            }
            let name = &params[0];
            let marker = if call.function == "stack_state_increment_once" {
                "[il]"
            } else {
                "[dl]"
            };
            let writes = &mut references.declarations.writes;
            writes.instance.insert(name.clone());
            writes.instance.insert(format!("{}:{}", marker, name));
            writes.global.insert(name.clone());
            references.declarations.declare(Scope::Global, name.as_str(), "0");
        }
        "stack_state_full_state" => {
            expect_arity(references, &call, 1);
        }
        _ => {}
    }
}
