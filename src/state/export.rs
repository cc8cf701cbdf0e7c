use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use super::{scope::Scope, StateError};
use crate::cas::{
    statement::Statement,
    text::{split_list, split_top_level, MaskedText},
};

const EXPORT_FUNCTION: &str = "stackstatevar";

/// Result key of the state export statement.
pub const STATE_EXPORT_KEY: &str = "stackstateexport";

/// Asks the engine for its full state after everything before it ran. It has
/// to be the last statement of a session.
pub fn state_export_statement() -> Statement {
    Statement::generated("stack_state_full_state(false)", "state").with_key(STATE_EXPORT_KEY)
}

/// One `stackstatevar(scope, name, value, changed)` tuple from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedVariable {
    pub scope: Scope,
    pub name: String,
    /// Engine source text; string values keep their quotes.
    pub value: String,
    pub changed: bool,
}

/// Parses the printed state export of the engine.
///
/// Tuples for scopes this crate does not know are dropped with a warning.
pub fn parse_state_export(export: &str) -> Result<Vec<ExportedVariable>, StateError> {
    if !export.contains(EXPORT_FUNCTION) {
        return Ok(Vec::new());
    }

    let masked = MaskedText::new(export);
    let mut variables = Vec::new();
    for item in split_list(masked.masked()) {
        let inner = item
            .strip_prefix(EXPORT_FUNCTION)
            .map(str::trim_start)
            .and_then(|rest| rest.strip_prefix('('))
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| StateError::MalformedExport(masked.restore(&item, true)))?;

        let params = split_top_level(inner, ',');
        let [scope, name, value, changed] = params.as_slice() else {
            return Err(StateError::MalformedExport(masked.restore(&item, true)));
        };

        let scope_name = masked.restore(scope, false);
        let Ok(scope) = Scope::from_str(&scope_name) else {
            warn!("Dropping exported state in unknown scope {}", scope_name);
            continue;
        };
        variables.push(ExportedVariable {
            scope,
            name: masked.restore(name, false),
            value: masked.restore(value, true),
            changed: changed == "true",
        });
    }
    Ok(variables)
}
