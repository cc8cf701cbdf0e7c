use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Instance row name marking a step whose writes are already committed.
pub const ACTIVE_STEP_MARKER: &str = "***active_step";

/// A named partition of state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Scope {
    Instance,
    Global,
    User,
    Structure,
    Prt,
}

impl Scope {
    /// Scopes whose values are sent to the engine as plain loads.
    pub const LOADABLE: [Scope; 4] = [Scope::Instance, Scope::Global, Scope::User, Scope::Structure];

    pub fn is_writable(self) -> bool {
        matches!(self, Scope::Instance | Scope::Global)
    }
}

/// Names declared writable, per writable scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteDeclarations {
    pub instance: BTreeSet<String>,
    pub global: BTreeSet<String>,
}

impl WriteDeclarations {
    pub fn is_empty(&self) -> bool {
        self.instance.is_empty() && self.global.is_empty()
    }

    /// Records a write. Returns false for scopes that cannot be written.
    pub fn insert(&mut self, scope: Scope, name: impl Into<String>) -> bool {
        match scope {
            Scope::Instance => self.instance.insert(name.into()),
            Scope::Global => self.global.insert(name.into()),
            _ => return false,
        };
        true
    }
}

/// Every state value visible to one request, one field per scope.
///
/// Values are engine source text: strings are kept as quoted literals so they
/// can be spliced into load statements unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub instance: BTreeMap<String, String>,
    pub global: BTreeMap<String, String>,
    pub user: BTreeMap<String, String>,
    pub structure: BTreeMap<String, String>,
    /// PRTs consuming their own input history.
    pub prt: BTreeMap<String, String>,
    pub writes: WriteDeclarations,
    /// Sequence number the values were last loaded for.
    pub lock: Option<i64>,
}

impl StateSnapshot {
    pub fn scope(&self, scope: Scope) -> &BTreeMap<String, String> {
        match scope {
            Scope::Instance => &self.instance,
            Scope::Global => &self.global,
            Scope::User => &self.user,
            Scope::Structure => &self.structure,
            Scope::Prt => &self.prt,
        }
    }

    pub fn scope_mut(&mut self, scope: Scope) -> &mut BTreeMap<String, String> {
        match scope {
            Scope::Instance => &mut self.instance,
            Scope::Global => &mut self.global,
            Scope::User => &mut self.user,
            Scope::Structure => &mut self.structure,
            Scope::Prt => &mut self.prt,
        }
    }

    /// Records a declared default unless the name is already known.
    pub fn declare(&mut self, scope: Scope, name: impl Into<String>, value: impl Into<String>) {
        self.scope_mut(scope)
            .entry(name.into())
            .or_insert_with(|| value.into());
    }

    /// True when any scope holds a value. Write declarations and the lock
    /// alone do not count.
    pub fn has_values(&self) -> bool {
        [Scope::Instance, Scope::Global, Scope::User, Scope::Structure, Scope::Prt]
            .into_iter()
            .any(|scope| !self.scope(scope).is_empty())
    }

    /// Loadable values in scope order.
    pub fn loadable_values(&self) -> impl Iterator<Item = (Scope, &str, &str)> {
        Scope::LOADABLE.into_iter().flat_map(move |scope| {
            self.scope(scope)
                .iter()
                .map(move |(name, value)| (scope, name.as_str(), value.as_str()))
        })
    }
}
