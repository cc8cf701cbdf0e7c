//! # State Scope Store
//!
//! Resolves, loads and persists the state variables of one attempt.
//!
//! The store moves between two kinds of state: nothing loaded yet, and values
//! loaded for some sequence number (the *lock*). Loading follows these rules:
//!
//! - The first load records the lock.
//! - Loading an earlier number than the lock forgets every derived value and
//!   rebuilds from the declarations, as if nothing had been loaded.
//! - Loading the locked number again does nothing, so state changes made by
//!   one PRT stay visible to the next one within a request.
//! - Loading a later number overlays stored values on what is already known
//!   and moves the lock forward.
//!
//! Values are overlaid in a fixed order: the attempt snapshot, global rows,
//! instance rows up to the sequence number (ascending, so later writes win),
//! then the computed `user` and `structure` scopes.

use std::{
    collections::BTreeSet,
    sync::{Arc, OnceLock},
};

use tracing::{debug, info, warn};

use super::{
    export::parse_state_export,
    references::{scan_state_references, StateReferences, StateScopeError},
    repository::{
        AttemptContext, AttemptSnapshot, StateRepository, StateVariableRecord, UserDirectory,
        UserProfile,
    },
    scope::{Scope, StateSnapshot, ACTIVE_STEP_MARKER},
    StateError,
};
use crate::{
    cas::{statement::Statement, text::to_engine_string},
    config::StateConfig,
    prt::QuestionStructure,
    sequence::SequenceState,
};

/// What a call to [`StateScopeStore::load`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The author declared no state.
    NoState,
    /// The requested number was already loaded.
    Unchanged,
    Loaded,
}

/// What a call to [`StateScopeStore::store`] persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    pub global_writes: usize,
    pub instance_writes: usize,
    /// The displayed question text no longer matches the state.
    pub render_required: bool,
}

const USER_FIELDS: [&str; 5] = ["id", "username", "firstname", "lastname", "idnumber"];

pub struct StateScopeStore {
    definitions: String,
    references: OnceLock<StateReferences>,
    snapshot: Option<StateSnapshot>,
    repository: Arc<dyn StateRepository>,
    attempt_snapshot: Arc<dyn AttemptSnapshot>,
    users: Arc<dyn UserDirectory>,
    attempt: AttemptContext,
    snapshot_prefix: String,
    offset: i64,
}

impl StateScopeStore {
    pub fn new(
        definitions: impl Into<String>,
        repository: Arc<dyn StateRepository>,
        attempt_snapshot: Arc<dyn AttemptSnapshot>,
        users: Arc<dyn UserDirectory>,
        attempt: AttemptContext,
        config: &StateConfig,
    ) -> Self {
        Self {
            definitions: definitions.into(),
            references: OnceLock::new(),
            snapshot: None,
            repository,
            attempt_snapshot,
            users,
            attempt,
            snapshot_prefix: config.snapshot_prefix.clone(),
            offset: 0,
        }
    }

    fn references(&self) -> &StateReferences {
        self.references
            .get_or_init(|| scan_state_references(&self.definitions))
    }

    pub fn has_state_variables(&self) -> bool {
        self.references().has_state_variables()
    }

    pub fn has_writable_state_variables(&self) -> bool {
        self.references().has_writable_state_variables()
    }

    pub fn declaration_errors(&self) -> &[StateScopeError] {
        &self.references().errors
    }

    /// Declared names and defaults, before anything is loaded.
    pub fn declarations(&self) -> &StateSnapshot {
        &self.references().declarations
    }

    pub fn snapshot(&self) -> Option<&StateSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn attempt(&self) -> &AttemptContext {
        &self.attempt
    }

    /// Removes the current snapshot, leaving the store unloaded.
    pub fn take_snapshot(&mut self) -> Option<StateSnapshot> {
        self.snapshot.take()
    }

    pub fn restore_snapshot(&mut self, snapshot: Option<StateSnapshot>) {
        self.snapshot = snapshot;
    }

    /// Shifts the upper bound used for instance rows. Review views use `1` to
    /// show the state a step ended in rather than the one it started from.
    pub fn set_state_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    pub fn state_offset(&self) -> i64 {
        self.offset
    }

    /// Loads state for `sequence`.
    ///
    /// The new snapshot is built aside and only replaces the current one once
    /// every read succeeded.
    #[tracing::instrument(level = "debug", skip(self, structure), fields(attempt = self.attempt.attempt_id))]
    pub async fn load(
        &mut self,
        sequence: i64,
        structure: &mut QuestionStructure,
    ) -> Result<LoadOutcome, StateError> {
        if !self.has_state_variables() {
            return Ok(LoadOutcome::NoState);
        }

        let lock = self.snapshot.as_ref().and_then(|snapshot| snapshot.lock);
        let mut snapshot = match (self.snapshot.as_ref(), lock) {
            (Some(_), Some(lock)) if sequence == lock => {
                debug!("State already loaded for {}", sequence);
                return Ok(LoadOutcome::Unchanged);
            }
            (Some(_), Some(lock)) if sequence < lock => {
                debug!("Loading {} behind lock {}, rebuilding state", sequence, lock);
                self.declarations().clone()
            }
            (Some(current), _) => current.clone(),
            (None, _) => self.declarations().clone(),
        };
        snapshot.lock = Some(sequence);

        let bag = self
            .attempt_snapshot
            .get_all(self.attempt.attempt_id)
            .await?;
        for (key, value) in bag {
            if let Some(name) = key.strip_prefix(&self.snapshot_prefix) {
                snapshot.instance.insert(name.to_string(), value);
            }
        }

        if !snapshot.global.is_empty() {
            let names: Vec<String> = snapshot.global.keys().cloned().collect();
            for row in self
                .repository
                .select_global(self.attempt.owner_id, &names)
                .await?
            {
                snapshot.global.insert(row.name, row.value);
            }
            for (name, value) in &snapshot.global {
                snapshot
                    .instance
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        if sequence > 0 {
            for row in self
                .repository
                .select_instance(
                    self.attempt.owner_id,
                    self.attempt.attempt_id,
                    sequence.saturating_add(self.offset),
                )
                .await?
            {
                snapshot.instance.insert(row.name, row.value);
            }
        }

        if !snapshot.user.is_empty() {
            let profile = self.profile().await?;
            for field in USER_FIELDS {
                if let Some(slot) = snapshot.user.get_mut(field) {
                    *slot = match field {
                        "id" => profile.id.to_string(),
                        "username" => to_engine_string(&profile.username),
                        "firstname" => to_engine_string(&profile.firstname),
                        "lastname" => to_engine_string(&profile.lastname),
                        _ => to_engine_string(&profile.idnumber),
                    };
                }
            }
        }

        inject_structure(&mut snapshot, structure);

        self.snapshot = Some(snapshot);
        Ok(LoadOutcome::Loaded)
    }

    async fn profile(&self) -> Result<UserProfile, StateError> {
        if !self.attempt.is_review() {
            return Ok(self.attempt.active_user.clone());
        }
        match self.users.profile(self.attempt.owner_id).await? {
            Some(profile) => Ok(profile),
            None => {
                warn!(
                    "No profile for attempt owner {}, using the active user",
                    self.attempt.owner_id
                );
                Ok(self.attempt.active_user.clone())
            }
        }
    }

    /// Statements that recreate the current state inside the engine.
    pub fn generate_load_commands(&self, structure: &QuestionStructure) -> Vec<Statement> {
        if !self.has_state_variables() {
            return Vec::new();
        }
        let snapshot = self.snapshot.as_ref().unwrap_or_else(|| self.declarations());

        let mut commands: Vec<Statement> = snapshot
            .loadable_values()
            .filter(|(_, name, _)| *name != ACTIVE_STEP_MARKER)
            .map(|(scope, name, value)| {
                let value = if value.trim().is_empty() { "false" } else { value };
                Statement::generated(
                    format!(
                        "stack_state_load({},{},{})",
                        to_engine_string(&scope.to_string()),
                        to_engine_string(name),
                        value
                    ),
                    "state",
                )
            })
            .collect();

        for prt in structure.prts() {
            if snapshot.prt.contains_key(prt.name()) {
                commands.push(Statement::generated(
                    format!("stack_state_load_prt({})", to_engine_string(prt.name())),
                    "state",
                ));
            }
        }

        commands
            .into_iter()
            .enumerate()
            .map(|(i, statement)| statement.with_key(format!("statevalueload{}", i)))
            .collect()
    }

    /// Number of committed active-step markers at `sequence`.
    pub async fn count_active_step_markers(&self, sequence: i64) -> Result<usize, StateError> {
        Ok(self
            .repository
            .count_instance(
                self.attempt.owner_id,
                self.attempt.attempt_id,
                sequence,
                ACTIVE_STEP_MARKER,
            )
            .await?)
    }

    /// Adopts the engine's state export and persists its changes.
    ///
    /// The snapshot is always replaced. Nothing is written when `conflict` is
    /// set. On the first instance write of a positive step an active-step
    /// marker row is added and `sequence` is promoted, so later stores in the
    /// same request do not add it again.
    #[tracing::instrument(level = "debug", skip(self, export, sequence), fields(attempt = self.attempt.attempt_id))]
    pub async fn store(
        &mut self,
        export: &str,
        sequence: &mut SequenceState,
        conflict: bool,
        skip_rerender: bool,
    ) -> Result<StoreOutcome, StateError> {
        let variables = parse_state_export(export)?;

        let previous = self
            .snapshot
            .take()
            .unwrap_or_else(|| self.declarations().clone());
        let mut next = StateSnapshot {
            writes: previous.writes,
            lock: previous.lock,
            prt: previous.prt,
            ..Default::default()
        };
        let mut changed_global = BTreeSet::new();
        let mut changed_instance = BTreeSet::new();
        for variable in variables {
            if variable.changed {
                match variable.scope {
                    Scope::Global => {
                        changed_global.insert(variable.name.clone());
                    }
                    Scope::Instance => {
                        changed_instance.insert(variable.name.clone());
                    }
                    _ => {}
                }
            }
            next.scope_mut(variable.scope)
                .insert(variable.name, variable.value);
        }
        self.snapshot = Some(next.clone());

        if conflict {
            if !changed_global.is_empty() || !changed_instance.is_empty() {
                warn!("Sequence conflict, not persisting state changes");
            }
            return Ok(StoreOutcome::default());
        }

        let mut outcome = StoreOutcome {
            render_required: !skip_rerender
                && (!changed_global.is_empty() || !changed_instance.is_empty()),
            ..Default::default()
        };

        if !changed_global.is_empty() {
            let names: Vec<String> = changed_global.iter().cloned().collect();
            let existing = self
                .repository
                .select_global(self.attempt.owner_id, &names)
                .await?;
            for name in &changed_global {
                let Some(value) = next.global.get(name) else {
                    continue;
                };
                let unchanged = existing
                    .iter()
                    .any(|row| &row.name == name && &row.value == value);
                if unchanged {
                    continue;
                }
                self.repository
                    .upsert_global(StateVariableRecord::global(
                        self.attempt.owner_id,
                        name.clone(),
                        value.clone(),
                    ))
                    .await?;
                outcome.global_writes += 1;
            }
        }

        if let SequenceState::Step {
            number,
            promoted: false,
        } = *sequence
        {
            if number > 0 {
                changed_instance.insert(ACTIVE_STEP_MARKER.to_string());
                *sequence = SequenceState::Step {
                    number,
                    promoted: true,
                };
            }
        }

        if *sequence == SequenceState::Initial {
            for (name, value) in &next.instance {
                self.attempt_snapshot
                    .set(
                        self.attempt.attempt_id,
                        &format!("{}{}", self.snapshot_prefix, name),
                        value,
                    )
                    .await?;
                outcome.instance_writes += 1;
            }
        } else if !changed_instance.is_empty() {
            let number = sequence.load_number().unwrap_or(0);
            let records: Vec<StateVariableRecord> = changed_instance
                .iter()
                .map(|name| {
                    let value = match next.instance.get(name) {
                        Some(value) => value.clone(),
                        None => "true".to_string(),
                    };
                    StateVariableRecord::instance(
                        self.attempt.owner_id,
                        self.attempt.attempt_id,
                        number,
                        name.clone(),
                        value,
                    )
                })
                .collect();
            outcome.instance_writes = records.len();
            self.repository.insert_instance(records).await?;
        }

        if outcome.global_writes + outcome.instance_writes > 0 {
            info!(
                "Persisted {} global and {} instance state values",
                outcome.global_writes, outcome.instance_writes
            );
        }
        Ok(outcome)
    }
}

fn engine_list<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    let items: Vec<String> = items.into_iter().map(|s| to_engine_string(s)).collect();
    format!("[{}]", items.join(","))
}

fn inject_structure(snapshot: &mut StateSnapshot, structure: &mut QuestionStructure) {
    let history = !snapshot.prt.is_empty();
    if snapshot.structure.is_empty() && !history {
        return;
    }

    if snapshot.structure.contains_key("inputs") {
        let inputs = engine_list(structure.input_names());
        snapshot.structure.insert("inputs".to_string(), inputs);
    }

    if history || snapshot.structure.contains_key("prts") {
        let names = structure.prt_names();
        snapshot
            .structure
            .insert("prts".to_string(), engine_list(&names));
    }

    if history || snapshot.structure.contains_key("prt-inputs") {
        let lists: Vec<String> = structure
            .prt_names()
            .iter()
            .map(|name| engine_list(&structure.required_inputs(name)))
            .collect();
        snapshot
            .structure
            .insert("prt-inputs".to_string(), format!("[{}]", lists.join(",")));
    }
}
