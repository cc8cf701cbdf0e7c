//! # Sequence Numbers
//!
//! Every accepted submission of a stateful question carries a step number in a
//! reserved response field. The controller compares it with the number it
//! already knows, detects replays of committed steps and synthesizes the
//! witness value the client has to echo back next time.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    prt::QuestionStructure,
    response::Response,
    state::{LoadOutcome, StateError, StateScopeStore},
};

/// Largest step number a client may declare, exclusive.
pub const MAX_SEQUENCE_NUMBER: i64 = i64::MAX / 2;

/// Where an attempt stands in its step sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceState {
    /// Nothing identified yet.
    #[default]
    Unknown,
    /// The question has no writable state, numbers are not tracked.
    Ignored,
    /// The first display of a new attempt.
    Initial,
    /// A submitted step. `promoted` is set once the first instance write for
    /// the step has added its active-step marker.
    Step { number: i64, promoted: bool },
}

impl SequenceState {
    /// The number state is loaded for, if known.
    pub fn load_number(&self) -> Option<i64> {
        match self {
            SequenceState::Unknown => None,
            SequenceState::Ignored | SequenceState::Initial => Some(0),
            SequenceState::Step { number, .. } => Some(*number),
        }
    }

    /// Value the client must send as the sequence field of its next
    /// submission. Always greater than the current number.
    pub fn witness(&self, declared: i64) -> i64 {
        match self {
            SequenceState::Unknown => declared.saturating_add(1),
            SequenceState::Ignored | SequenceState::Initial => 1,
            SequenceState::Step { number, .. } => number.saturating_add(1),
        }
    }
}

/// Outcome of [`SequenceController::identify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceIdentification {
    pub number: i64,
    pub conflict: bool,
    /// False when the declared number was already current.
    pub changed: bool,
}

/// Tracks the sequence number of one attempt during a request.
#[derive(Debug, Clone)]
pub struct SequenceController {
    field: String,
    state: SequenceState,
    conflict: bool,
}

impl SequenceController {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            state: SequenceState::Unknown,
            // Nothing may be written until a step has been identified.
            conflict: true,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn state_mut(&mut self) -> &mut SequenceState {
        &mut self.state
    }

    pub fn set_state(&mut self, state: SequenceState) {
        self.state = state;
    }

    pub fn conflict(&self) -> bool {
        self.conflict
    }

    pub fn set_conflict(&mut self, conflict: bool) {
        self.conflict = conflict;
    }

    /// The number declared in `response`. A missing field means `0`.
    ///
    /// Values outside `0..MAX_SEQUENCE_NUMBER` are treated like unparseable
    /// ones so that every step still has a larger witness.
    pub fn declared(&self, response: &Response) -> i64 {
        let Some(raw) = response.get(&self.field) else {
            return 0;
        };
        match raw.trim().parse::<i64>() {
            Ok(number) if (0..MAX_SEQUENCE_NUMBER).contains(&number) => number,
            _ => {
                warn!("Ignoring invalid sequence number {:?}", raw);
                0
            }
        }
    }

    /// Fixes the step for `response` and loads its state.
    ///
    /// A declared number whose active-step marker already exists is a replay:
    /// `conflict` is raised and stays raised for the rest of the request.
    #[tracing::instrument(level = "debug", skip_all, fields(field = %self.field))]
    pub async fn identify(
        &mut self,
        response: &Response,
        store: &mut StateScopeStore,
        structure: &mut QuestionStructure,
    ) -> Result<SequenceIdentification, StateError> {
        let declared = self.declared(response);
        let current = self.state.load_number();

        if current == Some(declared) || !store.has_writable_state_variables() {
            debug!("Sequence number {} unchanged", declared);
            return Ok(SequenceIdentification {
                number: declared,
                conflict: self.conflict,
                changed: false,
            });
        }

        self.state = SequenceState::Step {
            number: declared,
            promoted: false,
        };
        self.conflict = store.count_active_step_markers(declared).await? > 0;
        if self.conflict {
            warn!(
                "Step {} of attempt {} is already committed, state writes disabled",
                declared,
                store.attempt().attempt_id
            );
        }
        if store.load(declared, structure).await? == LoadOutcome::Loaded {
            debug!("Loaded state for step {}", declared);
        }

        Ok(SequenceIdentification {
            number: declared,
            conflict: self.conflict,
            changed: true,
        })
    }

    /// Synthesized input value for the sequence field. Never evaluated by the
    /// engine.
    pub fn witness(&self, response: &Response) -> i64 {
        self.state.witness(self.declared(response))
    }
}
