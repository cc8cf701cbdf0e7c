//! # Potential Response Trees
//!
//! The scoring collaborator. A PRT takes the evaluated question session and
//! the student's input values and returns a fraction, feedback and, for
//! stateful questions, the engine's state export after it ran. How a tree
//! scores is not this crate's concern.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::cas::{options::CasOptions, session::EvaluationSession, SessionError};

#[derive(Error, Debug)]
pub enum PrtError {
    #[error("PRT session error: {0}")]
    Session(#[from] SessionError),
    #[error("PRT evaluation failed: {0}")]
    Evaluation(String),
}

/// Outcome of evaluating one PRT against one response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrtResult {
    pub name: String,
    pub weight: f64,
    /// `None` until the tree has been evaluated.
    pub valid: Option<bool>,
    pub fraction: f64,
    pub fractional_penalty: f64,
    pub errors: Vec<String>,
    pub answer_notes: Vec<String>,
    pub feedback: Vec<String>,
    /// Printed `stack_state_full_state` value after the tree ran.
    pub state_export: Option<String>,
}

impl PrtResult {
    /// Result for a tree that could not be evaluated yet.
    pub fn not_executed(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            ..Default::default()
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.valid.is_some()
    }

    pub fn weighted_fraction(&self) -> f64 {
        self.fraction * self.weight
    }
}

/// A scoring tree attached to a question.
///
/// # Contract
///
/// - `required_variables` is called with the question's input names and
///   returns, in order, those the tree reads.
/// - `evaluate` receives a session it may extend and instantiate. Errors raised
///   by the engine belong in [`PrtResult::errors`]; `Err` is reserved for
///   failures that make the whole evaluation meaningless.
#[async_trait]
pub trait PotentialResponseTree: Send + Sync {
    fn name(&self) -> &str;

    /// Share of the question's mark this tree carries.
    fn value(&self) -> f64;

    fn required_variables(&self, input_names: &[String]) -> Vec<String>;

    async fn evaluate(
        &self,
        session: EvaluationSession,
        options: &CasOptions,
        inputs: &BTreeMap<String, String>,
        seed: i64,
    ) -> Result<PrtResult, PrtError>;
}

/// Input and PRT layout of a question, with the inputs each PRT reads
/// memoized per PRT name.
#[derive(Clone, Default)]
pub struct QuestionStructure {
    input_names: Vec<String>,
    prts: Vec<Arc<dyn PotentialResponseTree>>,
    required: BTreeMap<String, Vec<String>>,
}

impl fmt::Debug for QuestionStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuestionStructure")
            .field("input_names", &self.input_names)
            .field("prts", &self.prt_names())
            .finish()
    }
}

impl QuestionStructure {
    pub fn new(input_names: Vec<String>, prts: Vec<Arc<dyn PotentialResponseTree>>) -> Self {
        Self {
            input_names,
            prts,
            required: BTreeMap::new(),
        }
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn prt_names(&self) -> Vec<String> {
        self.prts.iter().map(|prt| prt.name().to_string()).collect()
    }

    pub fn prts(&self) -> &[Arc<dyn PotentialResponseTree>] {
        &self.prts
    }

    pub fn prt(&self, name: &str) -> Option<&Arc<dyn PotentialResponseTree>> {
        self.prts.iter().find(|prt| prt.name() == name)
    }

    /// Inputs `prt_name` reads, in input order. Unknown names read nothing.
    pub fn required_inputs(&mut self, prt_name: &str) -> Vec<String> {
        if let Some(required) = self.required.get(prt_name) {
            return required.clone();
        }
        let Some(prt) = self.prt(prt_name) else {
            return Vec::new();
        };
        let required = prt.required_variables(&self.input_names);
        self.required.insert(prt_name.to_string(), required.clone());
        required
    }
}
