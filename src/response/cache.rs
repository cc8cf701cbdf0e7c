//! # Response Evaluation Cache
//!
//! Input validation and PRT evaluation both cost an engine round trip, and the
//! hosting engine asks about the same response many times per request. The
//! cache keeps both kinds of result for the last response seen and forgets all
//! of them as soon as a different response arrives.

use std::{collections::BTreeMap, sync::Arc};

use tracing::debug;

use super::{input::InputState, Response};
use crate::prt::PrtResult;

#[derive(Debug, Default)]
pub struct ResponseEvaluationCache {
    last_response: Option<Response>,
    last_accept_valid: Option<bool>,
    input_states: BTreeMap<String, Arc<InputState>>,
    prt_results: BTreeMap<String, Arc<PrtResult>>,
}

impl ResponseEvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the cache describe `response`.
    ///
    /// An `accept_valid` of `None` is compatible with any earlier flag, and an
    /// unset earlier flag adopts the new one. Any other difference clears both
    /// maps. Returns true when the cached entries were kept.
    pub fn validate(&mut self, response: &Response, accept_valid: Option<bool>) -> bool {
        let Some(last) = &self.last_response else {
            self.last_response = Some(response.clone());
            self.last_accept_valid = accept_valid;
            return true;
        };

        let compatible = match (self.last_accept_valid, accept_valid) {
            (None, _) | (_, None) => true,
            (Some(previous), Some(requested)) => previous == requested,
        };
        if last == response && compatible {
            if self.last_accept_valid.is_none() {
                self.last_accept_valid = accept_valid;
            }
            return true;
        }

        debug!(
            "Response changed, dropping {} input states and {} PRT results",
            self.input_states.len(),
            self.prt_results.len()
        );
        self.last_response = Some(response.clone());
        self.last_accept_valid = accept_valid;
        self.input_states.clear();
        self.prt_results.clear();
        false
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    pub fn last_accept_valid(&self) -> Option<bool> {
        self.last_accept_valid
    }

    pub fn input_state(&self, name: &str) -> Option<Arc<InputState>> {
        self.input_states.get(name).cloned()
    }

    pub fn insert_input_state(&mut self, name: impl Into<String>, state: InputState) -> Arc<InputState> {
        let state = Arc::new(state);
        self.input_states.insert(name.into(), state.clone());
        state
    }

    pub fn prt_result(&self, name: &str) -> Option<Arc<PrtResult>> {
        self.prt_results.get(name).cloned()
    }

    pub fn insert_prt_result(&mut self, name: impl Into<String>, result: PrtResult) -> Arc<PrtResult> {
        let result = Arc::new(result);
        self.prt_results.insert(name.into(), result.clone());
        result
    }

    pub fn input_states_mut(&mut self) -> impl Iterator<Item = (&String, &mut Arc<InputState>)> {
        self.input_states.iter_mut()
    }

    pub fn prt_results_mut(&mut self) -> impl Iterator<Item = (&String, &mut Arc<PrtResult>)> {
        self.prt_results.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.input_states.is_empty() && self.prt_results.is_empty()
    }

    pub fn clear(&mut self) {
        self.last_response = None;
        self.last_accept_valid = None;
        self.input_states.clear();
        self.prt_results.clear();
    }
}
