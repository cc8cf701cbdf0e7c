//! Student responses: input collaborators and the per-response cache.

pub mod cache;
pub mod input;

use std::collections::BTreeMap;

pub use cache::ResponseEvaluationCache;
pub use input::{Input, InputState, InputStatus};

/// Raw submitted fields, name to value.
pub type Response = BTreeMap<String, String>;
