//! Debugging helpers for layout work. Nothing in the evaluation path uses
//! them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::response::ResponseEvaluationCache;

/// A scalar or an arbitrarily nested list of scalars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NestedValue<T> {
    Leaf(T),
    Node(Vec<NestedValue<T>>),
}

impl<T> NestedValue<T> {
    /// Applies `f` to every leaf, keeping the shape.
    pub fn map_leaves<U>(self, f: &mut impl FnMut(T) -> U) -> NestedValue<U> {
        match self {
            NestedValue::Leaf(value) => NestedValue::Leaf(f(value)),
            NestedValue::Node(children) => {
                NestedValue::Node(children.into_iter().map(|child| child.map_leaves(f)).collect())
            }
        }
    }

    /// Replaces every leaf with a clone of `value`.
    pub fn fill<U: Clone>(self, value: &U) -> NestedValue<U> {
        self.map_leaves(&mut |_| value.clone())
    }

    pub fn leaves(&self) -> Vec<&T> {
        match self {
            NestedValue::Leaf(value) => vec![value],
            NestedValue::Node(children) => children.iter().flat_map(NestedValue::leaves).collect(),
        }
    }
}

/// Makes every cached input look as if its own name was typed into it, and
/// every cached PRT show `Feedback from PRT {name}`.
pub fn fake_feedback(cache: &mut ResponseEvaluationCache) {
    for (name, state) in cache.input_states_mut() {
        let contents = NestedValue::Node(
            state
                .contents
                .iter()
                .cloned()
                .map(NestedValue::Leaf)
                .collect(),
        );
        Arc::make_mut(state).contents = contents.fill(name).leaves().into_iter().cloned().collect();
    }
    for (name, result) in cache.prt_results_mut() {
        Arc::make_mut(result).feedback = vec![format!("Feedback from PRT {}", name)];
    }
}
