use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use super::Response;
use crate::cas::{expression::Expression, options::CasOptions};

/// How far an input's raw value got through validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InputStatus {
    Blank,
    Invalid,
    /// Valid, but not yet confirmed by the student.
    Valid,
    /// Valid and confirmed, may be graded.
    Score,
}

/// Validation result of one input for one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputState {
    pub status: InputStatus,
    /// Raw values as typed, one per response field the input reads.
    pub contents: Vec<String>,
    /// Engine form of the answer, passed on to the PRTs.
    pub contents_modified: String,
    pub contents_displayed: String,
    pub errors: String,
    pub note: String,
}

impl InputState {
    pub fn new(status: InputStatus, contents: Vec<String>, contents_modified: impl Into<String>) -> Self {
        let contents_modified = contents_modified.into();
        Self {
            status,
            contents,
            contents_displayed: contents_modified.clone(),
            contents_modified,
            errors: String::new(),
            note: String::new(),
        }
    }

    pub fn with_errors(mut self, errors: impl Into<String>) -> Self {
        self.errors = errors.into();
        self
    }

    /// True when a PRT may read this input.
    pub fn is_usable(&self, accept_valid: bool) -> bool {
        self.status == InputStatus::Score || (accept_valid && self.status == InputStatus::Valid)
    }
}

/// An answer box of a question.
///
/// Widget-specific validation is the implementor's business. The question
/// only relies on the resulting [`InputState`].
#[async_trait]
pub trait Input: Send + Sync {
    fn name(&self) -> &str;

    /// Engine expression whose value is the model answer.
    fn teacher_answer(&self) -> &str;

    /// Validates the fields of `response` that belong to this input.
    ///
    /// `forbidden_keys` are names bound by the question variables; a student
    /// answer must not mention them.
    async fn validate_student_response(
        &self,
        response: &Response,
        options: &CasOptions,
        teacher_answer: Option<&Expression>,
        forbidden_keys: &[String],
    ) -> InputState;

    /// Engine source for raw `contents`, as recorded in PRT history.
    fn contents_to_maxima(&self, contents: &[String]) -> String {
        contents.first().cloned().unwrap_or_default()
    }
}
