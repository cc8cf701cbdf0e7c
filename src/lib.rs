//! # stackstate: Stateful Evaluation Sessions for Algebra Questions
//!
//! Questions whose content depends on state that evolves while a student
//! submits successive answers. The crate keeps the computation sessions run
//! against an external computer-algebra engine consistent and replayable.
//!
//! ## Request Flow
//!
//! ```text
//! Response → SequenceController → StateScopeStore::load → EvaluationSession
//!          → CasProtocolCodec → engine → ResponseEvaluationCache → StateScopeStore::store
//! ```
//!
//! ### 1. Engine Protocol
//! - Statements and validation ([`cas::statement`], [`cas::keyval`])
//! - Wire format ([`cas::codec`]) and typed values ([`cas::expression`])
//! - Sessions and connections ([`cas::session`], [`cas::connection`])
//!
//! ### 2. State
//! - Declarations found in author text ([`state::references`])
//! - Per-request snapshot, loading and persistence ([`state::store`])
//! - Storage seams ([`state::repository`])
//!
//! ### 3. Steps and Responses
//! - Sequence numbers and replay detection ([`sequence`])
//! - Input and PRT result caching ([`response`], [`prt`])
//! - The question control flow tying it together ([`question`])

pub mod cas;
pub mod config;
pub mod debug;
pub mod error;
pub mod prt;
pub mod question;
pub mod response;
pub mod sequence;
pub mod state;

// Re-exports
pub use cas::{CasConnection, CasOptions, EvaluationSession, Statement};
pub use config::StackStateConfig;
pub use error::*;
pub use question::{QuestionDefinition, QuestionServices, StatefulQuestion};
pub use sequence::{SequenceController, SequenceState};
pub use state::{Scope, StateScopeStore, StateSnapshot};
