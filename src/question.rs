//! # Stateful Question
//!
//! Drives one question attempt through a request: pick or restore the seed,
//! identify the step the response belongs to, load its state, evaluate the
//! question session, validate inputs, run the PRTs and persist whatever state
//! the engine reports back.
//!
//! Rendering is limited to the question text, which the author supplies as an
//! engine expression evaluated in the question session.

use std::{collections::BTreeMap, sync::Arc};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    cas::{
        connection::CasConnection,
        keyval::KeyVal,
        options::CasOptions,
        session::{EvaluationSession, SessionError},
        statement::{SecurityLevel, Statement},
        text::{from_engine_string, to_engine_string},
    },
    config::StackStateConfig,
    debug::fake_feedback,
    prt::{PotentialResponseTree, PrtError, PrtResult, QuestionStructure},
    response::{Input, InputState, InputStatus, Response, ResponseEvaluationCache},
    sequence::{SequenceController, SequenceState},
    state::{
        state_export_statement, AttemptContext, AttemptSnapshot, RepositoryError, StateError,
        StateRepository, StateScopeError, StateScopeStore, UserDirectory, STATE_EXPORT_KEY,
    },
};

lazy_static! {
    static ref RANDOM_CALL: Regex = Regex::new(r"\brand").unwrap();
}

const QUESTION_TEXT_KEY: &str = "__questiontext";
const PRT_HISTORY_KEY: &str = "prthistoryvar";

#[derive(Error, Debug)]
pub enum QuestionError {
    /// Author code failed in the engine after it passed validation.
    #[error("CAS error when instantiating the session: {}", .0.join("; "))]
    Instantiation(Vec<String>),
    #[error("Invalid author text: {}", .0.join("; "))]
    InvalidDefinition(Vec<String>),
    #[error("Question used before a seed was chosen")]
    NotInitialised,
    #[error("No seed stored for attempt {0}")]
    MissingSeed(i64),
    #[error("Variant {0} is not deployed")]
    UnknownVariant(usize),
    #[error("Unknown input: {0}")]
    UnknownInput(String),
    #[error("Unknown PRT: {0}")]
    UnknownPrt(String),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("State error: {0}")]
    State(#[from] StateError),
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("PRT error: {0}")]
    Prt(#[from] PrtError),
}

/// Author-supplied parts of a question.
#[derive(Debug, Clone, Default)]
pub struct QuestionDefinition {
    /// Definitions shared by every session, including state declarations.
    pub variable_definitions: String,
    pub question_variables: String,
    /// Engine expression that evaluates to the question text.
    pub question_text: String,
    pub deployed_seeds: Vec<i64>,
}

/// Collaborators provided by the hosting engine.
#[derive(Clone)]
pub struct QuestionServices {
    pub connection: Arc<dyn CasConnection>,
    pub repository: Arc<dyn StateRepository>,
    pub attempt_snapshot: Arc<dyn AttemptSnapshot>,
    pub users: Arc<dyn UserDirectory>,
}

pub struct StatefulQuestion {
    definition: QuestionDefinition,
    options: CasOptions,
    inputs: Vec<Arc<dyn Input>>,
    structure: QuestionStructure,
    connection: Arc<dyn CasConnection>,
    attempt_snapshot: Arc<dyn AttemptSnapshot>,
    store: StateScopeStore,
    sequence: SequenceController,
    cache: ResponseEvaluationCache,
    seed_field: String,
    seed: Option<i64>,
    session: Option<EvaluationSession>,
    question_text: Option<String>,
    render_required: bool,
}

impl StatefulQuestion {
    pub fn new(
        definition: QuestionDefinition,
        inputs: Vec<Arc<dyn Input>>,
        prts: Vec<Arc<dyn PotentialResponseTree>>,
        services: QuestionServices,
        attempt: AttemptContext,
        config: &StackStateConfig,
    ) -> Self {
        let sequence_field = config.state.sequence_field.clone();
        let input_names = inputs
            .iter()
            .map(|input| input.name().to_string())
            .filter(|name| name != &sequence_field)
            .collect();
        let store = StateScopeStore::new(
            definition.variable_definitions.clone(),
            services.repository,
            services.attempt_snapshot.clone(),
            services.users,
            attempt,
            &config.state,
        );
        Self {
            definition,
            options: config.options.clone(),
            inputs,
            structure: QuestionStructure::new(input_names, prts),
            connection: services.connection,
            attempt_snapshot: services.attempt_snapshot,
            store,
            sequence: SequenceController::new(sequence_field),
            cache: ResponseEvaluationCache::new(),
            seed_field: config.state.seed_field.clone(),
            seed: None,
            session: None,
            question_text: None,
            render_required: false,
        }
    }

    /// Forces a seed, e.g. to browse variants that are not deployed.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn seed(&self) -> Option<i64> {
        self.seed
    }

    pub fn options(&self) -> &CasOptions {
        &self.options
    }

    pub fn session(&self) -> Option<&EvaluationSession> {
        self.session.as_ref()
    }

    pub fn question_text(&self) -> Option<&str> {
        self.question_text.as_deref()
    }

    pub fn render_required(&self) -> bool {
        self.render_required
    }

    pub fn sequence_state(&self) -> SequenceState {
        self.sequence.state()
    }

    pub fn state_conflict(&self) -> bool {
        self.sequence.conflict()
    }

    pub fn store(&self) -> &StateScopeStore {
        &self.store
    }

    pub fn has_random_variants(&self) -> bool {
        RANDOM_CALL.is_match(&self.definition.question_variables)
    }

    pub fn has_state_variables(&self) -> bool {
        self.store.has_state_variables()
    }

    pub fn has_writable_state_variables(&self) -> bool {
        self.store.has_writable_state_variables()
    }

    pub fn state_declaration_errors(&self) -> &[StateScopeError] {
        self.store.declaration_errors()
    }

    /// Shifts instance-row loading, see [`StateScopeStore::set_state_offset`].
    pub fn set_state_offset(&mut self, offset: i64) {
        self.store.set_state_offset(offset);
    }

    /// Chooses the seed for a new attempt and evaluates the question for it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn start_attempt(&mut self, variant: usize) -> Result<(), QuestionError> {
        let seed = match self.seed {
            Some(seed) => seed,
            None if !self.has_random_variants() => 1,
            None if !self.definition.deployed_seeds.is_empty() => *variant
                .checked_sub(1)
                .and_then(|index| self.definition.deployed_seeds.get(index))
                .ok_or(QuestionError::UnknownVariant(variant))?,
            None => variant as i64,
        };
        self.seed = Some(seed);
        self.attempt_snapshot
            .set(self.store.attempt().attempt_id, &self.seed_field, &seed.to_string())
            .await?;

        self.sequence.set_conflict(false);
        self.sequence.set_state(if self.has_writable_state_variables() {
            SequenceState::Initial
        } else {
            SequenceState::Ignored
        });
        self.initialise_from_seed().await
    }

    /// Restores a question for a later request on an existing attempt.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn apply_attempt_state(&mut self) -> Result<(), QuestionError> {
        let attempt_id = self.store.attempt().attempt_id;
        let seed = self
            .attempt_snapshot
            .get(attempt_id, &self.seed_field)
            .await?
            .and_then(|seed| seed.trim().parse().ok())
            .ok_or(QuestionError::MissingSeed(attempt_id))?;
        self.seed = Some(seed);

        if !self.has_writable_state_variables() {
            self.sequence.set_state(SequenceState::Ignored);
        } else if self.sequence.state() == SequenceState::Initial {
            self.sequence.set_conflict(false);
        }
        self.initialise_from_seed().await
    }

    fn keyval(&self, text: &str, context: &str) -> Result<KeyVal, QuestionError> {
        let keyval = KeyVal::new(text, context, SecurityLevel::Teacher);
        if !keyval.is_valid() {
            return Err(QuestionError::InvalidDefinition(
                keyval.errors().iter().map(ToString::to_string).collect(),
            ));
        }
        Ok(keyval)
    }

    fn text_statement(&self) -> Option<Statement> {
        let text = self.definition.question_text.trim();
        (!text.is_empty())
            .then(|| Statement::new(text, "questiontext", SecurityLevel::Teacher).with_key(QUESTION_TEXT_KEY))
    }

    async fn instantiate(&self, session: &mut EvaluationSession) -> Result<(), QuestionError> {
        session.instantiate(self.connection.as_ref()).await?;
        let errors: Vec<String> = session
            .statements()
            .iter()
            .flat_map(|statement| {
                statement
                    .errors()
                    .map(move |error| format!("{}: {}", statement.context(), error))
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(QuestionError::Instantiation(errors))
        }
    }

    /// Evaluates the question session once the seed is known. Later calls do
    /// nothing.
    ///
    /// The session is state loads, variable definitions, question variables,
    /// the teacher's answers, the question text and the state export. Only the
    /// question variables and teacher answers are kept afterwards.
    pub async fn initialise_from_seed(&mut self) -> Result<(), QuestionError> {
        if self.session.is_some() {
            return Ok(());
        }
        let seed = self.seed.ok_or(QuestionError::NotInitialised)?;

        let definitions = self.keyval(&self.definition.variable_definitions, "variabledefinitions")?;
        let mut session = if self.has_state_variables() {
            if let Some(number) = self.sequence.state().load_number() {
                self.store.load(number, &mut self.structure).await?;
            }
            let mut session = EvaluationSession::new(
                self.store.generate_load_commands(&self.structure),
                self.options.clone(),
                seed,
            );
            session.merge_session(&definitions.session(&self.options, seed));
            session
        } else {
            definitions.session(&self.options, seed)
        };
        let preamble = session.len();

        let variables = self.keyval(&self.definition.question_variables, "questionvariables")?;
        session.merge_session(&variables.session(&self.options, seed));
        for input in &self.inputs {
            session.add_statement(
                Statement::new(
                    input.teacher_answer(),
                    format!("teacheranswer/{}", input.name()),
                    SecurityLevel::Teacher,
                )
                .with_key(input.name()),
            );
        }
        let kept = session.len();

        if let Some(text) = self.text_statement() {
            session.add_statement(text);
        }
        if self.has_state_variables() {
            session.add_statement(state_export_statement());
        }

        self.instantiate(&mut session).await?;

        if self.has_writable_state_variables() {
            let export = session.get_value_text(STATE_EXPORT_KEY).unwrap_or_default().to_string();
            let conflict = self.sequence.conflict();
            self.store
                .store(&export, self.sequence.state_mut(), conflict, true)
                .await?;
        }

        if self.question_text.is_none() {
            self.question_text = session.get_value_text(QUESTION_TEXT_KEY).map(display_text);
        }

        session.prune_range(session.len() - kept, kept);
        session.prune_range(preamble, 0);
        debug!("Question session keeps {} statements", session.len());
        self.session = Some(session);
        Ok(())
    }

    /// Re-renders the question text. With `offset == 0` this only happens when
    /// a render is pending; other offsets render the state of a neighbouring
    /// step and leave the current one untouched.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn update_question_text(&mut self, offset: i64) -> Result<(), QuestionError> {
        if !self.has_writable_state_variables() || (!self.render_required && offset == 0) {
            return Ok(());
        }

        if offset == 0 {
            return self.render_question_text().await;
        }

        let backup_snapshot = self.store.take_snapshot();
        let backup_sequence = self.sequence.state();
        let shifted: Result<(), QuestionError> = async {
            if let Some(number) = backup_sequence.load_number() {
                self.store.load(number + offset, &mut self.structure).await?;
            }
            self.render_question_text().await
        }
        .await;
        self.store.restore_snapshot(backup_snapshot);
        self.sequence.set_state(backup_sequence);
        shifted
    }

    async fn render_question_text(&mut self) -> Result<(), QuestionError> {
        let seed = self.seed.ok_or(QuestionError::NotInitialised)?;
        let mut session = EvaluationSession::new(
            self.store.generate_load_commands(&self.structure),
            self.options.clone(),
            seed,
        );
        let definitions = self.keyval(&self.definition.variable_definitions, "variabledefinitions")?;
        session.merge_session(&definitions.session(&self.options, seed));
        let variables = self.keyval(&self.definition.question_variables, "questionvariables")?;
        session.merge_session(&variables.session(&self.options, seed));
        if let Some(text) = self.text_statement() {
            session.add_statement(text);
        }

        self.instantiate(&mut session).await?;
        self.question_text = session.get_value_text(QUESTION_TEXT_KEY).map(display_text);
        Ok(())
    }

    /// Fixes the step `response` belongs to. When it changes, the question text
    /// is re-rendered from the entry state of that step.
    pub async fn identify_sequence_number(&mut self, response: &Response) -> Result<(), QuestionError> {
        if !self.has_writable_state_variables() {
            return Ok(());
        }
        let identified = self
            .sequence
            .identify(response, &mut self.store, &mut self.structure)
            .await?;
        if identified.changed {
            self.render_required = true;
            let rendered = self.update_question_text(0).await;
            self.render_required = false;
            rendered?;
        }
        Ok(())
    }

    /// Validation state of one input, cached for the current response.
    ///
    /// The sequence field is synthesized without the engine as the witness
    /// value of the next submission.
    pub async fn input_state(
        &mut self,
        name: &str,
        response: &Response,
    ) -> Result<Arc<InputState>, QuestionError> {
        self.cache.validate(response, None);
        if let Some(state) = self.cache.input_state(name) {
            return Ok(state);
        }

        if name == self.sequence.field() {
            let witness = self.sequence.witness(response).to_string();
            let state = InputState::new(InputStatus::Score, vec![witness.clone()], witness);
            return Ok(self.cache.insert_input_state(name, state));
        }

        let input = self
            .inputs
            .iter()
            .find(|input| input.name() == name)
            .cloned()
            .ok_or_else(|| QuestionError::UnknownInput(name.to_string()))?;
        let session = self.session.as_ref().ok_or(QuestionError::NotInitialised)?;
        let forbidden: Vec<String> = session.get_all_keys().into_iter().map(str::to_string).collect();
        let state = input
            .validate_student_response(response, &self.options, session.get_value(name), &forbidden)
            .await;
        Ok(self.cache.insert_input_state(name, state))
    }

    /// True when every input `prt_name` reads is `Score`, or `Valid` with
    /// `accept_valid`.
    pub async fn has_necessary_prt_inputs(
        &mut self,
        prt_name: &str,
        response: &Response,
        accept_valid: bool,
    ) -> Result<bool, QuestionError> {
        self.identify_sequence_number(response).await?;
        for name in self.structure.required_inputs(prt_name) {
            if !self.input_state(&name, response).await?.is_usable(accept_valid) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Engine values of the usable inputs `prt_name` reads.
    pub async fn prt_input(
        &mut self,
        prt_name: &str,
        response: &Response,
        accept_valid: bool,
    ) -> Result<BTreeMap<String, String>, QuestionError> {
        let mut values = BTreeMap::new();
        for name in self.structure.required_inputs(prt_name) {
            let state = self.input_state(&name, response).await?;
            if state.is_usable(accept_valid) {
                values.insert(name, state.contents_modified.clone());
            }
        }
        Ok(values)
    }

    async fn history_statement(
        &mut self,
        prt_name: &str,
        response: &Response,
    ) -> Result<Statement, QuestionError> {
        let mut values = Vec::new();
        let mut strings = Vec::new();
        for name in self.structure.required_inputs(prt_name) {
            let state = self.input_state(&name, response).await?;
            let input = self
                .inputs
                .iter()
                .find(|input| input.name() == name)
                .ok_or_else(|| QuestionError::UnknownInput(name.clone()))?;
            let value = input.contents_to_maxima(&state.contents);
            strings.push(to_engine_string(&value));
            values.push(value);
        }
        Ok(Statement::generated(
            format!(
                "stack_state_update_prt({},[[{}],[{}]])",
                to_engine_string(prt_name),
                values.join(","),
                strings.join(",")
            ),
            "state",
        )
        .with_key(PRT_HISTORY_KEY))
    }

    /// Evaluates one PRT for `response`, cached for that response.
    ///
    /// A tree whose inputs are not ready gets a not-executed result without
    /// contacting the engine. State reported by an evaluated tree is stored.
    #[tracing::instrument(level = "debug", skip(self, response))]
    pub async fn prt_result(
        &mut self,
        prt_name: &str,
        response: &Response,
        accept_valid: bool,
    ) -> Result<Arc<PrtResult>, QuestionError> {
        self.identify_sequence_number(response).await?;
        self.cache.validate(response, Some(accept_valid));
        if let Some(result) = self.cache.prt_result(prt_name) {
            return Ok(result);
        }

        let prt = self
            .structure
            .prt(prt_name)
            .cloned()
            .ok_or_else(|| QuestionError::UnknownPrt(prt_name.to_string()))?;

        if !self.has_necessary_prt_inputs(prt_name, response, accept_valid).await? {
            let result = PrtResult::not_executed(prt_name, prt.value());
            return Ok(self.cache.insert_prt_result(prt_name, result));
        }

        let inputs = self.prt_input(prt_name, response, accept_valid).await?;
        let seed = self.seed.ok_or(QuestionError::NotInitialised)?;
        let definitions = self.keyval(&self.definition.variable_definitions, "variabledefinitions")?;
        let mut session = definitions.session(&self.options, seed);
        session.merge_session(self.session.as_ref().ok_or(QuestionError::NotInitialised)?);

        if self.has_state_variables() {
            let mut stateful = EvaluationSession::new(
                self.store.generate_load_commands(&self.structure),
                self.options.clone(),
                seed,
            );
            let history = self
                .store
                .snapshot()
                .is_some_and(|snapshot| snapshot.prt.contains_key(prt_name));
            if history {
                let statement = self.history_statement(prt_name, response).await?;
                stateful.add_statement(statement);
            }
            stateful.merge_session(&session);
            session = stateful;
        }

        let result = prt.evaluate(session, &self.options, &inputs, seed).await?;
        let result = self.cache.insert_prt_result(prt_name, result);

        if self.has_writable_state_variables() {
            match &result.state_export {
                Some(export) => {
                    let conflict = self.sequence.conflict();
                    let outcome = self
                        .store
                        .store(export, self.sequence.state_mut(), conflict, false)
                        .await?;
                    self.render_required |= outcome.render_required;
                }
                None => warn!("PRT {} returned no state export", prt_name),
            }
        }
        Ok(result)
    }

    /// True when `prt_name` evaluated without errors. Trying is the check.
    pub async fn can_execute_prt(
        &mut self,
        prt_name: &str,
        response: &Response,
        accept_valid: bool,
    ) -> Result<bool, QuestionError> {
        self.identify_sequence_number(response).await?;
        let result = self.prt_result(prt_name, response, accept_valid).await?;
        Ok(result.is_evaluated() && result.errors.is_empty())
    }

    fn input_names(&self) -> Vec<String> {
        self.structure.input_names().to_vec()
    }

    pub async fn is_any_input_blank(&mut self, response: &Response) -> Result<bool, QuestionError> {
        self.identify_sequence_number(response).await?;
        for name in self.input_names() {
            if self.input_state(&name, response).await?.status == InputStatus::Blank {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True when any input is invalid or any PRT reports errors.
    pub async fn is_any_part_invalid(&mut self, response: &Response) -> Result<bool, QuestionError> {
        self.identify_sequence_number(response).await?;
        for name in self.input_names() {
            if self.input_state(&name, response).await?.status == InputStatus::Invalid {
                return Ok(true);
            }
        }
        for prt in self.structure.prt_names() {
            if !self.prt_result(&prt, response, false).await?.errors.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every PRT can be executed, or, without PRTs, every input is `Score`.
    pub async fn is_complete_response(&mut self, response: &Response) -> Result<bool, QuestionError> {
        self.identify_sequence_number(response).await?;
        let prts = self.structure.prt_names();
        for prt in &prts {
            if !self.can_execute_prt(prt, response, false).await? {
                return Ok(false);
            }
        }
        if prts.is_empty() {
            for name in self.input_names() {
                if self.input_state(&name, response).await?.status != InputStatus::Score {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// True when at least one PRT can be executed.
    pub async fn is_gradable_response(&mut self, response: &Response) -> Result<bool, QuestionError> {
        self.identify_sequence_number(response).await?;
        for prt in self.structure.prt_names() {
            if self.can_execute_prt(&prt, response, true).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Sum of the PRT fractions.
    pub async fn grade_response(&mut self, response: &Response) -> Result<f64, QuestionError> {
        self.identify_sequence_number(response).await?;
        let mut fraction = 0.0;
        for prt in self.structure.prt_names() {
            fraction += self.prt_result(&prt, response, true).await?.fraction;
        }
        Ok(fraction)
    }

    /// One `name: value [status]` entry per input.
    pub async fn summarise_response(&mut self, response: &Response) -> Result<String, QuestionError> {
        self.identify_sequence_number(response).await?;
        let mut parts = Vec::new();
        for name in self.input_names() {
            let state = self.input_state(&name, response).await?;
            let value = response.get(&name).map(String::as_str).unwrap_or("");
            parts.push(format!("{}: {} [{}]", name, value, state.status));
        }
        Ok(parts.join("; "))
    }

    /// Printed values of the question variables and teacher answers.
    pub fn question_var_values(&self) -> BTreeMap<String, String> {
        let Some(session) = &self.session else {
            return BTreeMap::new();
        };
        session
            .get_all_keys()
            .into_iter()
            .filter_map(|key| {
                session
                    .get_value_text(key)
                    .map(|value| (key.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Rewrites the cached results with placeholder content, for tidying
    /// question layouts.
    pub fn setup_fake_feedback(&mut self) {
        fake_feedback(&mut self.cache);
    }

    pub fn cache(&self) -> &ResponseEvaluationCache {
        &self.cache
    }
}

fn display_text(value: &str) -> String {
    from_engine_string(value).unwrap_or_else(|| value.to_string())
}
