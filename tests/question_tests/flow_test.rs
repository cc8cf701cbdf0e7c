use std::{collections::BTreeMap, sync::Arc};

use pretty_assertions::assert_eq;
use stackstate::{
    prt::PotentialResponseTree,
    response::{Input, InputStatus, Response},
    state::{
        AttemptContext, AttemptSnapshot, InMemoryAttemptSnapshot, InMemoryStateRepository,
        InMemoryUserDirectory, UserProfile,
    },
    QuestionDefinition, QuestionServices, SequenceState, StackStateConfig, StatefulQuestion,
};

use super::fakes::{FakeEngine, FakeInput, FakePrt};

const ATTEMPT: i64 = 10;

fn student() -> UserProfile {
    UserProfile {
        id: 1,
        username: "student".to_string(),
        firstname: "Ada".to_string(),
        ..Default::default()
    }
}

fn teacher() -> UserProfile {
    UserProfile {
        id: 2,
        username: "teacher".to_string(),
        ..Default::default()
    }
}

/// Storage shared by every request of one attempt.
struct Attempt {
    engine: Arc<FakeEngine>,
    repository: InMemoryStateRepository,
    bag: InMemoryAttemptSnapshot,
    users: InMemoryUserDirectory,
}

impl Attempt {
    fn new() -> Self {
        Self {
            engine: FakeEngine::new(),
            repository: InMemoryStateRepository::new(),
            bag: InMemoryAttemptSnapshot::new(),
            users: InMemoryUserDirectory::new([student(), teacher()]),
        }
    }

    fn services(&self) -> QuestionServices {
        QuestionServices {
            connection: self.engine.clone(),
            repository: Arc::new(self.repository.clone()),
            attempt_snapshot: Arc::new(self.bag.clone()),
            users: Arc::new(self.users.clone()),
        }
    }

    fn request(
        &self,
        definition: QuestionDefinition,
        inputs: Vec<Arc<dyn Input>>,
        prts: Vec<Arc<dyn PotentialResponseTree>>,
        context: AttemptContext,
    ) -> StatefulQuestion {
        StatefulQuestion::new(
            definition,
            inputs,
            prts,
            self.services(),
            context,
            &StackStateConfig::default(),
        )
    }

    /// The counting question: every graded step adds one to `count`.
    fn counter(&self) -> StatefulQuestion {
        let definition = QuestionDefinition {
            variable_definitions: "stack_state_declare(\"rw\",\"instance\",\"count\",0)\n\
                                   count: stack_state_get(\"instance\",\"count\")"
                .to_string(),
            question_variables: "doubled: count*2".to_string(),
            question_text: "sconcat(\"Count is \", count)".to_string(),
            deployed_seeds: Vec::new(),
        };
        let prt = FakePrt::new("prt1", "ans1", "doubled", self.engine.clone())
            .with_update("stack_state_set(\"instance\",\"count\",count+1)");
        self.request(
            definition,
            vec![FakeInput::new("ans1", "doubled")],
            vec![prt.shared()],
            AttemptContext::new(ATTEMPT, student()),
        )
    }

    fn committed_rows(&self) -> usize {
        self.repository.instance_rows(1, ATTEMPT).len()
    }
}

fn response(fields: &[(&str, &str)]) -> Response {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_stateful_attempt_flow() {
    let attempt = Attempt::new();

    // First request: new attempt.
    let mut question = attempt.counter();
    question.start_attempt(1).await.unwrap();
    assert_eq!(question.seed(), Some(1));
    assert_eq!(question.sequence_state(), SequenceState::Initial);
    assert_eq!(question.question_text(), Some("Count is 0"));
    assert_eq!(
        question.question_var_values(),
        BTreeMap::from([
            ("ans1".to_string(), "0".to_string()),
            ("doubled".to_string(), "0".to_string()),
        ])
    );
    let witness = question.input_state("_seqn", &Response::new()).await.unwrap();
    assert_eq!(witness.contents_modified, "1");
    assert_eq!(
        attempt.bag.get(ATTEMPT, "_isv_count").await.unwrap().as_deref(),
        Some("0")
    );

    // Second request: step 1 is graded and committed.
    let step1 = response(&[("ans1", "0"), ("_seqn", "1")]);
    let mut question = attempt.counter();
    question.apply_attempt_state().await.unwrap();
    assert_eq!(question.grade_response(&step1).await.unwrap(), 1.0);
    assert!(!question.state_conflict());
    assert!(question.render_required());
    assert_eq!(attempt.committed_rows(), 2);

    let calls = attempt.engine.calls();
    let first = question.prt_result("prt1", &step1, true).await.unwrap();
    assert_eq!(question.grade_response(&step1).await.unwrap(), 1.0);
    let second = question.prt_result("prt1", &step1, true).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(attempt.engine.calls(), calls);

    question.update_question_text(0).await.unwrap();
    assert_eq!(question.question_text(), Some("Count is 1"));
    let witness = question.input_state("_seqn", &step1).await.unwrap();
    assert_eq!(witness.contents_modified, "2");

    // Third request: the same submission again. Step 1 is loaded with its
    // committed writes, so the old answer no longer matches, and nothing is
    // written.
    let mut replay = attempt.counter();
    replay.apply_attempt_state().await.unwrap();
    assert_eq!(replay.grade_response(&step1).await.unwrap(), 0.0);
    assert!(replay.state_conflict());
    assert_eq!(replay.question_text(), Some("Count is 1"));
    assert_eq!(attempt.committed_rows(), 2);

    // Fourth request: step 2 starts from the state step 1 left behind.
    let step2 = response(&[("ans1", "2"), ("_seqn", "2")]);
    let mut question = attempt.counter();
    question.apply_attempt_state().await.unwrap();
    assert_eq!(question.grade_response(&step2).await.unwrap(), 1.0);
    assert!(!question.state_conflict());
    assert_eq!(attempt.committed_rows(), 4);
    let counts: Vec<String> = attempt
        .repository
        .instance_rows(1, ATTEMPT)
        .into_iter()
        .filter(|row| row.name == "count")
        .map(|row| row.value)
        .collect();
    assert_eq!(counts, vec!["1", "2"]);
}

#[tokio::test]
async fn test_neighbouring_step_text_leaves_state_alone() {
    let attempt = Attempt::new();
    attempt.counter().start_attempt(1).await.unwrap();

    let step1 = response(&[("ans1", "0"), ("_seqn", "1")]);
    let mut question = attempt.counter();
    question.apply_attempt_state().await.unwrap();
    question.grade_response(&step1).await.unwrap();
    let state = question.sequence_state();
    let snapshot = question.store().snapshot().cloned();

    question.update_question_text(-1).await.unwrap();
    assert_eq!(question.question_text(), Some("Count is 0"));
    assert_eq!(question.sequence_state(), state);
    assert_eq!(question.store().snapshot().cloned(), snapshot);
}

#[tokio::test]
async fn test_response_classification() {
    let attempt = Attempt::new();
    attempt.counter().start_attempt(1).await.unwrap();

    let blank = response(&[("_seqn", "1")]);
    let mut question = attempt.counter();
    question.apply_attempt_state().await.unwrap();
    assert!(question.is_any_input_blank(&blank).await.unwrap());
    assert!(!question.is_complete_response(&blank).await.unwrap());
    assert!(!question.is_gradable_response(&blank).await.unwrap());
    assert_eq!(question.grade_response(&blank).await.unwrap(), 0.0);
    assert!(!question.prt_result("prt1", &blank, true).await.unwrap().is_evaluated());
    assert_eq!(question.summarise_response(&blank).await.unwrap(), "ans1:  [blank]");
    assert_eq!(attempt.committed_rows(), 0);

    // Names bound by the question may not be typed as answers.
    let forbidden = response(&[("ans1", "doubled"), ("_seqn", "1")]);
    assert!(question.is_any_part_invalid(&forbidden).await.unwrap());
    let state = question.input_state("ans1", &forbidden).await.unwrap();
    assert_eq!(state.status, InputStatus::Invalid);

    let wrong = response(&[("ans1", "7"), ("_seqn", "1")]);
    assert!(question.is_complete_response(&wrong).await.unwrap());
    assert!(question.is_gradable_response(&wrong).await.unwrap());
    assert_eq!(question.grade_response(&wrong).await.unwrap(), 0.0);
    assert_eq!(question.summarise_response(&wrong).await.unwrap(), "ans1: 7 [score]");
}

#[tokio::test]
async fn test_fake_feedback_after_grading() {
    let attempt = Attempt::new();
    attempt.counter().start_attempt(1).await.unwrap();

    let step1 = response(&[("ans1", "0"), ("_seqn", "1")]);
    let mut question = attempt.counter();
    question.apply_attempt_state().await.unwrap();
    question.grade_response(&step1).await.unwrap();
    assert_eq!(
        question.cache().prt_result("prt1").unwrap().feedback,
        vec!["Correct"]
    );

    question.setup_fake_feedback();
    assert_eq!(
        question.cache().prt_result("prt1").unwrap().feedback,
        vec!["Feedback from PRT prt1"]
    );
    assert_eq!(question.cache().input_state("ans1").unwrap().contents, vec!["ans1"]);
}

#[tokio::test]
async fn test_question_without_state() {
    let attempt = Attempt::new();
    let definition = QuestionDefinition {
        question_variables: "a: 3".to_string(),
        question_text: "sconcat(\"a = \", a)".to_string(),
        ..Default::default()
    };
    let prt = FakePrt::new("prt1", "ans1", "a", attempt.engine.clone());
    let mut question = attempt.request(
        definition,
        vec![FakeInput::new("ans1", "a")],
        vec![prt.shared()],
        AttemptContext::new(ATTEMPT, student()),
    );

    question.start_attempt(1).await.unwrap();
    assert!(!question.has_state_variables());
    assert_eq!(question.sequence_state(), SequenceState::Ignored);
    assert_eq!(question.question_text(), Some("a = 3"));

    let answer = response(&[("ans1", "3")]);
    assert_eq!(question.grade_response(&answer).await.unwrap(), 1.0);
    let witness = question.input_state("_seqn", &answer).await.unwrap();
    assert_eq!(witness.contents_modified, "1");
    assert_eq!(attempt.repository.row_count(), 0);
    assert!(!attempt
        .engine
        .last_program()
        .unwrap()
        .contains("stack_state_load"));
}

#[tokio::test]
async fn test_deployed_variant_seed_reaches_the_engine() {
    let attempt = Attempt::new();
    let definition = QuestionDefinition {
        question_variables: "a: rand(5)".to_string(),
        deployed_seeds: vec![101, 202],
        ..Default::default()
    };
    let mut question = attempt.request(
        definition.clone(),
        Vec::new(),
        Vec::new(),
        AttemptContext::new(ATTEMPT, student()),
    );
    question.start_attempt(2).await.unwrap();
    assert!(question.has_random_variants());
    assert_eq!(question.seed(), Some(202));
    assert!(attempt
        .engine
        .last_program()
        .unwrap()
        .contains("stack_randseed(202)"));

    let mut later = attempt.request(
        definition,
        Vec::new(),
        Vec::new(),
        AttemptContext::new(ATTEMPT, student()),
    );
    later.apply_attempt_state().await.unwrap();
    assert_eq!(later.seed(), Some(202));
}

#[tokio::test]
async fn test_review_sees_the_attempt_owner() {
    let attempt = Attempt::new();
    let definition = QuestionDefinition {
        variable_definitions: "name: stack_state_get(\"user\",\"username\")".to_string(),
        question_text: "sconcat(\"Hello \", name)".to_string(),
        ..Default::default()
    };

    let mut own = attempt.request(
        definition.clone(),
        Vec::new(),
        Vec::new(),
        AttemptContext::new(ATTEMPT, student()),
    );
    own.start_attempt(1).await.unwrap();
    assert!(own.has_state_variables());
    assert!(!own.has_writable_state_variables());
    assert_eq!(own.question_text(), Some("Hello student"));

    let mut review = attempt.request(
        definition,
        Vec::new(),
        Vec::new(),
        AttemptContext::new(ATTEMPT, student()).reviewed_by(teacher()),
    );
    review.apply_attempt_state().await.unwrap();
    assert_eq!(review.question_text(), Some("Hello student"));
}

#[tokio::test]
async fn test_failing_author_code_aborts_initialisation() {
    let attempt = Attempt::new();
    let definition = QuestionDefinition {
        question_variables: "a: 1/0; b: 2".to_string(),
        ..Default::default()
    };
    let mut question = attempt.request(
        definition,
        Vec::new(),
        Vec::new(),
        AttemptContext::new(ATTEMPT, student()),
    );
    let error = question.start_attempt(1).await.unwrap_err();
    assert!(error.to_string().contains("Division by 0"));
    assert!(question.session().is_none());
}
