use std::{collections::BTreeMap, sync::Arc};

use pretty_assertions::assert_eq;
use stackstate::{
    cas::{KeyVal, SecurityLevel},
    config::StateConfig,
    prt::QuestionStructure,
    state::{
        state_export_statement, AttemptContext, AttemptSnapshot, InMemoryAttemptSnapshot,
        InMemoryStateRepository, InMemoryUserDirectory, LoadOutcome, StoreOutcome, UserProfile,
        ACTIVE_STEP_MARKER, STATE_EXPORT_KEY,
    },
    CasOptions, EvaluationSession, SequenceController, SequenceState, StateScopeStore, Statement,
};

use super::fakes::FakeEngine;

const DEFINITIONS: &str =
    "stack_state_declare(\"rw\",\"instance\",\"count\",0); count: stack_state_get(\"instance\",\"count\")";
const INCREMENT: &str = "stack_state_set(\"instance\",\"count\",count+1)";
const ATTEMPT: i64 = 10;
const OWNER: i64 = 1;

struct Harness {
    engine: Arc<FakeEngine>,
    repository: InMemoryStateRepository,
    bag: InMemoryAttemptSnapshot,
    structure: QuestionStructure,
}

impl Harness {
    fn new() -> Self {
        Self {
            engine: FakeEngine::new(),
            repository: InMemoryStateRepository::new(),
            bag: InMemoryAttemptSnapshot::new(),
            structure: QuestionStructure::default(),
        }
    }

    fn store(&self, definitions: &str) -> StateScopeStore {
        let owner = UserProfile {
            id: OWNER,
            username: "student".to_string(),
            ..Default::default()
        };
        StateScopeStore::new(
            definitions,
            Arc::new(self.repository.clone()),
            Arc::new(self.bag.clone()),
            Arc::new(InMemoryUserDirectory::default()),
            AttemptContext::new(ATTEMPT, owner),
            &StateConfig::default(),
        )
    }

    /// Runs the definitions plus `update` in the engine and stores the export.
    async fn run(
        &self,
        store: &mut StateScopeStore,
        update: Option<&str>,
        sequence: &mut SequenceState,
        conflict: bool,
    ) -> StoreOutcome {
        let options = CasOptions::default();
        let definitions = KeyVal::new(DEFINITIONS, "variabledefinitions", SecurityLevel::Teacher);
        let mut session =
            EvaluationSession::new(store.generate_load_commands(&self.structure), options.clone(), 1);
        session.merge_session(&definitions.session(&options, 1));
        if let Some(update) = update {
            session.add_statement(Statement::generated(update, "update"));
        }
        session.add_statement(state_export_statement());
        session.instantiate(self.engine.as_ref()).await.unwrap();

        let export = session.get_value_text(STATE_EXPORT_KEY).unwrap().to_string();
        store.store(&export, sequence, conflict, false).await.unwrap()
    }

    /// Commits `count + 1` for step `number` from a fresh request.
    async fn commit_step(&mut self, number: i64) -> StoreOutcome {
        let mut store = self.store(DEFINITIONS);
        store.load(number, &mut self.structure).await.unwrap();
        let mut sequence = SequenceState::Step {
            number,
            promoted: false,
        };
        self.run(&mut store, Some(INCREMENT), &mut sequence, false).await
    }

    async fn start(&mut self) {
        let mut store = self.store(DEFINITIONS);
        store.load(0, &mut self.structure).await.unwrap();
        let mut sequence = SequenceState::Initial;
        let outcome = self.run(&mut store, None, &mut sequence, false).await;
        assert_eq!(outcome.instance_writes, 1);
    }

    fn instance_values(&self, name: &str) -> Vec<(i64, String)> {
        self.repository
            .instance_rows(OWNER, ATTEMPT)
            .into_iter()
            .filter(|row| row.name == name)
            .map(|row| (row.sequence_number.unwrap_or_default(), row.value))
            .collect()
    }
}

fn response(sequence: i64) -> BTreeMap<String, String> {
    BTreeMap::from([("_seqn".to_string(), sequence.to_string())])
}

#[tokio::test]
async fn test_initial_state_goes_to_the_attempt_snapshot() {
    let mut harness = Harness::new();
    harness.start().await;

    assert_eq!(
        harness.bag.get(ATTEMPT, "_isv_count").await.unwrap().as_deref(),
        Some("0")
    );
    assert_eq!(harness.repository.row_count(), 0);
}

#[tokio::test]
async fn test_steps_commit_instance_rows() {
    let mut harness = Harness::new();
    harness.start().await;

    let first = harness.commit_step(1).await;
    assert_eq!(first.instance_writes, 2);
    assert!(first.render_required);

    let second = harness.commit_step(2).await;
    assert_eq!(second.instance_writes, 2);

    assert_eq!(
        harness.instance_values("count"),
        vec![(1, "1".to_string()), (2, "2".to_string())]
    );
    assert_eq!(
        harness.instance_values(ACTIVE_STEP_MARKER),
        vec![(1, "true".to_string()), (2, "true".to_string())]
    );
}

#[tokio::test]
async fn test_marker_is_added_once_per_request() {
    let mut harness = Harness::new();
    harness.start().await;

    let mut store = harness.store(DEFINITIONS);
    store.load(1, &mut harness.structure).await.unwrap();
    let mut sequence = SequenceState::Step {
        number: 1,
        promoted: false,
    };
    harness.run(&mut store, Some(INCREMENT), &mut sequence, false).await;
    assert_eq!(
        sequence,
        SequenceState::Step {
            number: 1,
            promoted: true
        }
    );
    harness.run(&mut store, Some(INCREMENT), &mut sequence, false).await;

    assert_eq!(harness.instance_values(ACTIVE_STEP_MARKER).len(), 1);
    assert_eq!(harness.instance_values("count").len(), 2);
}

#[tokio::test]
async fn test_replayed_step_persists_nothing() {
    let mut harness = Harness::new();
    harness.start().await;
    for step in 1..=3 {
        harness.commit_step(step).await;
    }
    let rows = harness.repository.row_count();

    let mut store = harness.store(DEFINITIONS);
    let mut controller = SequenceController::new("_seqn");
    let identified = controller
        .identify(&response(3), &mut store, &mut harness.structure)
        .await
        .unwrap();
    assert!(identified.changed);
    assert!(identified.conflict);

    let conflict = controller.conflict();
    let outcome = harness
        .run(&mut store, Some(INCREMENT), controller.state_mut(), conflict)
        .await;

    assert_eq!(outcome, StoreOutcome::default());
    assert_eq!(harness.repository.row_count(), rows);
    // The in-request snapshot still follows the engine.
    assert_eq!(
        store.snapshot().unwrap().instance.get("count").map(String::as_str),
        Some("4")
    );
}

#[tokio::test]
async fn test_next_step_is_not_a_conflict() {
    let mut harness = Harness::new();
    harness.start().await;
    harness.commit_step(1).await;

    let mut store = harness.store(DEFINITIONS);
    let mut controller = SequenceController::new("_seqn");
    let identified = controller
        .identify(&response(2), &mut store, &mut harness.structure)
        .await
        .unwrap();
    assert!(!identified.conflict);
    assert_eq!(
        store.snapshot().unwrap().instance.get("count").map(String::as_str),
        Some("1")
    );
    assert_eq!(controller.witness(&response(2)), 3);
}

#[tokio::test]
async fn test_load_is_idempotent_and_relocks_backwards() {
    let mut harness = Harness::new();
    harness.start().await;
    harness.commit_step(1).await;
    harness.commit_step(2).await;

    let mut store = harness.store(DEFINITIONS);
    assert_eq!(
        store.load(2, &mut harness.structure).await.unwrap(),
        LoadOutcome::Loaded
    );
    assert_eq!(
        store.load(2, &mut harness.structure).await.unwrap(),
        LoadOutcome::Unchanged
    );
    let count = |store: &StateScopeStore| {
        store
            .snapshot()
            .and_then(|snapshot| snapshot.instance.get("count").cloned())
    };
    assert_eq!(count(&store).as_deref(), Some("2"));

    assert_eq!(
        store.load(1, &mut harness.structure).await.unwrap(),
        LoadOutcome::Loaded
    );
    assert_eq!(store.snapshot().unwrap().lock, Some(1));
    assert_eq!(count(&store).as_deref(), Some("1"));
}

#[tokio::test]
async fn test_review_offset_shows_state_after_the_step() {
    let mut harness = Harness::new();
    harness.start().await;
    harness.commit_step(1).await;
    harness.commit_step(2).await;

    let count = |store: &StateScopeStore| {
        store
            .snapshot()
            .and_then(|snapshot| snapshot.instance.get("count").cloned())
    };

    let mut entry = harness.store(DEFINITIONS);
    entry.load(1, &mut harness.structure).await.unwrap();
    assert_eq!(count(&entry).as_deref(), Some("1"));

    let mut review = harness.store(DEFINITIONS);
    review.set_state_offset(1);
    review.load(1, &mut harness.structure).await.unwrap();
    assert_eq!(count(&review).as_deref(), Some("2"));
}

#[tokio::test]
async fn test_global_values_are_written_only_when_changed() {
    let harness = Harness::new();
    let definitions = "stack_state_declare(\"rw\",\"global\",\"visits\",0)";
    let mut store = harness.store(definitions);
    let mut structure = QuestionStructure::default();
    store.load(1, &mut structure).await.unwrap();

    let options = CasOptions::default();
    let run = |store: &StateScopeStore| {
        let mut session =
            EvaluationSession::new(store.generate_load_commands(&structure), options.clone(), 1);
        session.add_statement(Statement::generated(
            "stack_state_set(\"global\",\"visits\",5)",
            "update",
        ));
        session.add_statement(state_export_statement());
        session
    };

    let mut session = run(&store);
    session.instantiate(harness.engine.as_ref()).await.unwrap();
    let export = session.get_value_text(STATE_EXPORT_KEY).unwrap().to_string();
    let mut sequence = SequenceState::Step {
        number: 1,
        promoted: false,
    };
    let outcome = store.store(&export, &mut sequence, false, false).await.unwrap();
    assert_eq!(outcome.global_writes, 1);
    assert_eq!(harness.repository.global_value(OWNER, "visits").as_deref(), Some("5"));

    let mut session = run(&store);
    session.instantiate(harness.engine.as_ref()).await.unwrap();
    let export = session.get_value_text(STATE_EXPORT_KEY).unwrap().to_string();
    let outcome = store.store(&export, &mut sequence, false, false).await.unwrap();
    assert_eq!(outcome.global_writes, 0);
}

#[test]
fn test_unknown_scope_is_reported() {
    let harness = Harness::new();
    let store = harness.store(
        "stack_state_declare(\"rw\",\"foo\",\"x\",1); y: stack_state_get(\"foo\",\"y\")",
    );
    let errors: Vec<String> = store
        .declaration_errors()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|error| error.contains("'foo'")));
    assert!(!store.has_writable_state_variables());
}
