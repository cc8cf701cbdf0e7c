use pretty_assertions::assert_eq;
use stackstate::{
    cas::{ErrorKind, KeyVal, SecurityLevel},
    CasOptions, EvaluationSession, Statement,
};

use super::fakes::FakeEngine;

fn teacher(source: &str, context: &str) -> Statement {
    Statement::new(source, context, SecurityLevel::Teacher)
}

#[tokio::test]
async fn test_failing_statement_does_not_stop_the_batch() {
    let engine = FakeEngine::new();
    let mut session = EvaluationSession::new(
        vec![
            teacher("a: 2", "qv/0"),
            teacher("b: 1/0", "qv/1"),
            teacher("c: a + 3", "qv/2"),
        ],
        CasOptions::default(),
        7,
    );

    session.instantiate(engine.as_ref()).await.unwrap();

    assert_eq!(engine.calls(), 1);
    assert!(!session.is_valid());
    assert_eq!(session.get_value("a").and_then(|v| v.as_integer()), Some(2));
    assert_eq!(session.get_value("c").and_then(|v| v.as_integer()), Some(5));

    let failed = session.get_statement("b").unwrap();
    let errors: Vec<&ErrorKind> = failed.errors().collect();
    assert_eq!(errors, vec![&ErrorKind::Engine("Division by 0".to_string())]);
    assert_eq!(session.errors().len(), 1);
    assert_eq!(session.errors()[0].statement, 1);
    assert_eq!(session.errors()[0].context, "qv/1");
    assert_eq!(session.engine_version(), Some("2024072400"));
}

#[tokio::test]
async fn test_instantiate_is_idempotent() {
    let engine = FakeEngine::new();
    let mut session = EvaluationSession::new(vec![teacher("a: 1", "qv/0")], CasOptions::default(), 1);

    session.instantiate(engine.as_ref()).await.unwrap();
    session.instantiate(engine.as_ref()).await.unwrap();
    assert_eq!(engine.calls(), 1);

    session.add_statement(teacher("b: a*4", "qv/1"));
    session.instantiate(engine.as_ref()).await.unwrap();
    assert_eq!(engine.calls(), 2);
    assert_eq!(session.get_value_text("b"), Some("4"));
}

#[tokio::test]
async fn test_empty_session_never_reaches_engine() {
    let engine = FakeEngine::new();
    let mut session = EvaluationSession::new(Vec::new(), CasOptions::default(), 1);
    session.instantiate(engine.as_ref()).await.unwrap();
    assert_eq!(engine.calls(), 0);
    assert!(session.is_instantiated());
    assert!(session.get_all_keys().is_empty());
}

#[tokio::test]
async fn test_invalid_statement_is_rejected_locally() {
    let engine = FakeEngine::new();
    let mut session = EvaluationSession::new(
        vec![teacher("a: 1", "qv/0"), teacher("b: system(\"ls\")", "qv/1")],
        CasOptions::default(),
        1,
    );
    assert!(session.instantiate(engine.as_ref()).await.is_err());
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn test_keyval_session_values() {
    let engine = FakeEngine::new();
    let keyval = KeyVal::new(
        "n: 3; /* comment */ m: n*n\nlabel: sconcat(\"n=\", n)",
        "questionvariables",
        SecurityLevel::Teacher,
    );
    assert!(keyval.is_valid());

    let mut session = keyval.session(&CasOptions::default(), 1);
    session.instantiate(engine.as_ref()).await.unwrap();

    assert_eq!(session.get_all_keys(), vec!["n", "m", "label"]);
    assert_eq!(session.get_value_text("m"), Some("9"));
    assert_eq!(session.get_value("label").and_then(|v| v.as_str()), Some("n=3"));
    assert!(engine.last_program().unwrap().contains("stack_randseed(1)"));
}
