use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use stackstate::{
    cas::{
        codec::{OUTPUT_BEGINS, OUTPUT_ENDS},
        expression::{BinaryOp, UnaryOp},
        parse_expression,
        text::{matching_paren, MaskedText},
        CasConnection, ConnectionError, Expression,
    },
    prt::{PotentialResponseTree, PrtError, PrtResult},
    response::{Input, InputState, InputStatus, Response},
    state::{state_export_statement, STATE_EXPORT_KEY},
    CasOptions, EvaluationSession, Statement,
};

lazy_static! {
    static ref VALUE_KEY: Regex =
        Regex::new(r"stackmap_set\(_RAW_VALUES,(\[STR:\d+\]),string\(").unwrap();
}

const STATEMENT_START: &str = "_EC(errcatch(";

/// A tiny engine: integer arithmetic, strings and the state primitives.
#[derive(Default)]
pub struct FakeEngine {
    calls: AtomicUsize,
    programs: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_program(&self) -> Option<String> {
        self.programs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl CasConnection for FakeEngine {
    async fn execute(&self, command: &str) -> Result<String, ConnectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.programs.lock().unwrap().push(command.to_string());
        Ok(run_program(command))
    }
}

#[derive(Default)]
struct Interpreter {
    env: HashMap<String, Expression>,
    state: Vec<(String, String, Expression, bool)>,
}

impl Interpreter {
    fn state_slot(&mut self, scope: &str, name: &str) -> Option<&mut (String, String, Expression, bool)> {
        self.state
            .iter_mut()
            .find(|(s, n, _, _)| s == scope && n == name)
    }

    fn put_state(&mut self, scope: &str, name: &str, value: Expression, changed: bool) {
        match self.state_slot(scope, name) {
            Some(slot) => {
                slot.2 = value;
                slot.3 |= changed;
            }
            None => self
                .state
                .push((scope.to_string(), name.to_string(), value, changed)),
        }
    }

    fn eval(&mut self, expression: &Expression) -> Result<Expression, String> {
        match expression {
            Expression::Symbol(name) => Ok(self
                .env
                .get(name)
                .cloned()
                .unwrap_or_else(|| expression.clone())),
            Expression::List(items) => Ok(Expression::List(
                items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<_, _>>()?,
            )),
            Expression::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match (op, value.as_integer()) {
                    (UnaryOp::Neg, Some(n)) => Ok(Expression::Integer(-n)),
                    _ => Ok(Expression::unary(*op, value)),
                }
            }
            Expression::Binary {
                op: BinaryOp::Assign,
                lhs,
                rhs,
            } => {
                let value = self.eval(rhs)?;
                if let Expression::Symbol(name) = lhs.as_ref() {
                    self.env.insert(name.clone(), value.clone());
                }
                Ok(value)
            }
            Expression::Binary { op, lhs, rhs } => {
                let (lhs, rhs) = (self.eval(lhs)?, self.eval(rhs)?);
                let (Some(a), Some(b)) = (lhs.as_integer(), rhs.as_integer()) else {
                    return Ok(Expression::binary(*op, lhs, rhs));
                };
                match op {
                    BinaryOp::Add => Ok(Expression::Integer(a + b)),
                    BinaryOp::Sub => Ok(Expression::Integer(a - b)),
                    BinaryOp::Mul => Ok(Expression::Integer(a * b)),
                    BinaryOp::Div if b == 0 => Err("Division by 0".to_string()),
                    BinaryOp::Div => Ok(Expression::Integer(a / b)),
                    _ => Ok(Expression::binary(*op, lhs, rhs)),
                }
            }
            Expression::Call { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, args)
            }
            other => Ok(other.clone()),
        }
    }

    fn call(&mut self, name: &str, args: Vec<Expression>) -> Result<Expression, String> {
        let text = |index: usize| -> String {
            args.get(index)
                .map(|arg| arg.as_str().map(str::to_string).unwrap_or_else(|| arg.to_string()))
                .unwrap_or_default()
        };
        match name {
            "error" => Err(text(0)),
            "string" => Ok(Expression::Str(text(0))),
            "sconcat" => Ok(Expression::Str((0..args.len()).map(text).collect())),
            "stack_state_load" => {
                let value = args.get(2).cloned().unwrap_or(Expression::Bool(false));
                self.put_state(&text(0), &text(1), value.clone(), false);
                Ok(value)
            }
            "stack_state_declare" => {
                let (scope, var) = (text(1), text(2));
                if self.state_slot(&scope, &var).is_none() {
                    let value = args.get(3).cloned().unwrap_or(Expression::Bool(false));
                    self.put_state(&scope, &var, value, false);
                }
                Ok(Expression::Bool(true))
            }
            "stack_state_get" => Ok(self
                .state_slot(&text(0), &text(1))
                .map(|slot| slot.2.clone())
                .unwrap_or(Expression::Bool(false))),
            "stack_state_set" => {
                let value = args.get(2).cloned().unwrap_or(Expression::Bool(false));
                self.put_state(&text(0), &text(1), value.clone(), true);
                Ok(value)
            }
            "stack_state_load_prt" | "stack_state_update_prt" => Ok(Expression::Bool(true)),
            "stack_state_full_state" => Ok(Expression::List(
                self.state
                    .iter()
                    .map(|(scope, var, value, changed)| {
                        Expression::call(
                            "stackstatevar",
                            vec![
                                Expression::Str(scope.clone()),
                                Expression::Str(var.clone()),
                                value.clone(),
                                Expression::Bool(*changed),
                            ],
                        )
                    })
                    .collect(),
            )),
            _ => Ok(Expression::call(name, args)),
        }
    }
}

fn run_program(command: &str) -> String {
    let masked = MaskedText::new(command);
    let source = masked.masked();
    let mut interpreter = Interpreter::default();
    let mut errors = Vec::new();

    let mut from = 0;
    while let Some(found) = source[from..].find(STATEMENT_START) {
        let open = from + found + STATEMENT_START.len() - 1;
        let Some(close) = matching_paren(source, open) else {
            break;
        };
        from = close;
        let form = masked.restore(&source[open + 1..close], true);
        let trailer: Vec<&str> = source[close + 1..]
            .trim_start_matches(',')
            .split(')')
            .next()
            .unwrap_or_default()
            .split(',')
            .collect();
        let context = masked.restore(trailer.first().copied().unwrap_or_default(), false);
        let index: usize = trailer.get(1).and_then(|i| i.trim().parse().ok()).unwrap_or(0);

        let outcome = parse_expression(&form)
            .map_err(|e| e.to_string())
            .and_then(|expression| interpreter.eval(&expression));
        if let Err(message) = outcome {
            errors.push(json!([[message], context, index]));
        }
    }

    let mut values = serde_json::Map::new();
    values.insert("__stackmaximaversion".to_string(), json!("2024072400"));
    for capture in VALUE_KEY.captures_iter(source) {
        let key = masked.restore(&capture[1], false);
        let value = interpreter
            .env
            .get(&key)
            .map(ToString::to_string)
            .unwrap_or_else(|| key.clone());
        values.insert(key, json!(value));
    }

    let record = json!({"timeout": false, "values": values, "errors": errors});
    format!(
        "(%i1) batch\n{}\n{}\n{}\n(%o2) done\n",
        OUTPUT_BEGINS, record, OUTPUT_ENDS
    )
}

/// Accepts anything that parses, rejecting names bound by the question.
pub struct FakeInput {
    name: String,
    teacher_answer: String,
}

impl FakeInput {
    pub fn new(name: &str, teacher_answer: &str) -> Arc<dyn Input> {
        Arc::new(Self {
            name: name.to_string(),
            teacher_answer: teacher_answer.to_string(),
        })
    }
}

#[async_trait]
impl Input for FakeInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn teacher_answer(&self) -> &str {
        &self.teacher_answer
    }

    async fn validate_student_response(
        &self,
        response: &Response,
        _options: &CasOptions,
        _teacher_answer: Option<&Expression>,
        forbidden_keys: &[String],
    ) -> InputState {
        let raw = response.get(&self.name).map(|s| s.trim()).unwrap_or_default();
        if raw.is_empty() {
            return InputState::new(InputStatus::Blank, Vec::new(), "");
        }
        let contents = vec![raw.to_string()];
        if forbidden_keys.iter().any(|key| key == raw) {
            return InputState::new(InputStatus::Invalid, contents, "")
                .with_errors(format!("Forbidden variable {}", raw));
        }
        match parse_expression(raw) {
            Ok(expression) => InputState::new(InputStatus::Score, contents, expression.to_string()),
            Err(e) => InputState::new(InputStatus::Invalid, contents, "").with_errors(e.to_string()),
        }
    }
}

/// Compares one input with one question variable, optionally running a state
/// update first.
pub struct FakePrt {
    name: String,
    input: String,
    expected: String,
    update: Option<String>,
    engine: Arc<FakeEngine>,
}

impl FakePrt {
    pub fn new(name: &str, input: &str, expected: &str, engine: Arc<FakeEngine>) -> Self {
        Self {
            name: name.to_string(),
            input: input.to_string(),
            expected: expected.to_string(),
            update: None,
            engine,
        }
    }

    pub fn with_update(mut self, update: &str) -> Self {
        self.update = Some(update.to_string());
        self
    }

    pub fn shared(self) -> Arc<dyn PotentialResponseTree> {
        Arc::new(self)
    }
}

#[async_trait]
impl PotentialResponseTree for FakePrt {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> f64 {
        1.0
    }

    fn required_variables(&self, input_names: &[String]) -> Vec<String> {
        input_names
            .iter()
            .filter(|name| **name == self.input)
            .cloned()
            .collect()
    }

    async fn evaluate(
        &self,
        mut session: EvaluationSession,
        _options: &CasOptions,
        inputs: &BTreeMap<String, String>,
        _seed: i64,
    ) -> Result<PrtResult, PrtError> {
        for (name, value) in inputs {
            session.add_statement(Statement::generated(
                format!("{}:({})", name, value),
                format!("{}/input", self.name),
            ));
        }
        if let Some(update) = &self.update {
            session.add_statement(Statement::generated(update.clone(), format!("{}/update", self.name)));
        }
        let sans = format!("{}sans", self.name);
        let tans = format!("{}tans", self.name);
        session.add_statement(Statement::generated(self.input.clone(), self.name.clone()).with_key(&sans));
        session.add_statement(Statement::generated(self.expected.clone(), self.name.clone()).with_key(&tans));
        session.add_statement(state_export_statement());

        session.instantiate(self.engine.as_ref()).await?;

        let errors: Vec<String> = session
            .statements()
            .iter()
            .flat_map(|statement| statement.errors().map(ToString::to_string))
            .collect();
        let correct = session.get_value_text(&sans).is_some()
            && session.get_value_text(&sans) == session.get_value_text(&tans);
        Ok(PrtResult {
            valid: Some(errors.is_empty()),
            fraction: if correct { 1.0 } else { 0.0 },
            feedback: vec![if correct { "Correct" } else { "Incorrect" }.to_string()],
            errors,
            state_export: session.get_value_text(STATE_EXPORT_KEY).map(str::to_string),
            ..PrtResult::not_executed(self.name.clone(), self.value())
        })
    }
}
