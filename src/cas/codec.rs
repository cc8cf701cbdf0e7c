//! # Engine Protocol Codec
//!
//! Turns a batch of [`Statement`]s into one engine program and turns the
//! engine's printed output back into typed per-statement results.
//!
//! The program is a single guarded block. Each statement runs inside
//! `errcatch`, and a failure appends `[errors, context, index]` to an
//! accumulator instead of aborting, so every independent statement still
//! produces a value. The response record is printed between two sentinel
//! lines so incidental engine output around it is ignored.

use std::collections::{BTreeMap, BTreeSet};

use nom::{
    bytes::complete::{tag, take_until},
    error::{context, convert_error, VerboseError},
    sequence::{pair, preceded, terminated},
    IResult,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::{
    expression::{parse_expression, Expression},
    options::CasOptions,
    statement::{ErrorKind, Statement},
    text::to_engine_string,
};

pub const OUTPUT_BEGINS: &str = "STACK-OUTPUT-BEGINS>";
pub const OUTPUT_ENDS: &str = "<STACK-OUTPUT-ENDS";
/// Reserved value carrying the engine library version.
pub const ENGINE_VERSION_KEY: &str = "__stackmaximaversion";

const PREAMBLE: &str =
    "_EC(ec,sco,sta):=if is(ec=[]) then (_ERR:append(_ERR,[[error,sco,sta]]),false) else true$";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Engine output is not framed by the output sentinels: {0}")]
    Framing(String),
    #[error("Malformed response record: {0}")]
    Record(String),
}

/// One entry of the engine's error list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineErrorRecord {
    pub statement: usize,
    pub context: String,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedResponse {
    pub timed_out: bool,
    pub errors: Vec<EngineErrorRecord>,
    pub values: BTreeMap<String, Expression>,
    /// Every value as printed by the engine, parseable or not.
    pub raw_values: BTreeMap<String, String>,
    pub presentation: BTreeMap<String, String>,
    pub engine_version: Option<String>,
}

impl DecodedResponse {
    /// The outcome of a batch the engine never finished.
    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    /// Engine errors grouped by statement index.
    pub fn errors_by_statement(&self) -> BTreeMap<usize, Vec<ErrorKind>> {
        let mut grouped: BTreeMap<usize, Vec<ErrorKind>> = BTreeMap::new();
        for record in &self.errors {
            grouped
                .entry(record.statement)
                .or_default()
                .extend(record.messages.iter().cloned().map(ErrorKind::Engine));
        }
        grouped
    }

    /// Keys whose printed value did not parse as an expression.
    pub fn unparsed_keys(&self) -> BTreeSet<&str> {
        self.raw_values
            .keys()
            .filter(|key| !self.values.contains_key(*key))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    timeout: bool,
    #[serde(default)]
    values: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    presentation: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    errors: Vec<RawError>,
}

#[derive(Deserialize)]
struct RawError(serde_json::Value, serde_json::Value, usize);

type ParserResult<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

fn framed_record(input: &str) -> ParserResult<&str> {
    context(
        "output record",
        preceded(
            pair(take_until(OUTPUT_BEGINS), tag(OUTPUT_BEGINS)),
            terminated(take_until(OUTPUT_ENDS), tag(OUTPUT_ENDS)),
        ),
    )(input)
}

pub struct CasProtocolCodec;

impl CasProtocolCodec {
    /// Builds the engine program for `statements`.
    #[tracing::instrument(level = "debug", skip(statements, options), fields(statements = statements.len()))]
    pub fn encode(statements: &[Statement], options: &CasOptions, seed: i64) -> String {
        let mut value_keys: Vec<&str> = Vec::new();
        let mut presentation_keys: Vec<&str> = Vec::new();
        for statement in statements {
            if let Some(key) = statement.key() {
                if !value_keys.contains(&key) {
                    value_keys.push(key);
                }
                if statement.wants_presentation() && !presentation_keys.contains(&key) {
                    presentation_keys.push(key);
                }
            }
        }

        let mut command = String::from(PREAMBLE);
        command.push_str(&format!("block([],stack_randseed({})", seed));
        command.push_str(&options.csvars());
        command.push_str(",_ERR:[],_RESPONSE:[\"stack_map\"],_RAW_VALUES:[\"stack_map\"]");
        if !presentation_keys.is_empty() {
            command.push_str(",_LATEX_VALUES:[\"stack_map\"]");
        }
        command.push_str(&format!(
            ",_RAW_VALUES:stackmap_set(_RAW_VALUES,{},stackmaximaversion)",
            to_engine_string(ENGINE_VERSION_KEY)
        ));

        for (index, statement) in statements.iter().enumerate() {
            command.push_str(&format!(
                ",_EC(errcatch({}),{},{})",
                statement.evaluation_form(),
                to_engine_string(statement.context()),
                index
            ));
        }

        for key in &value_keys {
            command.push_str(&format!(
                ",_RAW_VALUES:stackmap_set(_RAW_VALUES,{},string({}))",
                to_engine_string(key),
                key
            ));
        }
        for key in &presentation_keys {
            command.push_str(&format!(
                ",_LATEX_VALUES:stackmap_set(_LATEX_VALUES,{},tex1({}))",
                to_engine_string(key),
                key
            ));
        }

        command.push_str(",_RESPONSE:stackmap_set(_RESPONSE,\"timeout\",false)");
        command.push_str(",_RESPONSE:stackmap_set(_RESPONSE,\"values\",_RAW_VALUES)");
        if !presentation_keys.is_empty() {
            command.push_str(",_RESPONSE:stackmap_set(_RESPONSE,\"presentation\",_LATEX_VALUES)");
        }
        command.push_str(",if length(_ERR)>0 then _RESPONSE:stackmap_set(_RESPONSE,\"errors\",_ERR)");
        command.push_str(&format!(
            ",print({}),print(stackjson_stringify(_RESPONSE)),print({}))$",
            to_engine_string(OUTPUT_BEGINS),
            to_engine_string(OUTPUT_ENDS)
        ));
        command
    }

    /// Extracts and parses the response record from raw engine output.
    #[tracing::instrument(level = "debug", skip(raw))]
    pub fn decode(raw: &str) -> Result<DecodedResponse, ProtocolError> {
        let record = match framed_record(raw) {
            Ok((_, record)) => record.trim(),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                return Err(ProtocolError::Framing(convert_error(raw, e)))
            }
            Err(nom::Err::Incomplete(_)) => {
                return Err(ProtocolError::Framing("incomplete output".to_string()))
            }
        };

        let record: RawRecord =
            serde_json::from_str(record).map_err(|e| ProtocolError::Record(e.to_string()))?;
        if record.timeout {
            return Ok(DecodedResponse::timed_out());
        }

        let mut decoded = DecodedResponse::default();
        for (key, value) in record.values {
            let serde_json::Value::String(text) = value else {
                continue;
            };
            if key == ENGINE_VERSION_KEY {
                decoded.engine_version = Some(text);
                continue;
            }
            match parse_expression(&text) {
                Ok(expression) => {
                    decoded.values.insert(key.clone(), expression);
                }
                Err(e) => warn!("Unparseable engine value for {}: {}", key, e),
            }
            decoded.raw_values.insert(key, text);
        }
        for (key, value) in record.presentation {
            if let serde_json::Value::String(text) = value {
                decoded.presentation.insert(key, text);
            }
        }
        decoded.errors = record
            .errors
            .into_iter()
            .map(|RawError(messages, context, statement)| EngineErrorRecord {
                statement,
                context: json_text(&context),
                messages: flatten_messages(messages),
            })
            .collect();
        Ok(decoded)
    }

    /// Writes a decoded response into the statements it was produced for.
    pub fn apply(statements: &mut [Statement], decoded: &DecodedResponse) {
        if decoded.timed_out {
            for statement in statements.iter_mut() {
                statement.apply_outcome(vec![ErrorKind::TimedOut], None, None, None);
            }
            return;
        }

        let mut by_statement = decoded.errors_by_statement();
        for (index, statement) in statements.iter_mut().enumerate() {
            let mut errors = by_statement.remove(&index).unwrap_or_default();
            let (text, value, presentation) = match statement.key() {
                Some(key) => {
                    let text = decoded.raw_values.get(key).cloned();
                    let value = decoded.values.get(key).cloned();
                    if let (Some(text), None) = (&text, &value) {
                        errors.push(ErrorKind::UnparseableValue {
                            key: key.to_string(),
                            value: text.clone(),
                        });
                    }
                    let presentation = if statement.wants_presentation() {
                        decoded.presentation.get(key).cloned()
                    } else {
                        None
                    };
                    (text, value, presentation)
                }
                None => (None, None, None),
            };
            statement.apply_outcome(errors, text, value, presentation);
        }
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flatten_messages(value: serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(json_text).collect(),
        serde_json::Value::Null => Vec::new(),
        other => vec![json_text(&other)],
    }
}
