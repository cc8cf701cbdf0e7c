//! # Engine Expressions
//!
//! A typed tree for the subset of the computer-algebra engine's syntax that
//! question authors write and that the engine prints back. The same grammar is
//! used twice: to validate statements locally before a batch is dispatched,
//! and to re-parse the textual values in the engine's response so callers can
//! work with structured values instead of opaque strings.
//!
//! Precedence, from loosest to tightest binding:
//!
//! ```text
//! :  :=            (right associative)
//! or
//! and
//! not              (prefix)
//! = # < > <= >=    (non associative)
//! + -
//! * / .
//! - +              (prefix)
//! ^ ** ^^          (right associative)
//! !  [..]  (..)    (postfix)
//! ```
//!
//! `if` and `for`/`while`/`unless`/`do` loops bind loosest of all; their last
//! branch or body extends as far right as possible.

use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{anychar, char, digit0, digit1, multispace0, none_of, one_of, satisfy},
    combinator::{all_consuming, map, not, opt, peek, recognize, value},
    error::{context, convert_error, VerboseError},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::text::{from_engine_string, to_engine_string};

type ParserResult<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "if", "then", "else", "elseif", "for", "from", "in", "step", "next",
    "thru", "while", "unless", "do",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Empty expression")]
    Empty,
    #[error("Syntax error in '{source_text}': {message}")]
    Syntax { source_text: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum UnaryOp {
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "not ")]
    Not,
    #[strum(serialize = "'")]
    Quote,
    #[strum(serialize = "!")]
    Factorial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum BinaryOp {
    #[strum(serialize = ":")]
    Assign,
    #[strum(serialize = ":=")]
    Define,
    #[strum(serialize = " or ")]
    Or,
    #[strum(serialize = " and ")]
    And,
    #[strum(serialize = "=")]
    Eq,
    #[strum(serialize = "#")]
    NotEq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = ".")]
    Dot,
    #[strum(serialize = "^")]
    Pow,
    #[strum(serialize = "^^")]
    NcPow,
}

/// A clause of a `for`/`while`/`unless`/`do` loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum LoopClause {
    /// Initial value of the control variable, `for i: 1`.
    #[strum(serialize = ":")]
    From,
    #[strum(serialize = " in ")]
    In,
    #[strum(serialize = " step ")]
    Step,
    #[strum(serialize = " next ")]
    Next,
    #[strum(serialize = " thru ")]
    Thru,
    #[strum(serialize = " while ")]
    While,
    #[strum(serialize = " unless ")]
    Unless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Left,
    Right,
    None,
}

impl BinaryOp {
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Assign | BinaryOp::Define => 10,
            BinaryOp::Or => 20,
            BinaryOp::And => 30,
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::Gt
            | BinaryOp::Le
            | BinaryOp::Ge => 40,
            BinaryOp::Add | BinaryOp::Sub => 50,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Dot => 60,
            BinaryOp::Pow | BinaryOp::NcPow => 70,
        }
    }

    fn assoc(self) -> Assoc {
        match self {
            BinaryOp::Assign | BinaryOp::Define | BinaryOp::Pow | BinaryOp::NcPow => Assoc::Right,
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::Gt
            | BinaryOp::Le
            | BinaryOp::Ge => Assoc::None,
            _ => Assoc::Left,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Integer(i64),
    /// Integer literal outside the `i64` range, kept as digits.
    BigInteger(String),
    Float(f64),
    Str(String),
    Bool(bool),
    Symbol(String),
    List(Vec<Expression>),
    Set(Vec<Expression>),
    Call {
        name: String,
        args: Vec<Expression>,
    },
    Index {
        target: Box<Expression>,
        indices: Vec<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    If {
        branches: Vec<(Expression, Expression)>,
        otherwise: Option<Box<Expression>>,
    },
    /// Parenthesised comma sequence, `(a: 1, a + 1)`. Its value is the last item.
    Sequence(Vec<Expression>),
    Loop {
        variable: Option<String>,
        clauses: Vec<(LoopClause, Expression)>,
        body: Box<Expression>,
    },
}

impl Expression {
    pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Self {
        Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Self {
        Expression::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::Call {
            name: name.into(),
            args,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Expression::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expression::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Expression::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Name bound by a top-level `name: value` assignment.
    pub fn assigned_name(&self) -> Option<&str> {
        match self {
            Expression::Binary {
                op: BinaryOp::Assign,
                lhs,
                ..
            } => match lhs.as_ref() {
                Expression::Symbol(name) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Visits this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expression)) {
        visit(self);
        match self {
            Expression::List(items) | Expression::Set(items) | Expression::Sequence(items) => {
                items.iter().for_each(|item| item.walk(visit))
            }
            Expression::Call { args, .. } => args.iter().for_each(|arg| arg.walk(visit)),
            Expression::Index { target, indices } => {
                target.walk(visit);
                indices.iter().for_each(|index| index.walk(visit));
            }
            Expression::Unary { operand, .. } => operand.walk(visit),
            Expression::Binary { lhs, rhs, .. } => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            Expression::If {
                branches,
                otherwise,
            } => {
                for (condition, value) in branches {
                    condition.walk(visit);
                    value.walk(visit);
                }
                if let Some(otherwise) = otherwise {
                    otherwise.walk(visit);
                }
            }
            Expression::Loop { clauses, body, .. } => {
                clauses.iter().for_each(|(_, value)| value.walk(visit));
                body.walk(visit);
            }
            _ => {}
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expression::Integer(n) if *n < 0 => 65,
            Expression::Float(f) if *f < 0.0 => 65,
            Expression::BigInteger(digits) if digits.starts_with('-') => 65,
            Expression::Binary { op, .. } => op.precedence(),
            Expression::Unary { op, .. } => match op {
                UnaryOp::Not => 35,
                UnaryOp::Neg | UnaryOp::Plus => 65,
                UnaryOp::Quote | UnaryOp::Factorial => 80,
            },
            Expression::If { .. } | Expression::Loop { .. } => 5,
            _ => 100,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Integer(n) => write!(f, "{}", n),
            Expression::BigInteger(digits) => write!(f, "{}", digits),
            Expression::Float(x) => write!(f, "{:?}", x),
            Expression::Str(s) => write!(f, "{}", to_engine_string(s)),
            Expression::Bool(b) => write!(f, "{}", b),
            Expression::Symbol(name) => write!(f, "{}", name),
            Expression::List(items) => write!(f, "[{}]", join(items)),
            Expression::Set(items) => write!(f, "{{{}}}", join(items)),
            Expression::Call { name, args } => write!(f, "{}({})", name, join(args)),
            Expression::Index { target, indices } => {
                write_operand(f, target, 80, false)?;
                write!(f, "[{}]", join(indices))
            }
            Expression::Unary { op, operand } => match op {
                UnaryOp::Factorial => {
                    write_operand(f, operand, 80, false)?;
                    write!(f, "!")
                }
                _ => {
                    write!(f, "{}", op)?;
                    write_operand(f, operand, self.precedence(), false)
                }
            },
            Expression::Binary { op, lhs, rhs } => {
                let prec = op.precedence();
                let assoc = op.assoc();
                write_operand(f, lhs, prec, assoc != Assoc::Left)?;
                write!(f, "{}", op)?;
                write_operand(f, rhs, prec, assoc != Assoc::Right)
            }
            Expression::If {
                branches,
                otherwise,
            } => {
                for (i, (condition, value)) in branches.iter().enumerate() {
                    let keyword = if i == 0 { "if" } else { " elseif" };
                    write!(f, "{} {} then {}", keyword, condition, value)?;
                }
                if let Some(otherwise) = otherwise {
                    write!(f, " else {}", otherwise)?;
                }
                Ok(())
            }
            Expression::Sequence(items) => write!(f, "({})", join(items)),
            Expression::Loop {
                variable,
                clauses,
                body,
            } => {
                let mut head = variable
                    .as_ref()
                    .map(|name| format!("for {}", name))
                    .unwrap_or_default();
                for (clause, value) in clauses {
                    head.push_str(&format!("{}{}", clause, value));
                }
                let head = head.trim_start();
                if head.is_empty() {
                    write!(f, "do {}", body)
                } else {
                    write!(f, "{} do {}", head, body)
                }
            }
        }
    }
}

fn join(items: &[Expression]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn write_operand(
    f: &mut fmt::Formatter<'_>,
    operand: &Expression,
    parent: u8,
    wrap_equal: bool,
) -> fmt::Result {
    let child = operand.precedence();
    if child < parent || (child == parent && wrap_equal) {
        write!(f, "({})", operand)
    } else {
        write!(f, "{}", operand)
    }
}

/// Parses a complete engine expression.
#[tracing::instrument(level = "trace")]
pub fn parse_expression(source: &str) -> Result<Expression, ExpressionError> {
    if source.trim().is_empty() {
        return Err(ExpressionError::Empty);
    }
    match all_consuming(ws(parse_assign))(source) {
        Ok((_, expression)) => Ok(expression),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ExpressionError::Syntax {
            source_text: source.to_string(),
            message: convert_error(source, e),
        }),
        Err(nom::Err::Incomplete(_)) => Err(ExpressionError::Syntax {
            source_text: source.to_string(),
            message: "incomplete input".to_string(),
        }),
    }
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> ParserResult<'a, O>
where
    F: FnMut(&'a str) -> ParserResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '%'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '%'
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> ParserResult<'a, &'a str> {
    terminated(tag(word), not(peek(satisfy(is_ident_char))))
}

fn binary_chain<'a>(
    input: &'a str,
    operand: fn(&'a str) -> ParserResult<'a, Expression>,
    operator: fn(&'a str) -> ParserResult<'a, BinaryOp>,
) -> ParserResult<'a, Expression> {
    let (input, first) = operand(input)?;
    let (input, rest) = many0(pair(ws(operator), operand))(input)?;
    let folded = rest
        .into_iter()
        .fold(first, |lhs, (op, rhs)| Expression::binary(op, lhs, rhs));
    Ok((input, folded))
}

fn parse_assign(input: &str) -> ParserResult<Expression> {
    let (input, lhs) = parse_or(input)?;
    let (input, tail) = opt(pair(
        ws(alt((
            value(BinaryOp::Define, tag(":=")),
            value(BinaryOp::Assign, char(':')),
        ))),
        parse_assign,
    ))(input)?;
    Ok(match tail {
        Some((op, rhs)) => (input, Expression::binary(op, lhs, rhs)),
        None => (input, lhs),
    })
}

fn parse_or(input: &str) -> ParserResult<Expression> {
    binary_chain(input, parse_and, |i| value(BinaryOp::Or, keyword("or"))(i))
}

fn parse_and(input: &str) -> ParserResult<Expression> {
    binary_chain(input, parse_not, |i| value(BinaryOp::And, keyword("and"))(i))
}

fn parse_not(input: &str) -> ParserResult<Expression> {
    alt((
        map(preceded(ws(keyword("not")), parse_not), |operand| {
            Expression::unary(UnaryOp::Not, operand)
        }),
        parse_comparison,
    ))(input)
}

fn comparison_op(input: &str) -> ParserResult<BinaryOp> {
    alt((
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Lt, char('<')),
        value(BinaryOp::Gt, char('>')),
        value(BinaryOp::Eq, char('=')),
        value(BinaryOp::NotEq, char('#')),
    ))(input)
}

fn parse_comparison(input: &str) -> ParserResult<Expression> {
    let (input, lhs) = parse_additive(input)?;
    let (input, tail) = opt(pair(ws(comparison_op), parse_additive))(input)?;
    Ok(match tail {
        Some((op, rhs)) => (input, Expression::binary(op, lhs, rhs)),
        None => (input, lhs),
    })
}

fn parse_additive(input: &str) -> ParserResult<Expression> {
    binary_chain(input, parse_multiplicative, |i| {
        alt((
            value(BinaryOp::Add, char('+')),
            value(BinaryOp::Sub, char('-')),
        ))(i)
    })
}

fn parse_multiplicative(input: &str) -> ParserResult<Expression> {
    binary_chain(input, parse_unary, |i| {
        alt((
            value(BinaryOp::Mul, terminated(char('*'), not(char('*')))),
            value(BinaryOp::Div, char('/')),
            value(BinaryOp::Dot, char('.')),
        ))(i)
    })
}

fn parse_unary(input: &str) -> ParserResult<Expression> {
    alt((
        map(preceded(ws(char('-')), parse_unary), |operand| match operand {
            Expression::Integer(n) => Expression::Integer(-n),
            Expression::Float(x) => Expression::Float(-x),
            other => Expression::unary(UnaryOp::Neg, other),
        }),
        map(preceded(ws(char('+')), parse_unary), |operand| {
            Expression::unary(UnaryOp::Plus, operand)
        }),
        parse_power,
    ))(input)
}

fn parse_power(input: &str) -> ParserResult<Expression> {
    let (input, base) = parse_postfix(input)?;
    let (input, exponent) = opt(pair(
        ws(alt((
            value(BinaryOp::NcPow, tag("^^")),
            value(BinaryOp::Pow, tag("**")),
            value(BinaryOp::Pow, tag("^")),
        ))),
        parse_unary,
    ))(input)?;
    Ok(match exponent {
        Some((op, exponent)) => (input, Expression::binary(op, base, exponent)),
        None => (input, base),
    })
}

#[derive(Clone)]
enum Postfix {
    Factorial,
    Index(Vec<Expression>),
}

fn parse_postfix(input: &str) -> ParserResult<Expression> {
    let (input, primary) = parse_primary(input)?;
    let (input, suffixes) = many0(preceded(
        multispace0,
        alt((
            value(Postfix::Factorial, terminated(char('!'), not(char('=')))),
            map(bracketed('[', ']'), Postfix::Index),
        )),
    ))(input)?;
    let expression = suffixes
        .into_iter()
        .fold(primary, |target, suffix| match suffix {
            Postfix::Factorial => Expression::unary(UnaryOp::Factorial, target),
            Postfix::Index(indices) => Expression::Index {
                target: Box::new(target),
                indices,
            },
        });
    Ok((input, expression))
}

fn bracketed<'a>(
    open: char,
    close: char,
) -> impl FnMut(&'a str) -> ParserResult<'a, Vec<Expression>> {
    delimited(
        ws(char(open)),
        separated_list0(ws(char(',')), parse_assign),
        preceded(multispace0, char(close)),
    )
}

fn parse_primary(input: &str) -> ParserResult<Expression> {
    context(
        "primary",
        preceded(
            multispace0,
            alt((
                parse_number,
                parse_string,
                parse_if,
                parse_loop,
                parse_identifier_or_call,
                map(bracketed('[', ']'), Expression::List),
                map(bracketed('{', '}'), Expression::Set),
                parse_parenthesised,
                map(preceded(char('\''), parse_postfix), |operand| {
                    Expression::unary(UnaryOp::Quote, operand)
                }),
            )),
        ),
    )(input)
}

fn parse_parenthesised(input: &str) -> ParserResult<Expression> {
    let (rest, mut items) = delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), parse_assign),
        preceded(multispace0, char(')')),
    )(input)?;
    let expression = if items.len() == 1 {
        items.remove(0)
    } else {
        Expression::Sequence(items)
    };
    Ok((rest, expression))
}

fn parse_number(input: &str) -> ParserResult<Expression> {
    let (rest, text) = context(
        "number",
        recognize(tuple((
            digit1,
            opt(pair(char('.'), digit0)),
            opt(tuple((one_of("eEbB"), opt(one_of("+-")), digit1))),
        ))),
    )(input)?;

    let is_float = text.contains(|c: char| matches!(c, '.' | 'e' | 'E' | 'b' | 'B'));
    let expression = if is_float {
        let normalised = text.replace(['b', 'B'], "e");
        match normalised.parse::<f64>() {
            Ok(x) => Expression::Float(x),
            Err(_) => Expression::Symbol(text.to_string()),
        }
    } else {
        match text.parse::<i64>() {
            Ok(n) => Expression::Integer(n),
            Err(_) => Expression::BigInteger(text.to_string()),
        }
    };
    Ok((rest, expression))
}

fn parse_string(input: &str) -> ParserResult<Expression> {
    let (rest, literal) = context(
        "string",
        recognize(delimited(
            char('"'),
            many0(alt((
                recognize(pair(char('\\'), anychar)),
                recognize(none_of("\\\"")),
            ))),
            char('"'),
        )),
    )(input)?;
    let text = from_engine_string(literal).unwrap_or_default();
    Ok((rest, Expression::Str(text)))
}

fn parse_identifier(input: &str) -> ParserResult<&str> {
    let (rest, name) = recognize(pair(
        satisfy(is_ident_start),
        nom::bytes::complete::take_while(is_ident_char),
    ))(input)?;
    if KEYWORDS.contains(&name) {
        return Err(nom::Err::Error(VerboseError {
            errors: vec![(
                input,
                nom::error::VerboseErrorKind::Context("keyword used as identifier"),
            )],
        }));
    }
    Ok((rest, name))
}

fn parse_identifier_or_call(input: &str) -> ParserResult<Expression> {
    let (rest, name) = parse_identifier(input)?;
    let (rest, args) = opt(preceded(multispace0, bracketed('(', ')')))(rest)?;
    let expression = match (name, args) {
        (name, Some(args)) => Expression::call(name, args),
        ("true", None) => Expression::Bool(true),
        ("false", None) => Expression::Bool(false),
        (name, None) => Expression::Symbol(name.to_string()),
    };
    Ok((rest, expression))
}

fn parse_if(input: &str) -> ParserResult<Expression> {
    let (input, _) = keyword("if")(input)?;
    let (input, condition) = ws(parse_assign)(input)?;
    let (input, _) = keyword("then")(input)?;
    let (input, first) = ws(parse_assign)(input)?;
    let (input, more) = many0(tuple((
        keyword("elseif"),
        ws(parse_assign),
        keyword("then"),
        ws(parse_assign),
    )))(input)?;
    let (input, otherwise) = opt(preceded(keyword("else"), ws(parse_assign)))(input)?;

    let mut branches = vec![(condition, first)];
    branches.extend(more.into_iter().map(|(_, c, _, v)| (c, v)));
    Ok((
        input,
        Expression::If {
            branches,
            otherwise: otherwise.map(Box::new),
        },
    ))
}

fn loop_clause(input: &str) -> ParserResult<(LoopClause, Expression)> {
    pair(
        alt((
            value(LoopClause::Step, keyword("step")),
            value(LoopClause::Next, keyword("next")),
            value(LoopClause::Thru, keyword("thru")),
            value(LoopClause::While, keyword("while")),
            value(LoopClause::Unless, keyword("unless")),
        )),
        ws(parse_assign),
    )(input)
}

fn parse_loop(input: &str) -> ParserResult<Expression> {
    let (input, header) = opt(tuple((
        terminated(keyword("for"), multispace0),
        parse_identifier,
        opt(pair(
            ws(alt((
                value(LoopClause::From, char(':')),
                value(LoopClause::From, keyword("from")),
                value(LoopClause::In, keyword("in")),
            ))),
            parse_or,
        )),
    )))(input)?;
    let (input, more) = many0(preceded(multispace0, loop_clause))(input)?;
    let (input, _) = preceded(multispace0, keyword("do"))(input)?;
    let (input, body) = ws(parse_assign)(input)?;

    let (variable, mut clauses) = match header {
        Some((_, name, first)) => (Some(name.to_string()), first.into_iter().collect()),
        None => (None, Vec::new()),
    };
    clauses.extend(more);
    Ok((
        input,
        Expression::Loop {
            variable,
            clauses,
            body: Box::new(body),
        },
    ))
}
