use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How the engine prints multiplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MultiplicationSign {
    #[default]
    Dot,
    Cross,
    Onum,
    None,
}

/// Display form of the inverse trigonometric functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InverseTrig {
    #[default]
    Cos1,
    Acos,
    Arccos,
}

/// Session-wide computation policy flags.
///
/// Rendered once at the top of every engine program, after the random seed and
/// before any statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasOptions {
    #[serde(default = "default_true")]
    pub simplify: bool,

    #[serde(default)]
    pub assume_positive: bool,

    #[serde(default)]
    pub assume_real: bool,

    #[serde(default = "default_true")]
    pub sqrt_sign: bool,

    #[serde(default)]
    pub multiplication_sign: MultiplicationSign,

    #[serde(default)]
    pub inverse_trig: InverseTrig,
}

fn default_true() -> bool {
    true
}

impl Default for CasOptions {
    fn default() -> Self {
        Self {
            simplify: true,
            assume_positive: false,
            assume_real: false,
            sqrt_sign: true,
            multiplication_sign: MultiplicationSign::default(),
            inverse_trig: InverseTrig::default(),
        }
    }
}

impl CasOptions {
    /// Engine assignments for these options, each prefixed by a comma so the
    /// result can be spliced into an open block.
    pub fn csvars(&self) -> String {
        format!(
            ",simp:{},assume_pos:{},assume_real:{},sqrtdispflag:{},make_multsgn(\"{}\"),make_arccos(\"{}\")",
            self.simplify,
            self.assume_positive,
            self.assume_real,
            self.sqrt_sign,
            self.multiplication_sign,
            self.inverse_trig
        )
    }
}
