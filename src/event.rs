//! The normalized record shape produced by the event parser, and the raw
//! `(tag, payload)` pair it consumes.

use serde_json::Value;
use std::fmt;

/// A still-undecoded event as delivered by the source adapter.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub tag: String,
    pub payload: Value,
}

/// Job identifier: an integer when the payload's `jid` parses as one,
/// otherwise the original string is kept (§3 `jid` — "integer if parseable
/// else string").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobId {
    Int(i64),
    Str(String),
}

impl JobId {
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => JobId::Int(n),
            Err(_) => JobId::Str(raw.to_string()),
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Int(n) => write!(f, "{n}"),
            JobId::Str(s) => write!(f, "{s}"),
        }
    }
}

/// `(fun, rewritten positional args, test flag)` — only present for
/// state-function jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct StateFunArgs {
    pub fun: String,
    pub args: Vec<String>,
    pub test: bool,
}

/// The parser's output: a normalized record with stable, optional keys.
/// Fields that the source did not supply stay `None`/empty rather than being
/// serialized as null — callers must never observe a "present but null" key.
#[derive(Debug, Clone, Default)]
pub struct ParsedEvent {
    pub tag: String,
    pub tag_mask: String,
    pub tag_main: String,
    pub tag_sub: String,
    pub ts: i64,

    pub jid: Option<JobId>,
    pub id: Option<String>,
    pub user: Option<String>,
    pub minions: Option<Vec<String>>,
    pub success: Option<bool>,
    pub fun: Option<String>,

    pub trimmed: Vec<String>,
    pub state_fun_args: Option<StateFunArgs>,
    pub test: Option<bool>,
    pub down_minions: Option<Vec<String>>,
    pub offline: Option<bool>,

    pub return_value: Option<Value>,
    pub duration: Option<f64>,
    pub changes: Option<u64>,
    pub errors: Option<u64>,
    pub warnings: Option<u64>,
    pub successes: Option<u64>,
    pub failures: Option<u64>,

    pub stats: Option<Value>,
    pub rix: Option<usize>,
}

impl ParsedEvent {
    pub fn new(tag: String, tag_mask: String, tag_main: String, tag_sub: String, ts: i64) -> Self {
        ParsedEvent {
            tag,
            tag_mask,
            tag_main,
            tag_sub,
            ts,
            ..Default::default()
        }
    }
}
