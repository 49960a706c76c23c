//! Per-call data flowing through the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single argument value as produced by the decision-maker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Str(_) => "string",
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for ArgValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Raw arguments of one capability call, ordered by field name.
pub type Arguments = BTreeMap<String, ArgValue>;

/// Builds an `Arguments` map from `(name, value)` pairs.
pub fn args<I, K, V>(pairs: I) -> Arguments
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ArgValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Who is asking. There is a single operator identity; `actor` names the
/// decision-maker session so audit records can be grouped.
#[derive(Debug, Clone, Default)]
pub struct ActorContext {
    pub actor: String,
}

impl ActorContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
        }
    }
}

/// One request to run a capability, tracked end-to-end by `id`.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: Uuid,
    pub capability: String,
    pub arguments: Arguments,
    pub server: Option<String>,
    pub role: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

impl Invocation {
    pub fn new(capability: &str, arguments: Arguments, actor: &ActorContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            capability: capability.to_string(),
            arguments,
            server: None,
            role: None,
            actor: actor.actor.clone(),
            created_at: Utc::now(),
        }
    }
}
