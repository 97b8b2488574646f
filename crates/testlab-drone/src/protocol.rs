//! Wire envelope between the scheduler and a drone utility.
//!
//! A [`CallBatch`] goes in on the utility's stdin as one JSON document and a
//! [`DroneReply`] comes back on stdout. `results` is positionally aligned
//! with `calls`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Bumped whenever the envelope changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Argument or return value of a remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CallValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<CallValue>),
    Map(BTreeMap<String, CallValue>),
}

impl CallValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CallValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CallValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CallValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[CallValue]> {
        match self {
            CallValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, CallValue>> {
        match self {
            CallValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CallValue::Null)
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, CallValue)>) -> Self {
        CallValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for CallValue {
    fn from(s: &str) -> Self {
        CallValue::Str(s.to_string())
    }
}

impl From<String> for CallValue {
    fn from(s: String) -> Self {
        CallValue::Str(s)
    }
}

impl From<&Path> for CallValue {
    fn from(p: &Path) -> Self {
        CallValue::Str(p.to_string_lossy().into_owned())
    }
}

impl From<i64> for CallValue {
    fn from(i: i64) -> Self {
        CallValue::Int(i)
    }
}

impl From<bool> for CallValue {
    fn from(b: bool) -> Self {
        CallValue::Bool(b)
    }
}

impl<T: Into<CallValue>> From<Vec<T>> for CallValue {
    fn from(items: Vec<T>) -> Self {
        CallValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<CallValue>> From<Option<T>> for CallValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(CallValue::Null, Into::into)
    }
}

/// One method invocation queued against a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub method: String,
    #[serde(default)]
    pub args: Vec<CallValue>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, CallValue>,
}

impl RemoteCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<CallValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<CallValue>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Look a parameter up by keyword first, then by position.
    pub fn param(&self, index: usize, name: &str) -> Option<&CallValue> {
        self.kwargs.get(name).or_else(|| self.args.get(index))
    }
}

/// Everything queued on one drone, sent as a single transport operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallBatch {
    pub version: u32,
    pub calls: Vec<RemoteCall>,
}

impl CallBatch {
    pub fn new(calls: Vec<RemoteCall>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            calls,
        }
    }
}

/// Result of one call. Failures of individual calls do not fail the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Ok(CallValue),
    Error(String),
}

impl CallOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok(_))
    }

    pub fn value(&self) -> Option<&CallValue> {
        match self {
            CallOutcome::Ok(v) => Some(v),
            CallOutcome::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DroneReply {
    pub results: Vec<CallOutcome>,
    #[serde(default)]
    pub warnings: Vec<String>,
}
