//! Messages carried over the bus.
//!
//! Three message kinds travel through the broker:
//! - `RpcMessage`: an outbound procedure call, addressed to an API's RPC queue
//! - `ResultMessage`: the single outcome of an `RpcMessage`, sent to the caller's return path
//! - `EventMessage`: a published event, fanned out to every consumer group on its stream
//!
//! Each kind splits into string metadata and JSON keyword parameters. The codec
//! decides how those two halves become broker fields.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::CodecError;

/// Keyword parameters of a call or event.
///
/// Ordered so that encoding is deterministic.
pub type Kwargs = BTreeMap<String, Value>;

/// Broker-assigned position of a stream entry.
///
/// Positions follow the `<millis>-<seq>` shape of Redis stream ids and are
/// strictly increasing within a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub millis: u64,
    pub seq: u64,
}

impl Position {
    /// Position before any entry.
    pub const ZERO: Position = Position { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest position strictly after `self` at the given wall-clock millis.
    pub fn successor(&self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for Position {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CodecError::InvalidField {
            field: "position".to_string(),
            reason: format!("'{}' is not a <millis>-<seq> stream id", s),
        };
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// String metadata of a message (everything except the keyword parameters).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Get a field that the message kind cannot be decoded without.
    pub fn require(&self, kind: &'static str, key: &str) -> Result<&str, CodecError> {
        self.get(key).ok_or_else(|| CodecError::MissingField {
            kind,
            field: key.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Metadata {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// A message that can be split into metadata and kwargs and rebuilt from them.
pub trait BusMessage: Sized {
    /// Message kind, used in error reports.
    const KIND: &'static str;

    fn metadata(&self) -> Metadata;

    fn kwargs(&self) -> Cow<'_, Kwargs>;

    fn from_parts(metadata: Metadata, kwargs: Kwargs) -> Result<Self, CodecError>;
}

/// Current time at the precision carried on the wire.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CodecError::InvalidField {
            field: field.to_string(),
            reason: e.to_string(),
        })
}

// ============================================================================
// RPC request
// ============================================================================

/// An outbound remote procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    /// Correlation id linking this request to its result.
    pub id: String,
    pub api_name: String,
    pub procedure_name: String,
    pub kwargs: Kwargs,
    /// Where the serving process sends the `ResultMessage`.
    pub return_path: String,
    /// Process that issued the call.
    pub origin: String,
    pub created_at: DateTime<Utc>,
}

impl RpcMessage {
    /// Create a request with a fresh correlation id.
    pub fn new(
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
        kwargs: Kwargs,
        return_path: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs,
            return_path: return_path.into(),
            origin: origin.into(),
            created_at: now(),
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.procedure_name)
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.canonical_name(), display_kwargs(&self.kwargs))
    }
}

impl BusMessage for RpcMessage {
    const KIND: &'static str = "rpc";

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("id", &self.id);
        metadata.insert("api_name", &self.api_name);
        metadata.insert("procedure_name", &self.procedure_name);
        metadata.insert("return_path", &self.return_path);
        metadata.insert("origin", &self.origin);
        metadata.insert("created_at", format_timestamp(&self.created_at));
        metadata
    }

    fn kwargs(&self) -> Cow<'_, Kwargs> {
        Cow::Borrowed(&self.kwargs)
    }

    fn from_parts(metadata: Metadata, kwargs: Kwargs) -> Result<Self, CodecError> {
        Ok(Self {
            id: metadata.require(Self::KIND, "id")?.to_string(),
            api_name: metadata.require(Self::KIND, "api_name")?.to_string(),
            procedure_name: metadata.require(Self::KIND, "procedure_name")?.to_string(),
            return_path: metadata.require(Self::KIND, "return_path")?.to_string(),
            origin: metadata.get("origin").unwrap_or_default().to_string(),
            created_at: parse_timestamp(
                "created_at",
                metadata.require(Self::KIND, "created_at")?,
            )?,
            kwargs,
        })
    }
}

// ============================================================================
// RPC result
// ============================================================================

/// The outcome of a single `RpcMessage`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMessage {
    /// Correlation id of the request this answers.
    pub rpc_id: String,
    /// Return value, or the error message when `error` is set.
    pub result: Value,
    pub error: bool,
    /// Error chain reported by the serving process.
    pub trace: Option<String>,
}

impl ResultMessage {
    pub fn success(rpc_id: impl Into<String>, result: Value) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            result,
            error: false,
            trace: None,
        }
    }

    pub fn failure(rpc_id: impl Into<String>, message: impl Into<String>, trace: String) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            result: Value::String(message.into()),
            error: true,
            trace: Some(trace),
        }
    }

    /// Error text carried by a failed result.
    pub fn error_message(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl BusMessage for ResultMessage {
    const KIND: &'static str = "result";

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("rpc_id", &self.rpc_id);
        metadata.insert("error", self.error.to_string());
        if let Some(trace) = &self.trace {
            metadata.insert("trace", trace);
        }
        metadata
    }

    fn kwargs(&self) -> Cow<'_, Kwargs> {
        let mut kwargs = Kwargs::new();
        kwargs.insert("result".to_string(), self.result.clone());
        Cow::Owned(kwargs)
    }

    fn from_parts(metadata: Metadata, mut kwargs: Kwargs) -> Result<Self, CodecError> {
        let error = match metadata.require(Self::KIND, "error")? {
            "true" => true,
            "false" => false,
            other => {
                return Err(CodecError::InvalidField {
                    field: "error".to_string(),
                    reason: format!("expected true or false, got '{}'", other),
                })
            }
        };
        Ok(Self {
            rpc_id: metadata.require(Self::KIND, "rpc_id")?.to_string(),
            result: kwargs.remove("result").unwrap_or(Value::Null),
            error,
            trace: metadata.get("trace").map(str::to_string),
        })
    }
}

// ============================================================================
// Event
// ============================================================================

/// A published event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub id: String,
    pub api_name: String,
    pub event_name: String,
    pub kwargs: Kwargs,
    pub published_at: DateTime<Utc>,
    /// Assigned by the broker on receipt; never encoded.
    pub position: Option<Position>,
}

impl EventMessage {
    pub fn new(api_name: impl Into<String>, event_name: impl Into<String>, kwargs: Kwargs) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
            published_at: now(),
            position: None,
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }
}

impl fmt::Display for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.canonical_name(), display_kwargs(&self.kwargs))
    }
}

impl BusMessage for EventMessage {
    const KIND: &'static str = "event";

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("id", &self.id);
        metadata.insert("api_name", &self.api_name);
        metadata.insert("event_name", &self.event_name);
        metadata.insert("published_at", format_timestamp(&self.published_at));
        metadata
    }

    fn kwargs(&self) -> Cow<'_, Kwargs> {
        Cow::Borrowed(&self.kwargs)
    }

    fn from_parts(metadata: Metadata, kwargs: Kwargs) -> Result<Self, CodecError> {
        Ok(Self {
            id: metadata.require(Self::KIND, "id")?.to_string(),
            api_name: metadata.require(Self::KIND, "api_name")?.to_string(),
            event_name: metadata.require(Self::KIND, "event_name")?.to_string(),
            published_at: parse_timestamp(
                "published_at",
                metadata.require(Self::KIND, "published_at")?,
            )?,
            kwargs,
            position: None,
        })
    }
}

fn display_kwargs(kwargs: &Kwargs) -> String {
    kwargs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}
