//! Message serialization.
//!
//! A message encodes to an ordered list of `(field, value)` pairs, the native
//! shape of a broker stream entry. Two layouts are supported:
//!
//! - `ByField`: every metadata entry is a plain field and every keyword
//!   parameter becomes its own `:<name>` field holding JSON. Entries stay
//!   readable with ordinary broker tooling.
//! - `Blob`: the whole message is a single `message` field holding a JSON
//!   object with `metadata` and `kwargs` members.
//!
//! Both layouts are deterministic: keyword parameters and metadata are
//! ordered maps, so re-encoding a decoded message yields identical bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{BusMessage, Kwargs, Metadata};

/// Encoded message: ordered `(field, value)` pairs.
pub type Fields = Vec<(String, String)>;

/// Prefix marking a keyword-parameter field in the `ByField` layout.
const KWARG_PREFIX: char = ':';

/// Field holding the whole message in the `Blob` layout.
const BLOB_FIELD: &str = "message";

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Missing required field '{field}' in {kind} message")]
    MissingField { kind: &'static str, field: String },

    #[error("Invalid value for field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Codec selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// One field per metadata entry and per keyword parameter.
    #[default]
    ByField,
    /// Whole message as a single JSON field.
    Blob,
}

#[derive(Serialize, Deserialize)]
struct Blob {
    metadata: BTreeMap<String, String>,
    kwargs: Kwargs,
}

impl Codec {
    /// Encode a message into broker fields.
    pub fn encode<M: BusMessage>(&self, message: &M) -> Result<Fields, CodecError> {
        match self {
            Codec::ByField => {
                let mut fields: Fields = message
                    .metadata()
                    .into_inner()
                    .into_iter()
                    .collect();
                for (name, value) in message.kwargs().iter() {
                    fields.push((
                        format!("{}{}", KWARG_PREFIX, name),
                        serde_json::to_string(value)?,
                    ));
                }
                Ok(fields)
            }
            Codec::Blob => {
                let blob = Blob {
                    metadata: message.metadata().into_inner(),
                    kwargs: message.kwargs().into_owned(),
                };
                Ok(vec![(BLOB_FIELD.to_string(), serde_json::to_string(&blob)?)])
            }
        }
    }

    /// Decode broker fields into a message.
    ///
    /// Field order does not matter; brokers are free to return fields in any order.
    pub fn decode<M: BusMessage>(&self, fields: &[(String, String)]) -> Result<M, CodecError> {
        match self {
            Codec::ByField => {
                let mut metadata = Metadata::new();
                let mut kwargs = Kwargs::new();
                for (name, value) in fields {
                    match name.strip_prefix(KWARG_PREFIX) {
                        Some(kwarg) => {
                            kwargs.insert(kwarg.to_string(), serde_json::from_str(value)?);
                        }
                        None => metadata.insert(name.as_str(), value.as_str()),
                    }
                }
                M::from_parts(metadata, kwargs)
            }
            Codec::Blob => {
                let (_, raw) = fields
                    .iter()
                    .find(|(name, _)| name == BLOB_FIELD)
                    .ok_or_else(|| CodecError::MissingField {
                        kind: M::KIND,
                        field: BLOB_FIELD.to_string(),
                    })?;
                let blob: Blob = serde_json::from_str(raw)?;
                M::from_parts(Metadata::from(blob.metadata), blob.kwargs)
            }
        }
    }
}

/// Pack fields into a single payload (for list-based return paths).
pub fn pack_fields(fields: &[(String, String)]) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(fields)?)
}

/// Inverse of [`pack_fields`].
pub fn unpack_fields(payload: &[u8]) -> Result<Fields, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}
