//! Event payload encoding.
//!
//! The event stream carries entity mutations in either a compact binary form
//! ([`PayloadFormat::Bitcode`]) or JSON ([`PayloadFormat::Json`]). Decoding
//! failures surface as [`MalformedEvent`], which consumers route to the
//! dead-letter sink.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire format of a stream payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Bitcode,
}

/// A payload that cannot be decoded or applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed event: {reason}")]
pub struct MalformedEvent {
    pub reason: String,
}

impl MalformedEvent {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Encoding failure on the producing side.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bitcode encoding failed: {0}")]
    Bitcode(#[from] bitcode::Error),
}

/// The decoded body of an event: an upsert of one entity.
///
/// JSON form: `{"id":"A","customerId":1,"attrs":{"status":"new"}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMutation {
    pub id: String,
    pub customer_id: i64,
    #[serde(rename = "attrs", default)]
    pub attributes: BTreeMap<String, String>,
    /// Producer-assigned version; consumers fall back to the event's
    /// production time when absent.
    #[serde(default)]
    pub version: Option<u64>,
}

impl EntityMutation {
    pub fn new(id: impl Into<String>, customer_id: i64) -> Self {
        Self {
            id: id.into(),
            customer_id,
            attributes: BTreeMap::new(),
            version: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    fn validate(self) -> Result<Self, MalformedEvent> {
        if self.id.trim().is_empty() {
            return Err(MalformedEvent::new("entity id is empty"));
        }
        Ok(self)
    }
}

/// Lenient JSON shape: attribute values may be any scalar, which are
/// stringified; `null` attributes are dropped.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonMutation {
    id: String,
    customer_id: i64,
    #[serde(default, alias = "attributes")]
    attrs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    version: Option<u64>,
}

impl From<JsonMutation> for EntityMutation {
    fn from(raw: JsonMutation) -> Self {
        let attributes = raw
            .attrs
            .into_iter()
            .filter_map(|(name, value)| {
                let value = match value {
                    serde_json::Value::Null => return None,
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                Some((name, value))
            })
            .collect();
        EntityMutation {
            id: raw.id,
            customer_id: raw.customer_id,
            attributes,
            version: raw.version,
        }
    }
}

/// Decode an event payload into an [`EntityMutation`].
pub fn decode_mutation(
    payload: &[u8],
    format: PayloadFormat,
) -> Result<EntityMutation, MalformedEvent> {
    let mutation = match format {
        PayloadFormat::Json => serde_json::from_slice::<JsonMutation>(payload)
            .map(EntityMutation::from)
            .map_err(|e| MalformedEvent::new(format!("invalid json payload: {}", e)))?,
        PayloadFormat::Bitcode => bitcode::deserialize::<EntityMutation>(payload)
            .map_err(|e| MalformedEvent::new(format!("invalid binary payload: {}", e)))?,
    };
    mutation.validate()
}

/// Encode an [`EntityMutation`] for the wire.
pub fn encode_mutation(
    mutation: &EntityMutation,
    format: PayloadFormat,
) -> Result<Vec<u8>, CodecError> {
    match format {
        PayloadFormat::Json => Ok(serde_json::to_vec(mutation)?),
        PayloadFormat::Bitcode => Ok(bitcode::serialize(mutation)?),
    }
}
