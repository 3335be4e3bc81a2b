//! Canonical text form of documents.
//!
//! [`encode`] renders a document as pretty-printed JSON with sorted keys and
//! a four-space indent; identifiers are tagged as `{"$oid": "<hex>"}` so that
//! [`decode`] can restore them. The encoded form is what document files
//! contain, and its byte length is the size reported for them.

use crate::document::{Document, Value};
use crate::oid::ObjectId;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Number};
use thiserror::Error;

/// Reserved key marking an identifier.
pub const OID_TAG: &str = "$oid";

const INDENT: &[u8] = b"    ";

/// Errors produced while decoding document text.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The text is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The text is valid JSON but not an object.
    #[error("expected a JSON object at top level, found {0}")]
    NotAnObject(&'static str),
}

/// Encodes a document to its canonical text form.
pub fn encode(doc: &Document) -> String {
    let json = serde_json::Value::Object(document_to_json(doc));
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(INDENT));
    // Writing a serde_json::Value into a Vec cannot fail.
    if json.serialize(&mut ser).is_err() {
        return String::new();
    }
    out.push(b'\n');
    String::from_utf8(out).unwrap_or_default()
}

/// Decodes document text. Accepts the tagged identifier form and plain JSON.
pub fn decode(text: &str) -> Result<Document, CodecError> {
    match serde_json::from_str::<serde_json::Value>(text)? {
        serde_json::Value::Object(map) => Ok(json_to_document(map)),
        other => Err(CodecError::NotAnObject(json_kind(&other))),
    }
}

/// Converts a parsed JSON value into a document [`Value`].
pub fn value_from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => number_to_value(&n),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(value_from_json).collect())
        }
        serde_json::Value::Object(map) => match tagged_oid(&map) {
            Some(oid) => Value::ObjectId(oid),
            None => Value::Document(json_to_document(map)),
        },
    }
}

/// Converts a document [`Value`] into JSON, tagging identifiers.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number(Number::from(*i)),
        Value::Double(d) => Number::from_f64(*d).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::ObjectId(oid) => {
            let mut tag = Map::new();
            tag.insert(OID_TAG.to_string(), serde_json::Value::String(oid.to_hex()));
            serde_json::Value::Object(tag)
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Document(doc) => serde_json::Value::Object(document_to_json(doc)),
    }
}

fn document_to_json(doc: &Document) -> Map<String, serde_json::Value> {
    doc.iter()
        .map(|(k, v)| (k.clone(), value_to_json(v)))
        .collect()
}

fn json_to_document(map: Map<String, serde_json::Value>) -> Document {
    map.into_iter()
        .map(|(k, v)| (k, value_from_json(v)))
        .collect()
}

fn tagged_oid(map: &Map<String, serde_json::Value>) -> Option<ObjectId> {
    if map.len() != 1 {
        return None;
    }
    map.get(OID_TAG)
        .and_then(serde_json::Value::as_str)
        .and_then(|hex| ObjectId::parse_str(hex).ok())
}

#[allow(clippy::cast_precision_loss)]
fn number_to_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else if let Some(u) = n.as_u64() {
        Value::Double(u as f64)
    } else {
        Value::Double(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
