//! Document model shared by the store, the codec, and the query engine.

use crate::oid::ObjectId;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Field name of the primary key.
pub const ID_FIELD: &str = "_id";

/// A stored document. Keys are kept in lexicographic order.
pub type Document = BTreeMap<String, Value>;

/// A document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    ObjectId(ObjectId),
    Array(Vec<Value>),
    Document(Document),
}

impl Value {
    /// Numeric view used for cross-kind comparisons (`Int` vs `Double`).
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    /// Equality with numeric widening, as the query language compares.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    /// Ordering between values of the same kind. Numbers compare across
    /// `Int`/`Double`; everything else only within its own kind.
    pub fn partial_compare(&self, other: &Value) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.partial_cmp(&b);
        }
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::ObjectId(a), Value::ObjectId(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Renders a scalar as a single path segment, if it can be one.
    ///
    /// Used for the value folders listed under a `by_<field>` view.
    pub fn to_segment(&self) -> Option<String> {
        let s = match self {
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Double(d) if d.is_finite() => d.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::ObjectId(oid) => oid.to_hex(),
            _ => return None,
        };
        if s.is_empty() || s == "." || s == ".." || s.contains('/') || s.contains('\0') {
            return None;
        }
        Some(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<ObjectId> for Value {
    fn from(oid: ObjectId) -> Self {
        Value::ObjectId(oid)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// Returns the document's `_id` if it is an [`ObjectId`].
pub fn object_id_of(doc: &Document) -> Option<ObjectId> {
    match doc.get(ID_FIELD) {
        Some(Value::ObjectId(oid)) => Some(*oid),
        _ => None,
    }
}

/// Resolves a dotted field path (`a.b.c`) inside a document.
///
/// Numeric segments index into arrays.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Document(inner) => inner.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Builds a [`Document`] from `key => value` pairs.
#[macro_export]
macro_rules! doc {
    () => { $crate::document::Document::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut d = $crate::document::Document::new();
        $( d.insert(($key).to_string(), $crate::document::Value::from($value)); )+
        d
    }};
}
