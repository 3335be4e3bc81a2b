//! Stored filters and placeholder substitution.
//!
//! A filter is raw JSON text attached to a collection or to a chain of views
//! below it. Listing a directory uses the nearest ancestor-or-self filter;
//! the view segments that follow the filter's own key are the parameters,
//! substituted for `$1`, `$2`, ... left to right.
//!
//! Substitution works on the raw text, before parsing:
//!
//! - inside a JSON string (`"$1"`, `"x-$1"`) the segment is inserted with JSON
//!   string escaping;
//! - a bare token (`$1`) becomes the segment verbatim when the segment is a
//!   JSON scalar literal (a number, `true`, `false`, `null`), and a quoted
//!   string otherwise.
//!
//! Only `$<digits>` is a placeholder; operators like `$lte` pass through.

use crate::codec;
use crate::document::{Document, Value};
use crate::doc;
use dashmap::DashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Prefix of a view name whose filter is generated from its name.
pub const BY_FIELD_PREFIX: &str = "by_";

const PARAM_MARKER: &str = "__mongofs_param_";

/// Identifies a collection (empty `views`) or a view chain below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub db: String,
    pub coll: String,
    pub views: Vec<String>,
}

impl QueryKey {
    pub fn new(db: &str, coll: &str, views: &[String]) -> Self {
        Self {
            db: db.to_string(),
            coll: coll.to_string(),
            views: views.to_vec(),
        }
    }

    /// `coll/view/...`, unique within the database since names never
    /// contain a separator.
    pub fn location(&self) -> String {
        let mut out = self.coll.clone();
        for view in &self.views {
            out.push('/');
            out.push_str(view);
        }
        out
    }

    /// Whether this key is `chain` or lies below it.
    fn is_under(&self, db: &str, coll: &str, chain: &[String]) -> bool {
        self.db == db && self.coll == coll && self.views.starts_with(chain)
    }
}

#[derive(Debug, Clone)]
struct QueryEntry {
    text: Option<String>,
    modified: SystemTime,
}

/// A filter or registered view as a record, the unit persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredQuery {
    pub key: QueryKey,
    /// Filter text. `None` for a view registered without one.
    pub text: Option<String>,
    pub modified: SystemTime,
}

impl StoredQuery {
    /// A record stamped with the current time.
    pub fn new(key: QueryKey, text: Option<String>) -> Self {
        Self {
            key,
            text,
            modified: SystemTime::now(),
        }
    }

    /// The record `mkdir` creates for a view: `by_<field>` views get the
    /// filter `{"<field>": $1}`, others none.
    pub fn view(key: QueryKey) -> Self {
        let text = key
            .views
            .last()
            .and_then(|v| v.strip_prefix(BY_FIELD_PREFIX))
            .filter(|field| !field.is_empty())
            .map(|field| format!("{{{}: $1}}", serde_json::Value::from(field)));
        Self::new(key, text)
    }

    /// Document form, without `_id`. The database is implied by where the
    /// document is kept.
    pub fn to_document(&self) -> Document {
        let views: Vec<Value> = self.key.views.iter().map(|v| Value::from(v.as_str())).collect();
        let modified = self
            .modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        doc! {
            "key" => self.key.location(),
            "coll" => self.key.coll.as_str(),
            "views" => views,
            "query" => self.text.clone().map_or(Value::Null, Value::String),
            "modified" => modified,
        }
    }

    /// Parses a document written by [`to_document`](Self::to_document).
    pub fn from_document(db: &str, doc: &Document) -> Option<Self> {
        let Some(Value::String(coll)) = doc.get("coll") else {
            return None;
        };
        let views = match doc.get("views") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?,
            None => Vec::new(),
            Some(_) => return None,
        };
        let text = match doc.get("query") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Null) | None => None,
            Some(_) => return None,
        };
        let modified = match doc.get("modified") {
            Some(Value::Int(ms)) => u64::try_from(*ms)
                .ok()
                .and_then(|ms| UNIX_EPOCH.checked_add(Duration::from_millis(ms)))?,
            _ => UNIX_EPOCH,
        };
        Some(Self {
            key: QueryKey::new(db, coll, &views),
            text,
            modified,
        })
    }
}

/// The filter text that applies to a directory, after substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryText {
    pub text: String,
    pub modified: SystemTime,
}

/// Outcome of resolving the filter for a directory listing.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedFilter {
    /// No filter applies.
    Absent,
    /// Filter text exists but is not a JSON object.
    Malformed(String),
    /// Placeholders remain. `partial` is the filter without the unresolved
    /// terms; `field` is the top-level field bound to the next placeholder.
    Pending {
        partial: Document,
        field: Option<String>,
    },
    Ready(Document),
}

/// Registry of filters and views, shared by all operations of a mount.
#[derive(Debug, Default)]
pub struct QueryEngine {
    entries: DashMap<QueryKey, QueryEntry>,
}

impl QueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores filter text for the exact key, registering the view if needed.
    pub fn store_query(&self, db: &str, coll: &str, views: &[String], text: &str) {
        self.put(StoredQuery::new(QueryKey::new(db, coll, views), Some(text.to_string())));
    }

    /// Inserts or replaces a record.
    pub fn put(&self, record: StoredQuery) {
        debug!(
            db = %record.key.db,
            key = %record.key.location(),
            has_text = record.text.is_some(),
            "Storing query record"
        );
        self.entries.insert(
            record.key,
            QueryEntry {
                text: record.text,
                modified: record.modified,
            },
        );
    }

    /// The record at exactly this key.
    pub fn stored(&self, db: &str, coll: &str, views: &[String]) -> Option<StoredQuery> {
        let key = QueryKey::new(db, coll, views);
        let entry = self.entries.get(&key)?;
        Some(StoredQuery {
            text: entry.text.clone(),
            modified: entry.modified,
            key,
        })
    }

    /// Drops the record at exactly this key. Returns whether it existed.
    pub fn remove_key(&self, key: &QueryKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Keys of the chain and of every record below it.
    pub fn keys_under(&self, db: &str, coll: &str, views: &[String]) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|e| e.key().is_under(db, coll, views))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Replaces every record of `db`. When two records share a key the most
    /// recently modified wins.
    pub fn replace_database(&self, db: &str, mut records: Vec<StoredQuery>) {
        records.sort_by_key(|r| r.modified);
        self.entries.retain(|k, _| k.db != db);
        for record in records.into_iter().filter(|r| r.key.db == db) {
            self.entries.insert(
                record.key,
                QueryEntry {
                    text: record.text,
                    modified: record.modified,
                },
            );
        }
    }

    /// The filter text that applies to this directory, placeholders
    /// substituted. Unresolved placeholders are left as written.
    pub fn get_filter(&self, db: &str, coll: &str, views: &[String]) -> Option<String> {
        self.query_text(db, coll, views).map(|q| q.text)
    }

    /// Like [`get_filter`](Self::get_filter), with the time it was stored.
    pub fn query_text(&self, db: &str, coll: &str, views: &[String]) -> Option<QueryText> {
        let (text, params, modified) = self.nearest(db, coll, views)?;
        Some(QueryText {
            text: substitute(&text, params, |_| None),
            modified,
        })
    }

    /// Resolves the filter for listing this directory.
    pub fn filter_matches(&self, db: &str, coll: &str, views: &[String]) -> ResolvedFilter {
        let Some((text, params, _)) = self.nearest(db, coll, views) else {
            return ResolvedFilter::Absent;
        };
        // A created but never written query.json.
        if text.trim().is_empty() {
            return ResolvedFilter::Absent;
        }

        let mut unresolved = false;
        let marked = substitute(&text, params, |n| {
            unresolved = true;
            Some(marker(n))
        });

        let doc = match codec::decode(&marked) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(%db, %coll, ?views, error = %e, "Ignoring malformed query");
                return ResolvedFilter::Malformed(e.to_string());
            }
        };
        if !unresolved {
            return ResolvedFilter::Ready(doc);
        }

        let next = Value::String(marker(params.len() + 1));
        let field = doc.iter().find(|(_, v)| **v == next).map(|(k, _)| k.clone());
        let partial = doc
            .into_iter()
            .filter_map(|(k, v)| strip_markers(v).map(|v| (k, v)))
            .collect();
        ResolvedFilter::Pending { partial, field }
    }

    /// Registers a view with the record [`StoredQuery::view`] builds.
    /// Returns false if it was already registered.
    pub fn register_view(&self, db: &str, coll: &str, views: &[String]) -> bool {
        if self.is_registered(db, coll, views) {
            return false;
        }
        self.put(StoredQuery::view(QueryKey::new(db, coll, views)));
        true
    }

    /// Whether the chain names a view: registered, or a parameter segment
    /// consumed by a placeholder of an ancestor's filter.
    pub fn view_exists(&self, db: &str, coll: &str, views: &[String]) -> bool {
        if views.is_empty() || self.is_registered(db, coll, views) {
            return true;
        }
        let Some((text, params, _)) = self.nearest(db, coll, views) else {
            return false;
        };
        max_placeholder(&text) >= params.len()
    }

    /// Whether filter text is stored at exactly this key.
    pub fn has_query(&self, db: &str, coll: &str, views: &[String]) -> bool {
        self.entries
            .get(&QueryKey::new(db, coll, views))
            .is_some_and(|e| e.text.is_some())
    }

    /// Whether the chain was registered by `mkdir` or by storing a filter.
    pub fn is_registered(&self, db: &str, coll: &str, views: &[String]) -> bool {
        self.entries.contains_key(&QueryKey::new(db, coll, views))
    }

    /// Names of registered views directly below the chain, sorted.
    pub fn child_views(&self, db: &str, coll: &str, views: &[String]) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().views.len() == views.len() + 1 && e.key().is_under(db, coll, views))
            .filter_map(|e| e.key().views.last().cloned())
            .collect();
        names.sort();
        names
    }

    /// Nearest ancestor-or-self key with text: the text, the trailing
    /// segments that act as parameters, and when it was stored.
    fn nearest<'v>(
        &self,
        db: &str,
        coll: &str,
        views: &'v [String],
    ) -> Option<(String, &'v [String], SystemTime)> {
        (0..=views.len()).rev().find_map(|len| {
            let entry = self.entries.get(&QueryKey::new(db, coll, &views[..len]))?;
            let text = entry.text.clone()?;
            Some((text, &views[len..], entry.modified))
        })
    }
}

fn marker(n: usize) -> String {
    format!("{PARAM_MARKER}{n}__")
}

fn strip_markers(value: Value) -> Option<Value> {
    match value {
        Value::String(s) if s.contains(PARAM_MARKER) => None,
        Value::Array(items) if !items.is_empty() => {
            let kept: Vec<Value> = items.into_iter().filter_map(strip_markers).collect();
            (!kept.is_empty()).then_some(Value::Array(kept))
        }
        Value::Document(doc) if !doc.is_empty() => {
            let kept: Document = doc
                .into_iter()
                .filter_map(|(k, v)| strip_markers(v).map(|v| (k, v)))
                .collect();
            (!kept.is_empty()).then_some(Value::Document(kept))
        }
        other => Some(other),
    }
}

fn is_scalar_literal(segment: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(segment),
        Ok(serde_json::Value::Number(_) | serde_json::Value::Bool(_) | serde_json::Value::Null)
    )
}

/// Replaces `$N` tokens with `params[N-1]`. Tokens with no parameter are
/// passed to `unresolved`, which may return a bare JSON replacement (a marker
/// string); `None` leaves the token as written.
fn substitute(
    text: &str,
    params: &[String],
    mut unresolved: impl FnMut(usize) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(text.len());
    scan_placeholders(text, |piece| match piece {
        Piece::Text(s) => out.push_str(s),
        Piece::Placeholder { token, index, in_string } => {
            match index.checked_sub(1).and_then(|i| params.get(i)) {
                Some(segment) if in_string => out.push_str(&escape_in_string(segment)),
                Some(segment) if is_scalar_literal(segment) => out.push_str(segment),
                Some(segment) => out.push_str(&serde_json::Value::from(segment.as_str()).to_string()),
                None => match unresolved(index) {
                    Some(marker) if in_string => out.push_str(&marker),
                    Some(marker) => out.push_str(&format!("\"{marker}\"")),
                    None => out.push_str(token),
                },
            }
        }
    });
    out
}

fn escape_in_string(segment: &str) -> String {
    let quoted = serde_json::Value::from(segment).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn max_placeholder(text: &str) -> usize {
    let mut max = 0;
    scan_placeholders(text, |piece| {
        if let Piece::Placeholder { index, .. } = piece {
            max = max.max(index);
        }
    });
    max
}

enum Piece<'a> {
    Text(&'a str),
    Placeholder {
        token: &'a str,
        index: usize,
        in_string: bool,
    },
}

/// Splits text into literal runs and `$<digits>` tokens, tracking whether
/// each token sits inside a JSON string literal.
fn scan_placeholders<'a>(text: &'a str, mut emit: impl FnMut(Piece<'a>)) {
    let bytes = text.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string && escaped {
            escaped = false;
            i += 1;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|c| c.is_ascii_digit()).count();
                if digits > 0 {
                    let end = i + 1 + digits;
                    if let Ok(index) = text[i + 1..end].parse::<usize>() {
                        emit(Piece::Text(&text[start..i]));
                        emit(Piece::Placeholder {
                            token: &text[i..end],
                            index,
                            in_string,
                        });
                        start = end;
                        i = end;
                        continue;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    emit(Piece::Text(&text[start..]));
}
