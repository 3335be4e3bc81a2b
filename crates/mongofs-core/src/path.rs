//! Path classification.
//!
//! Every filesystem call starts by turning its path into a [`VirtualNode`].
//! Classification looks only at the path string: the number of segments and
//! the shape of the last one. Whether anything actually backs the node is
//! decided later by the operation bridge.
//!
//! ```text
//! /                                   Root
//! /<db>                               Database
//! /<db>/<coll>                        Collection
//! /<db>/<coll>/query.json             QueryFile
//! /<db>/<coll>/new.json               NewDocumentFile
//! /<db>/<coll>/<24-hex>.json          DocumentFile
//! /<db>/<coll>/<view>                 CustomView
//! /<db>/<coll>/<view>/query.json      ViewQueryFile
//! ```
//!
//! Views nest: below a view the same depth-3 rules apply again, so
//! `/<db>/<coll>/by_age/25/<24-hex>.json` is a document file and
//! `/<db>/<coll>/by_age/25` a view with the chain `["by_age", "25"]`.

use crate::oid::{OID_HEX_LEN, ObjectId};

/// Path separator.
pub const SEPARATOR: char = '/';

/// Name of the filter file inside a collection or view.
pub const QUERY_FILE: &str = "query.json";

/// Name of the file that creates a document when written.
pub const NEW_FILE: &str = "new.json";

/// Suffix carried by document files.
pub const JSON_SUFFIX: &str = ".json";

/// A path classified into one of the fixed node kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualNode {
    Root,
    Database {
        db: String,
    },
    Collection {
        db: String,
        coll: String,
    },
    QueryFile {
        db: String,
        coll: String,
    },
    NewDocumentFile {
        db: String,
        coll: String,
        views: Vec<String>,
    },
    DocumentFile {
        db: String,
        coll: String,
        views: Vec<String>,
        id: ObjectId,
    },
    CustomView {
        db: String,
        coll: String,
        views: Vec<String>,
    },
    ViewQueryFile {
        db: String,
        coll: String,
        views: Vec<String>,
    },
    /// A name that matches none of the shapes above. Operations reject it.
    Unknown {
        path: String,
    },
}

impl VirtualNode {
    /// True for nodes presented as directories.
    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            VirtualNode::Root
                | VirtualNode::Database { .. }
                | VirtualNode::Collection { .. }
                | VirtualNode::CustomView { .. }
        )
    }

    /// Canonical path of the node, used as the attribute cache key.
    pub fn path(&self) -> String {
        let file_name;
        let mut parts: Vec<&str> = Vec::new();
        match self {
            VirtualNode::Root => return SEPARATOR.to_string(),
            VirtualNode::Unknown { path } => return path.clone(),
            VirtualNode::Database { db } => parts.push(db),
            VirtualNode::Collection { db, coll } => parts.extend([db.as_str(), coll.as_str()]),
            VirtualNode::QueryFile { db, coll } => {
                parts.extend([db.as_str(), coll.as_str(), QUERY_FILE]);
            }
            VirtualNode::NewDocumentFile { db, coll, views } => {
                parts.extend([db.as_str(), coll.as_str()]);
                parts.extend(views.iter().map(String::as_str));
                parts.push(NEW_FILE);
            }
            VirtualNode::DocumentFile { db, coll, views, id } => {
                parts.extend([db.as_str(), coll.as_str()]);
                parts.extend(views.iter().map(String::as_str));
                file_name = document_file_name(id);
                parts.push(&file_name);
            }
            VirtualNode::CustomView { db, coll, views } => {
                parts.extend([db.as_str(), coll.as_str()]);
                parts.extend(views.iter().map(String::as_str));
            }
            VirtualNode::ViewQueryFile { db, coll, views } => {
                parts.extend([db.as_str(), coll.as_str()]);
                parts.extend(views.iter().map(String::as_str));
                parts.push(QUERY_FILE);
            }
        }
        format!("{SEPARATOR}{}", parts.join("/"))
    }
}

/// Splits a path into its components, root first.
///
/// Trailing and repeated separators are ignored, so `"/tmp/test/"` and
/// `"/tmp/test"` split identically and `"/"` yields `["/"]`.
pub fn split_path(path: &str) -> Vec<String> {
    std::iter::once(SEPARATOR.to_string())
        .chain(
            path.split(SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        )
        .collect()
}

/// Joins a directory path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.ends_with(SEPARATOR) {
        format!("{parent}{name}")
    } else {
        format!("{parent}{SEPARATOR}{name}")
    }
}

/// File name under which a document with this identifier appears.
pub fn document_file_name(id: &ObjectId) -> String {
    format!("{id}{JSON_SUFFIX}")
}

/// Returns the identifier if `name` is `<24-hex>.json`.
///
/// Only the lowercase form that listings produce is accepted, so each
/// document has exactly one path.
pub fn is_object_id_file(name: &str) -> Option<ObjectId> {
    let stem = name.strip_suffix(JSON_SUFFIX)?;
    if stem.len() != OID_HEX_LEN || !stem.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    ObjectId::parse_str(stem).ok()
}

/// Whether a name carries a file extension.
///
/// An extension is a non-empty, alphanumeric, not purely numeric suffix after
/// the last `.`, so `notes.txt` has one but `3.14` and `v1` do not.
pub fn has_extension(name: &str) -> bool {
    let Some(dot) = name.rfind('.') else {
        return false;
    };
    if dot == 0 {
        return false;
    }
    let ext = &name[dot + 1..];
    !ext.is_empty()
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        && !ext.bytes().all(|b| b.is_ascii_digit())
}

/// Classifies a path. Total: every input maps to exactly one node.
pub fn resolve(path: &str) -> VirtualNode {
    let parts = split_path(path);
    let segments = &parts[1..];

    match segments {
        [] => VirtualNode::Root,
        [db] => VirtualNode::Database { db: db.clone() },
        [db, coll] => VirtualNode::Collection {
            db: db.clone(),
            coll: coll.clone(),
        },
        [db, coll, rest @ ..] => {
            let (views, leaf) = rest.split_at(rest.len() - 1);
            let leaf = &leaf[0];
            if views.iter().any(|v| !is_view_segment(v)) {
                return unknown(&parts);
            }
            resolve_leaf(db, coll, views, leaf).unwrap_or_else(|| unknown(&parts))
        }
    }
}

fn resolve_leaf(db: &str, coll: &str, views: &[String], leaf: &str) -> Option<VirtualNode> {
    let db = db.to_string();
    let coll = coll.to_string();
    let views = views.to_vec();

    if leaf == QUERY_FILE {
        return Some(if views.is_empty() {
            VirtualNode::QueryFile { db, coll }
        } else {
            VirtualNode::ViewQueryFile { db, coll, views }
        });
    }
    if leaf == NEW_FILE {
        return Some(VirtualNode::NewDocumentFile { db, coll, views });
    }
    if let Some(id) = is_object_id_file(leaf) {
        return Some(VirtualNode::DocumentFile { db, coll, views, id });
    }
    if is_view_segment(leaf) {
        let mut views = views;
        views.push(leaf.to_string());
        return Some(VirtualNode::CustomView { db, coll, views });
    }
    None
}

/// Whether a name can be a view segment: no leading `.` and no extension.
pub fn is_view_segment(name: &str) -> bool {
    !name.starts_with('.') && !has_extension(name)
}

fn unknown(parts: &[String]) -> VirtualNode {
    VirtualNode::Unknown {
        path: format!("{SEPARATOR}{}", parts[1..].join("/")),
    }
}
