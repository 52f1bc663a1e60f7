//! Canonicalize the shapes generators use for file trees
//!
//! Generators return the same information in several layouts. [`detect_shape`]
//! classifies a parsed document with an ordered list of rules (first match
//! wins) and [`normalize_files`] converts each shape into one ordered list of
//! [`GeneratedFile`]s.

use kiln_core::workspace::normalize_relative;
use kiln_core::{ArtifactLayout, GeneratedArtifact, GeneratedFile};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Keys under which a document may carry its file collection
const FILE_COLLECTION_KEYS: &[&str] = &["files", "code_files"];

/// Per-record keys for the file path, in preference order
const PATH_KEYS: &[&str] = &["path", "name", "filename", "file"];

/// Per-record keys for the file body, in preference order
const CONTENT_KEYS: &[&str] = &["content", "code", "source", "body"];

/// Layout of a parsed generator document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentShape {
    /// `{"files": [{"path": .., "content": ..}, ..]}`
    FileList,
    /// `{"app/main.py": "..", "styles.css": ".."}`
    FlatPathMap,
    /// `{"files": {"main.py": "..", "styles.css": ".."}}`
    NamedMap,
    /// `{"files": {"backend": [{..}], "frontend": [{..}]}}`
    CategorizedMap,
    /// None of the above; yields no files
    Unrecognized,
}

/// Classify a document. Rules are tried in declaration order of [`DocumentShape`].
pub fn detect_shape(doc: &Value) -> DocumentShape {
    let Some(obj) = doc.as_object() else {
        return DocumentShape::Unrecognized;
    };

    let collection = file_collection(obj);

    if matches!(collection, Some(Value::Array(_))) {
        return DocumentShape::FileList;
    }

    if collection.is_none() && is_flat_path_map(obj) {
        return DocumentShape::FlatPathMap;
    }

    if let Some(Value::Object(map)) = collection {
        if !map.is_empty() && map.values().all(Value::is_string) {
            return DocumentShape::NamedMap;
        }
        if !map.is_empty() && map.values().all(Value::is_array) {
            return DocumentShape::CategorizedMap;
        }
    }

    DocumentShape::Unrecognized
}

/// Flatten a document into canonical files.
///
/// Records without a path or with blank content are skipped. Bare file names
/// are rooted by extension, except in [`DocumentShape::NamedMap`] where the
/// key is taken as the path verbatim. A repeated path keeps its first
/// position and its last content.
pub fn normalize_files(doc: &Value, layout: &ArtifactLayout) -> Vec<GeneratedFile> {
    let shape = detect_shape(doc);
    debug!("normalizing document of shape {:?}", shape);

    let entries: Vec<(String, String)> = match shape {
        DocumentShape::FileList => match doc.as_object().and_then(file_collection) {
            Some(Value::Array(records)) => records
                .iter()
                .filter_map(record_entry)
                .map(|(path, content)| (root_bare_name(&path, layout), content))
                .collect(),
            _ => Vec::new(),
        },
        DocumentShape::FlatPathMap => doc
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| Some((root_bare_name(k, layout), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default(),
        DocumentShape::NamedMap => match doc.as_object().and_then(file_collection) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| Some((normalize_relative(k), v.as_str()?.to_string())))
                .collect(),
            _ => Vec::new(),
        },
        DocumentShape::CategorizedMap => match doc.as_object().and_then(file_collection) {
            Some(Value::Object(categories)) => categories
                .values()
                .filter_map(Value::as_array)
                .flatten()
                .filter_map(record_entry)
                .map(|(path, content)| (root_bare_name(&path, layout), content))
                .collect(),
            _ => Vec::new(),
        },
        DocumentShape::Unrecognized => Vec::new(),
    };

    let mut files: Vec<GeneratedFile> = Vec::with_capacity(entries.len());
    for (path, content) in entries {
        if path.is_empty() || content.trim().is_empty() {
            debug!("skipping empty generated record '{}'", path);
            continue;
        }
        match files.iter_mut().find(|f| f.path == path) {
            Some(existing) => existing.content = content,
            None => files.push(GeneratedFile::new(path, content)),
        }
    }
    files
}

/// Normalize files and pick up the entrypoint and run configuration
pub fn normalize_artifact(doc: &Value, layout: &ArtifactLayout) -> GeneratedArtifact {
    let files = normalize_files(doc, layout);

    let entrypoint = doc
        .get("entrypoint")
        .and_then(Value::as_str)
        .map(normalize_relative)
        .filter(|e| !e.is_empty())
        .map(|e| root_bare_name(&e, layout))
        .unwrap_or_else(|| layout.entrypoint());

    let run_config: BTreeMap<String, Value> = doc
        .get("run")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    GeneratedArtifact {
        files,
        entrypoint,
        run_config,
    }
}

fn file_collection(obj: &Map<String, Value>) -> Option<&Value> {
    FILE_COLLECTION_KEYS.iter().find_map(|key| obj.get(*key))
}

/// Every key looks like a file path and every value is text
fn is_flat_path_map(obj: &Map<String, Value>) -> bool {
    !obj.is_empty() && obj.iter().all(|(k, v)| k.contains('.') && v.is_string())
}

fn record_entry(record: &Value) -> Option<(String, String)> {
    let obj = record.as_object()?;
    let path = PATH_KEYS
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(normalize_relative)?;
    let content = CONTENT_KEYS
        .iter()
        .find_map(|key| obj.get(*key))
        .and_then(content_text)?;
    Some((path, content))
}

/// Text content; structured values (e.g. a JSON file given as an object) are pretty-printed
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        Value::Array(_) | Value::Object(_) => serde_json::to_string_pretty(value).ok(),
        other => Some(other.to_string()),
    }
}

fn root_bare_name(path: &str, layout: &ArtifactLayout) -> String {
    let path = normalize_relative(path);
    if path.is_empty() || path.contains('/') {
        return path;
    }
    format!("{}/{}", layout.default_dir_for(&path), path)
}
