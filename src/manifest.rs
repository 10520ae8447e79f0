//! Splitting and decoding of rendered chart manifests.
//!
//! Chart rendering itself happens outside this crate; what arrives here is
//! multi-document YAML text, one blob per rendered file.

use kube::api::DynamicObject;
use serde_json::Value;

use crate::error::{Error, Result};

/// A named blob of rendered manifest text, possibly containing several
/// YAML documents.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub name: String,
    pub content: String,
}

impl Manifest {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Splits multi-document manifest text on YAML document boundaries,
/// dropping documents that contain only comments or whitespace.
pub fn split_manifests(content: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.trim() == "---" {
            push_document(&mut documents, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_document(&mut documents, &mut current);
    documents
}

fn push_document(documents: &mut Vec<String>, current: &mut String) {
    let has_content = current.lines().any(|line| {
        let trimmed = line.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    });
    if has_content {
        documents.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

/// Decodes one YAML document into a [`DynamicObject`]. Returns `Ok(None)`
/// for empty documents.
pub fn decode_document(raw: &str) -> Result<Option<DynamicObject>> {
    let value: Value = serde_yaml::from_str(raw).map_err(|e| Error::DecodeError(e.to_string()))?;
    if value.is_null() {
        return Ok(None);
    }
    decode_value(value).map(Some)
}

/// Decodes an already-parsed JSON value into a [`DynamicObject`],
/// requiring a non-empty apiVersion and kind.
pub fn decode_value(value: Value) -> Result<DynamicObject> {
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
    if api_version.is_empty() || kind.is_empty() {
        return Err(Error::DecodeError(
            "document is missing apiVersion or kind".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| Error::DecodeError(e.to_string()))
}
