//! # Resource Bundle Codec
//!
//! A bundle is the payload of a package revision: a mapping of relative file
//! paths to file contents. Functions, however, consume and produce a single
//! canonical *envelope*: an ordered list of structured documents, each
//! annotated with the path and index it was read from. This module converts
//! between the two forms.
//!
//! ## Envelope shape
//!
//! ```yaml
//! apiVersion: config.kubernetes.io/v1
//! kind: ResourceList
//! items:
//!   - apiVersion: v1
//!     kind: Namespace
//!     metadata:
//!       name: example
//!       annotations:
//!         config.kubernetes.io/path: namespace.yaml
//!         config.kubernetes.io/index: "0"
//! functionConfig: { ... }   # present only when a function declares one
//! ```
//!
//! Items are emitted in ascending path order. Parsing strips the two
//! bookkeeping annotations before the document is returned to the bundle, so
//! a serialize/parse round trip is content-preserving modulo canonical key
//! ordering. Two items claiming the same path fail with `Conflict`.
//!
//! Only structured documents travel in the envelope; opaque files (a
//! `README.md`, say) stay in the bundle untouched and are skipped by
//! [`to_envelope`].

use std::collections::BTreeMap;

use serde_yaml_ng::{Mapping, Value};

use crate::error::{Error, Result};

//================================================================================================
// Constants
//================================================================================================

/// Annotation carrying the bundle-relative path of an envelope item.
pub const PATH_ANNOTATION: &str = "config.kubernetes.io/path";
/// Annotation carrying the position of an envelope item within its file.
pub const INDEX_ANNOTATION: &str = "config.kubernetes.io/index";

const ENVELOPE_API_VERSION: &str = "config.kubernetes.io/v1";
const ENVELOPE_KIND: &str = "ResourceList";

//================================================================================================
// Types
//================================================================================================

/// The path-keyed contents of one package revision.
///
/// Paths are relative to the package root. Contents are raw bytes; only
/// structured (YAML) files participate in the envelope codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    files: BTreeMap<String, Vec<u8>>,
}

//================================================================================================
// Impls
//================================================================================================

impl Bundle {
    /// An empty bundle.
    pub fn new() -> Self {
        Bundle::default()
    }

    /// Inserts a file, replacing any previous content at the same path.
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Result<()> {
        let path = path.into();
        validate_path(&path)?;
        self.files.insert(path, contents.into());
        Ok(())
    }

    /// Returns the contents at `path`, if present.
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Removes and returns the contents at `path`.
    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path)
    }

    /// Iterates over `(path, contents)` pairs in ascending path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_slice()))
    }

    /// The number of files in the bundle.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the bundle holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total content bytes across all files.
    pub fn total_bytes(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// The raw manifest file, if the bundle carries one.
    pub fn manifest_bytes(&self) -> Option<&[u8]> {
        self.get(crate::MANIFEST_FILE.as_str())
    }
}

//================================================================================================
// Functions
//================================================================================================

/// Whether a bundle file participates in the envelope codec.
pub fn is_structured(path: &str) -> bool {
    path == crate::MANIFEST_FILE.as_str() || path.ends_with(".yaml") || path.ends_with(".yml")
}

/// Checks that every structured file in the bundle parses as a document
/// mapping, so malformed input is rejected before it is stored.
pub fn validate(bundle: &Bundle) -> Result<()> {
    for (path, contents) in bundle.iter().filter(|(p, _)| is_structured(p)) {
        let text = std::str::from_utf8(contents)
            .map_err(|_| Error::invalid(format!("file `{path}` is not valid UTF-8")))?;
        let doc: Value = serde_yaml_ng::from_str(text)
            .map_err(|e| Error::invalid(format!("file `{path}` is not a structured document: {e}")))?;
        if !doc.is_mapping() {
            return Err(Error::invalid(format!(
                "file `{path}` does not contain a document mapping"
            )));
        }
    }
    Ok(())
}

/// Serializes the structured files of a bundle into envelope form.
///
/// `function_config` is attached verbatim when the invoked function declares
/// a configuration document.
pub fn to_envelope(bundle: &Bundle, function_config: Option<&Value>) -> Result<Vec<u8>> {
    let mut items = Vec::with_capacity(bundle.len());

    for (index, (path, contents)) in bundle.iter().filter(|(p, _)| is_structured(p)).enumerate() {
        let text = std::str::from_utf8(contents)
            .map_err(|_| Error::invalid(format!("file `{path}` is not valid UTF-8")))?;
        let mut doc: Value = serde_yaml_ng::from_str(text)
            .map_err(|e| Error::invalid(format!("file `{path}` is not a structured document: {e}")))?;
        if !doc.is_mapping() {
            return Err(Error::invalid(format!(
                "file `{path}` does not contain a document mapping"
            )));
        }
        annotate(&mut doc, path, index)?;
        items.push(doc);
    }

    let mut envelope = Mapping::new();
    envelope.insert(
        Value::from("apiVersion"),
        Value::from(ENVELOPE_API_VERSION),
    );
    envelope.insert(Value::from("kind"), Value::from(ENVELOPE_KIND));
    envelope.insert(Value::from("items"), Value::Sequence(items));
    if let Some(config) = function_config {
        envelope.insert(Value::from("functionConfig"), config.clone());
    }

    serde_yaml_ng::to_string(&Value::Mapping(envelope))
        .map(String::into_bytes)
        .map_err(|e| Error::internal(format!("envelope serialization failed: {e}")))
}

/// Parses an envelope back into a path-keyed bundle.
///
/// The bookkeeping annotations are stripped from every item. Two items with
/// the same path fail with `Conflict`.
pub fn from_envelope(bytes: &[u8]) -> Result<Bundle> {
    let envelope: Value = serde_yaml_ng::from_slice(bytes)
        .map_err(|e| Error::invalid(format!("malformed envelope: {e}")))?;

    let items = envelope
        .get("items")
        .and_then(Value::as_sequence)
        .ok_or_else(|| Error::invalid("envelope has no `items` list"))?;

    let mut bundle = Bundle::new();
    for item in items {
        let mut item = item.clone();
        let path = take_annotations(&mut item)?;
        if bundle.get(&path).is_some() {
            return Err(Error::conflict(format!(
                "envelope contains two items for path `{path}`"
            )));
        }
        let text = serde_yaml_ng::to_string(&item)
            .map_err(|e| Error::internal(format!("item serialization failed: {e}")))?;
        bundle.insert(path, text.into_bytes())?;
    }
    Ok(bundle)
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') {
        return Err(Error::invalid(format!(
            "bundle path `{path}` must be relative and non-empty"
        )));
    }
    if path.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
        return Err(Error::invalid(format!(
            "bundle path `{path}` contains an invalid segment"
        )));
    }
    Ok(())
}

/// Inserts the path and index annotations into a document.
fn annotate(doc: &mut Value, path: &str, index: usize) -> Result<()> {
    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::invalid("envelope item is not a mapping"))?;
    let metadata = map
        .entry(Value::from("metadata"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let metadata = metadata
        .as_mapping_mut()
        .ok_or_else(|| Error::invalid(format!("file `{path}` has a non-mapping `metadata`")))?;
    let annotations = metadata
        .entry(Value::from("annotations"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let annotations = annotations
        .as_mapping_mut()
        .ok_or_else(|| Error::invalid(format!("file `{path}` has non-mapping annotations")))?;
    annotations.insert(Value::from(PATH_ANNOTATION), Value::from(path));
    annotations.insert(Value::from(INDEX_ANNOTATION), Value::from(index.to_string()));
    Ok(())
}

/// Removes the bookkeeping annotations from an item, returning its path.
fn take_annotations(item: &mut Value) -> Result<String> {
    let map = item
        .as_mapping_mut()
        .ok_or_else(|| Error::invalid("envelope item is not a mapping"))?;

    let path = {
        let annotations = map
            .get_mut("metadata")
            .and_then(|m| m.as_mapping_mut())
            .and_then(|m| m.get_mut("annotations"))
            .and_then(|a| a.as_mapping_mut())
            .ok_or_else(|| Error::invalid("envelope item has no annotations"))?;
        let path = annotations
            .remove(PATH_ANNOTATION)
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| Error::invalid("envelope item lacks a path annotation"))?;
        annotations.remove(INDEX_ANNOTATION);
        path
    };

    // drop bookkeeping containers we emptied
    let empty_annotations = map
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(Value::as_mapping)
        .is_some_and(Mapping::is_empty);
    if empty_annotations {
        if let Some(metadata) = map.get_mut("metadata").and_then(Value::as_mapping_mut) {
            metadata.remove("annotations");
        }
    }
    let empty_metadata = map
        .get("metadata")
        .and_then(Value::as_mapping)
        .is_some_and(Mapping::is_empty);
    if empty_metadata {
        map.remove("metadata");
    }

    Ok(path)
}

//================================================================================================
// Tests
//================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bundle {
        let mut bundle = Bundle::new();
        bundle
            .insert(
                "namespace.yaml",
                "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: example\n",
            )
            .unwrap();
        bundle
            .insert(
                "cm.yaml",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  a: \"1\"\n",
            )
            .unwrap();
        bundle.insert("README.md", "docs, not config\n").unwrap();
        bundle
    }

    #[test]
    fn round_trip_preserves_documents() {
        let bundle = sample();
        let envelope = to_envelope(&bundle, None).unwrap();
        let parsed = from_envelope(&envelope).unwrap();

        // opaque files never enter the envelope
        assert_eq!(parsed.len(), 2);
        let ns: Value =
            serde_yaml_ng::from_slice(parsed.get("namespace.yaml").unwrap()).unwrap();
        let original: Value =
            serde_yaml_ng::from_slice(bundle.get("namespace.yaml").unwrap()).unwrap();
        assert_eq!(ns, original);
    }

    #[test]
    fn envelope_orders_by_path() {
        let envelope = to_envelope(&sample(), None).unwrap();
        let value: Value = serde_yaml_ng::from_slice(&envelope).unwrap();
        let items = value.get("items").and_then(Value::as_sequence).unwrap();
        let paths: Vec<&str> = items
            .iter()
            .map(|i| {
                i.get("metadata")
                    .and_then(|m| m.get("annotations"))
                    .and_then(|a| a.get(PATH_ANNOTATION))
                    .and_then(Value::as_str)
                    .unwrap()
            })
            .collect();
        assert_eq!(paths, vec!["cm.yaml", "namespace.yaml"]);
    }

    #[test]
    fn duplicate_paths_conflict() {
        let envelope = "\
apiVersion: config.kubernetes.io/v1
kind: ResourceList
items:
  - kind: ConfigMap
    metadata:
      name: one
      annotations:
        config.kubernetes.io/path: same.yaml
  - kind: ConfigMap
    metadata:
      name: two
      annotations:
        config.kubernetes.io/path: same.yaml
";
        match from_envelope(envelope.as_bytes()) {
            Err(Error::Conflict(_)) => {},
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn function_config_is_attached() {
        let config: Value = serde_yaml_ng::from_str("kind: SetLabels\nlabels:\n  tier: web\n").unwrap();
        let envelope = to_envelope(&sample(), Some(&config)).unwrap();
        let value: Value = serde_yaml_ng::from_slice(&envelope).unwrap();
        assert_eq!(
            value
                .get("functionConfig")
                .and_then(|c| c.get("kind"))
                .and_then(Value::as_str),
            Some("SetLabels")
        );
    }

    #[test]
    fn invalid_paths_rejected() {
        let mut bundle = Bundle::new();
        assert!(bundle.insert("/abs.yaml", "a: 1\n").is_err());
        assert!(bundle.insert("../up.yaml", "a: 1\n").is_err());
        assert!(bundle.insert("ok/../no.yaml", "a: 1\n").is_err());
    }
}
