//! # Parcel Crate
//!
//! The `parcel` crate is the core of the orchard control plane. It models
//! *repositories of versioned configuration packages*, backed by remote git
//! repositories and OCI artifact registries, and mediates the lifecycle of
//! package revisions from draft through publication and deletion.
//!
//! ## Key Concepts
//!
//! **Package revisions** are versioned snapshots of a package's contents. A
//! revision carries a lifecycle label (`Draft`, `Proposed`, `Published`,
//! `DeletionProposed`) that constrains which operations apply to it and
//! whether its contents may still change.
//!
//! **Bundles** are the payload of a revision: a mapping of repository-relative
//! file paths to file contents, exchanged with transformation functions in a
//! canonical envelope form.
//!
//! **The manifest** (`Pkgfile`) lives inside the bundle and records where a
//! package was cloned from, the immutable upstream identifier pinned at clone
//! time, and the pipeline of functions applied on every edit.
//!
//! ## Architecture
//!
//! The crate is organized into several key modules:
//! - [`core`] - The data model: keys, revision ids, lifecycle labels.
//! - [`bundle`] - The resource-bundle codec (envelope ⇄ path-keyed mapping).
//! - [`manifest`] - The package manifest, with unknown-field preservation.
//! - [`storage`] - Backend abstraction plus the git and OCI implementations.
//! - [`cache`] - The materialized view of all known revisions, with
//!   background refresh and change notification.
//! - [`engine`] - The lifecycle state machine and mutation serialization.
//! - [`render`] - The function pipeline applied to draft contents.
//!
//! ## Durable state
//!
//! The crate holds no authoritative state of its own; all durable state lives
//! in the backends. Local git mirrors under the cache root are scratch data
//! and safe to delete at any time.

#![deny(missing_docs)]

use std::sync::LazyLock;

pub use self::bundle::Bundle;
pub use self::core::{Lifecycle, PackageName, RepoKey, RevisionId, RevisionKey};
pub use self::error::{Error, Result};
pub use self::manifest::Manifest;

pub mod bundle;
pub mod cache;
pub mod core;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod render;
pub mod storage;

/// The well-known filename of the package manifest inside a bundle.
pub static MANIFEST_FILE: LazyLock<String> = LazyLock::new(|| "Pkgfile".to_string());
