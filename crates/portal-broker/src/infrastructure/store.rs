//! Persistence gateway: the `DocumentStore` seam and a JSON-file store.
//!
//! The broker consumes a small, MongoDB-shaped document API — `find_one`,
//! `insert_one`, `update_one` — and never cares what sits behind it. The
//! trait is the seam: unit tests mock it, production deployments can plug a
//! real database client, and the bundled [`JsonFileStore`] keeps one JSON
//! array file per `(db, collection)` under a data directory.
//!
//! # File layout
//!
//! ```text
//! <data_dir>/<db>/<collection>.json    # JSON array of documents
//! ```
//!
//! A missing file reads as an empty collection, so first run needs no setup.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

/// Error type for document-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A collection file held invalid JSON.
    #[error("failed to parse stored JSON at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A document could not be serialized.
    #[error("failed to serialize document: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Failure reported by a non-file backend implementation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Asynchronous document store consumed by the ownership controller.
///
/// Filters are equality-subset matches: a document matches when every
/// key/value pair of the filter object equals the corresponding document
/// field.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the first document matching `filter`, or `None`.
    async fn find_one(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, StoreError>;

    /// Appends a document to the collection.
    async fn insert_one(&self, db: &str, collection: &str, doc: Value) -> Result<(), StoreError>;

    /// Merges the top-level fields of `patch` into the first document
    /// matching `filter`. Matching nothing is not an error.
    async fn update_one(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
        patch: Value,
    ) -> Result<(), StoreError>;
}

// ── JSON-file implementation ──────────────────────────────────────────────────

/// Durable document store backed by pretty-printed JSON files.
///
/// All operations serialize through one async mutex: collections are small
/// (one document per iot device) and a read-modify-write cycle must never
/// interleave with another.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    io_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            io_lock: Mutex::new(()),
        }
    }

    fn collection_path(&self, db: &str, collection: &str) -> PathBuf {
        self.root.join(db).join(format!("{collection}.json"))
    }

    /// Reads a collection file, treating a missing file as an empty collection.
    async fn read_collection(&self, path: &Path) -> Result<Vec<Value>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Writes a collection file, creating parent directories as needed.
    async fn write_collection(&self, path: &Path, docs: &[Value]) -> Result<(), StoreError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        let content = serde_json::to_vec_pretty(docs).map_err(StoreError::Serialize)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Equality-subset filter match.
fn matches_filter(doc: &Value, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return false;
    };
    filter.iter().all(|(key, want)| doc.get(key) == Some(want))
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn find_one(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Option<Value>, StoreError> {
        let _guard = self.io_lock.lock().await;
        let path = self.collection_path(db, collection);
        let docs = self.read_collection(&path).await?;
        Ok(docs.into_iter().find(|doc| matches_filter(doc, filter)))
    }

    async fn insert_one(&self, db: &str, collection: &str, doc: Value) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let path = self.collection_path(db, collection);
        let mut docs = self.read_collection(&path).await?;
        docs.push(doc);
        self.write_collection(&path, &docs).await
    }

    async fn update_one(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
        patch: Value,
    ) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let path = self.collection_path(db, collection);
        let mut docs = self.read_collection(&path).await?;

        if let Some(doc) = docs.iter_mut().find(|doc| matches_filter(doc, filter)) {
            if let (Some(target), Some(fields)) = (doc.as_object_mut(), patch.as_object()) {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
            self.write_collection(&path, &docs).await?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
