//! Persistent association and nonce storage used by the OpenID client.
//!
//! Two backends exist: a directory tree on local disk and a CouchDB
//! database. Which one is used is decided once from configuration; the
//! handle is opened on first use so requests that never reach the
//! protocol layer (unauthorized logins, logout) never touch storage.

mod couchdb;
mod filesystem;

pub use couchdb::CouchDbStore;
pub use filesystem::FilesystemStore;

use crate::error::StoreError;
use crate::http::HttpClient;
use crate::openid::Association;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use url::Url;

#[async_trait]
pub trait AssociationStore: Send + Sync {
    async fn store_association(
        &self,
        server_url: &str,
        association: &Association,
    ) -> Result<(), StoreError>;

    /// Association by handle, or the most recently issued unexpired one.
    async fn get_association(
        &self,
        server_url: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>, StoreError>;

    /// Returns whether an association was removed.
    async fn remove_association(&self, server_url: &str, handle: &str)
    -> Result<bool, StoreError>;

    /// Records a nonce. `false` when it was seen before or its timestamp is
    /// outside the allowed skew.
    async fn use_nonce(
        &self,
        server_url: &str,
        timestamp: i64,
        salt: &str,
    ) -> Result<bool, StoreError>;

    /// Drops nonces outside the skew window; returns how many were removed.
    async fn cleanup_nonces(&self) -> Result<usize, StoreError>;

    /// Drops expired associations; returns how many were removed.
    async fn cleanup_associations(&self) -> Result<usize, StoreError>;
}

/// Which backend holds associations and nonces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Filesystem { root: PathBuf },
    /// `url` names the database, e.g. `http://couch:5984/openid`.
    CouchDb { url: Url },
}

impl StoreBackend {
    pub async fn open(&self, http: &HttpClient) -> Result<Arc<dyn AssociationStore>, StoreError> {
        match self {
            StoreBackend::Filesystem { root } => {
                Ok(Arc::new(FilesystemStore::open(root.clone()).await?))
            }
            StoreBackend::CouchDb { url } => {
                Ok(Arc::new(CouchDbStore::new(http.clone(), url.clone())))
            }
        }
    }
}

/// Store handle opened on first access.
pub struct LazyStore {
    backend: Option<(StoreBackend, HttpClient)>,
    cell: OnceCell<Arc<dyn AssociationStore>>,
}

impl LazyStore {
    pub fn new(backend: StoreBackend, http: HttpClient) -> Self {
        Self {
            backend: Some((backend, http)),
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already open store.
    pub fn from_store(store: Arc<dyn AssociationStore>) -> Self {
        Self {
            backend: None,
            cell: OnceCell::new_with(Some(store)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<dyn AssociationStore>, StoreError> {
        self.cell
            .get_or_try_init(|| async {
                match &self.backend {
                    Some((backend, http)) => {
                        tracing::debug!(?backend, "opening association store");
                        backend.open(http).await
                    }
                    None => Err(StoreError::Unavailable("no backend configured".into())),
                }
            })
            .await
            .cloned()
    }
}

/// Hex SHA-256, used to turn URLs and handles into file names and doc ids.
pub(crate) fn digest(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
