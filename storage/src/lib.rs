//! Blob storage shared by the web service and the scoring service.
//!
//! Both processes talk to a single container through [`BlobStore`]. The
//! backend is picked from a connection string:
//!
//! ```text
//! # Azure storage account
//! DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=...;EndpointSuffix=core.windows.net
//!
//! # Azurite emulator
//! UseDevelopmentStorage=true
//!
//! # Local directory, one sub-directory per container
//! file:///tmp/fitmusic-blobs
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore};
use thiserror::Error;

const EMULATOR_BLOB_URL: &str = "http://127.0.0.1:10000/devstoreaccount1";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A listed blob and its size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub size: usize,
}

/// One container in an object store, plus the public URL its blobs live under.
#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    base_url: String,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, base_url: impl Into<String>) -> Self {
        Self {
            store,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// In-process store, used by tests and local experiments.
    pub fn in_memory(base_url: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemory::new()), base_url)
    }

    pub fn from_connection_string(conn: &str, container: &str) -> Result<Self> {
        if let Some(root) = conn.strip_prefix("file://") {
            let dir = PathBuf::from(root).join(container);
            std::fs::create_dir_all(&dir)?;
            let store = LocalFileSystem::new_with_prefix(&dir)?;
            tracing::info!(dir = %dir.display(), "using local filesystem blob store");
            return Ok(Self::new(
                Arc::new(store),
                format!("file://{}", dir.display()),
            ));
        }

        let parts = parse_connection_string(conn)?;

        if parts
            .get("UseDevelopmentStorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            let store = MicrosoftAzureBuilder::new()
                .with_use_emulator(true)
                .with_container_name(container)
                .build()?;
            return Ok(Self::new(
                Arc::new(store),
                format!("{}/{}", EMULATOR_BLOB_URL, container),
            ));
        }

        let account = parts.get("AccountName").ok_or_else(|| {
            StorageError::InvalidConnectionString("missing AccountName".to_string())
        })?;
        let key = parts.get("AccountKey").ok_or_else(|| {
            StorageError::InvalidConnectionString("missing AccountKey".to_string())
        })?;
        let protocol = parts
            .get("DefaultEndpointsProtocol")
            .copied()
            .unwrap_or("https");
        let suffix = parts
            .get("EndpointSuffix")
            .copied()
            .unwrap_or(DEFAULT_ENDPOINT_SUFFIX);

        let store = MicrosoftAzureBuilder::new()
            .with_account(*account)
            .with_access_key(*key)
            .with_container_name(container)
            .build()?;

        let base_url = format!("{}://{}.blob.{}/{}", protocol, account, suffix, container);
        tracing::info!(url = %base_url, "using azure blob store");
        Ok(Self::new(Arc::new(store), base_url))
    }

    /// Public URL of a blob, as reported to clients.
    pub fn url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    /// Fetch a blob. A missing blob is `Ok(None)`, not an error.
    pub async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        match self.store.get(&Path::from(name)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a blob, replacing any previous content.
    pub async fn put(&self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        let data: Bytes = data.into();
        let len = data.len();
        self.store.put(&Path::from(name), data.into()).await?;
        tracing::debug!(blob = name, bytes = len, "blob written");
        Ok(())
    }

    /// All blobs under `prefix`, sorted by name.
    pub async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let prefix = Path::from(prefix);
        let metas: Vec<ObjectMeta> = self.store.list(Some(&prefix)).try_collect().await?;

        let mut entries: Vec<BlobEntry> = metas
            .into_iter()
            .map(|meta| BlobEntry {
                name: meta.location.to_string(),
                size: meta.size,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn parse_connection_string(conn: &str) -> Result<HashMap<&str, &str>> {
    let parts: HashMap<&str, &str> = conn
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.split_once('='))
        .collect();

    if parts.is_empty() {
        return Err(StorageError::InvalidConnectionString(
            "no key=value pairs".to_string(),
        ));
    }
    Ok(parts)
}
