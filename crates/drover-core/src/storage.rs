//! Object storage access for checkpoints and tables.
//!
//! A `StorageProvider` pairs an `ObjectStore` with the key prefix taken from
//! its URL, so callers only deal in paths relative to what was configured.
//! Supported schemes are whatever `object_store` can parse: `s3://`, `gs://`,
//! `az://`/`abfss://`, `file://` and `memory://`.

use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::error::{InvalidUrlSnafu, StorageError, UnsupportedBackendSnafu};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Object store plus the key prefix it was configured with.
#[derive(Clone)]
pub struct StorageProvider {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    url: Url,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.url)
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with backend options
    /// (credentials, region, endpoint and so on).
    pub fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let parsed = Url::parse(url).context(InvalidUrlSnafu { url })?;
        let (store, prefix) =
            object_store::parse_url_opts(&parsed, options).context(UnsupportedBackendSnafu { url })?;

        Ok(Self {
            store: Arc::from(store),
            prefix,
            url: parsed,
        })
    }

    /// Wrap an existing store, e.g. a shared `InMemory` instance in tests.
    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: impl Into<Path>) -> Self {
        let prefix = prefix.into();
        let url = Url::parse(&format!("memory:///{prefix}")).unwrap_or_else(|_| {
            Url::parse("memory:///").expect("static URL is valid")
        });
        Self { store, prefix, url }
    }

    /// A fresh in-process store with no prefix.
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemory::new()), Path::default())
    }

    /// The URL this provider was built from.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether this provider is backed by process memory.
    pub fn is_memory(&self) -> bool {
        self.url.scheme() == "memory"
    }

    /// The underlying object store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Resolve a relative location (segments separated by `/`) under the prefix.
    pub fn path(&self, relative: &str) -> Path {
        relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.prefix.clone(), |path, segment| path.child(segment))
    }
}
