//! Directory-backed asset fetcher.
//!
//! Assets live on disk as `<key>.<extension>`. A mirror directory stands in
//! for the remote store; fetching copies a file from the mirror into the
//! local cache directory.

use std::fs;
use std::path::{Path, PathBuf};

use sonance_common::{AssetKey, AudioResult};
use tracing::{debug, warn};

use crate::fetch::{AssetFetcher, FetchCompletion};

/// Default cached file extension.
pub const DEFAULT_EXTENSION: &str = "ogg";

/// File name for an asset in a cache or mirror directory.
#[must_use]
pub fn asset_file_name(key: AssetKey, extension: &str) -> String {
    format!("{}.{extension}", key.uuid())
}

/// Fetcher copying assets from a mirror directory into a cache directory.
#[derive(Debug, Clone)]
pub struct CacheDirFetcher {
    cache_dir: PathBuf,
    mirror_dir: PathBuf,
    extension: String,
    completed: Vec<FetchCompletion>,
}

impl CacheDirFetcher {
    /// Create a fetcher. The cache directory is created if missing.
    pub fn new(cache_dir: impl Into<PathBuf>, mirror_dir: impl Into<PathBuf>) -> AudioResult<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            mirror_dir: mirror_dir.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            completed: Vec::new(),
        })
    }

    /// Use a different file extension.
    #[must_use]
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    /// Local cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path of `key` in the local cache.
    pub fn cache_path(&self, key: AssetKey) -> PathBuf {
        self.cache_dir.join(asset_file_name(key, &self.extension))
    }

    fn mirror_path(&self, key: AssetKey) -> PathBuf {
        self.mirror_dir.join(asset_file_name(key, &self.extension))
    }

    /// Assets currently in the local cache.
    pub fn cached_assets(&self) -> AudioResult<Vec<AssetKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| AssetKey::parse(stem).ok())
            {
                keys.push(key);
            }
        }
        keys.sort_by_key(|key| key.uuid());
        Ok(keys)
    }
}

impl AssetFetcher for CacheDirFetcher {
    fn has_local_bytes(&self, key: AssetKey) -> bool {
        self.cache_path(key).is_file()
    }

    fn request_fetch(&mut self, key: AssetKey) {
        let from = self.mirror_path(key);
        let to = self.cache_path(key);
        let completion = match fs::copy(&from, &to) {
            Ok(bytes) => {
                debug!("Fetched {key} ({bytes} bytes) into {}", to.display());
                FetchCompletion::succeeded(key)
            },
            Err(e) => {
                warn!("Failed to fetch {key} from {}: {e}", from.display());
                FetchCompletion::failed(key)
            },
        };
        self.completed.push(completion);
    }

    fn poll_completions(&mut self) -> Vec<FetchCompletion> {
        std::mem::take(&mut self.completed)
    }
}
