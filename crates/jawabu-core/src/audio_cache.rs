//! Content-addressed cache for rendered TTS audio.
//!
//! Keys are derived from the normalised plain text plus language and voice
//! model, so identical speech renders to identical keys and concurrent
//! writers are harmlessly idempotent. Stores are write-behind: callers get
//! their audio back before the backing medium has accepted the blob, and
//! store failures are logged rather than surfaced.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;

/// A cached blob plus its media type.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

/// Blob storage seam (the hosted implementation is a collaborator).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>>;
    async fn put(&self, key: &str, bytes: Vec<u8>, media_type: &str) -> Result<()>;
}

/// In-memory store, used in tests and single-node deployments.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, media_type: &str) -> Result<()> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                media_type: media_type.to_string(),
            },
        );
        Ok(())
    }
}

/// Filesystem store rooted at a local directory. The media type is recovered
/// from the key's extension on read.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are produced by `cache_key` and contain only sanitised
        // segments, but never trust them as paths outright.
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(sanitize_segment(segment));
        }
        path
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(StoredObject {
                bytes,
                media_type: media_type_for_key(key).to_string(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, _media_type: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

/// Read-through/write-behind front over an [`ObjectStore`].
#[derive(Clone)]
pub struct AudioCache {
    store: Arc<dyn ObjectStore>,
}

impl AudioCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// `{language}/{model}/{hex}.{ext}` over the normalised text.
    pub fn cache_key(
        normalised_text: &str,
        language: &str,
        model_name: &str,
        media_type: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalised_text.as_bytes());
        hasher.update(b"|");
        hasher.update(language.as_bytes());
        hasher.update(b"|");
        hasher.update(model_name.as_bytes());
        let digest = hasher.finalize();
        let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        format!(
            "{}/{}/{}.{}",
            sanitize_segment(language),
            sanitize_segment(model_name),
            hash,
            extension_for(media_type)
        )
    }

    /// Non-blocking read; backend failures degrade to a miss.
    pub async fn lookup(&self, key: &str) -> Option<StoredObject> {
        match self.store.get(key).await {
            Ok(Some(object)) => {
                info!(key, size = object.bytes.len(), "Audio cache hit");
                Some(object)
            }
            Ok(None) => {
                debug!(key, "Audio cache miss");
                None
            }
            Err(err) => {
                warn!(key, error = %err, "Audio cache lookup failed");
                None
            }
        }
    }

    /// Fire-and-forget store. Failures are logged, never propagated.
    pub fn store_behind(&self, key: String, bytes: Vec<u8>, media_type: String) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let size = bytes.len();
            match store.put(&key, bytes, &media_type).await {
                Ok(()) => info!(key, size, "Cached rendered audio"),
                Err(err) => warn!(key, error = %err, "Failed to cache rendered audio"),
            }
        });
    }
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        _ => "bin",
    }
}

fn media_type_for_key(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_and_namespaced() {
        let a = AudioCache::cache_key("hello world", "en-US", "en-US-AriaNeural", "audio/mpeg");
        let b = AudioCache::cache_key("hello world", "en-US", "en-US-AriaNeural", "audio/mpeg");
        assert_eq!(a, b);
        assert!(a.starts_with("en-US/en-US-AriaNeural/"));
        assert!(a.ends_with(".mp3"));
    }

    #[test]
    fn key_separates_voice_models() {
        let a = AudioCache::cache_key("hello", "en-US", "en-US-AriaNeural", "audio/mpeg");
        let b = AudioCache::cache_key("hello", "en-US", "en-US-JennyNeural", "audio/mpeg");
        assert_ne!(a, b);
    }

    #[test]
    fn model_names_are_sanitised_for_the_flat_namespace() {
        let key = AudioCache::cache_key("hi", "en-US", "weird voice/name", "audio/wav");
        assert!(key.starts_with("en-US/weird_voice_name/"));
    }

    #[tokio::test]
    async fn lookup_returns_what_store_behind_wrote() {
        let cache = AudioCache::new(Arc::new(MemoryObjectStore::default()));
        let key = AudioCache::cache_key("hello", "en-US", "aria", "audio/mpeg");
        cache.store_behind(key.clone(), vec![1, 2, 3], "audio/mpeg".into());

        // Write-behind: give the spawned store a few polls to land.
        let mut found = None;
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if let Some(object) = cache.lookup(&key).await {
                found = Some(object);
                break;
            }
        }
        let object = found.expect("stored object should become visible");
        assert_eq!(object.bytes, vec![1, 2, 3]);
        assert_eq!(object.media_type, "audio/mpeg");
    }

    #[tokio::test]
    async fn concurrent_stores_on_one_key_are_idempotent() {
        let store = Arc::new(MemoryObjectStore::default());
        let cache = AudioCache::new(store.clone());
        let key = AudioCache::cache_key("same text", "en-US", "aria", "audio/mpeg");

        cache.store_behind(key.clone(), vec![7; 16], "audio/mpeg".into());
        cache.store_behind(key.clone(), vec![7; 16], "audio/mpeg".into());
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let object = store.get(&key).await.unwrap().unwrap();
        assert_eq!(object.bytes, vec![7; 16]);
    }

    #[tokio::test]
    async fn fs_store_round_trips_and_misses_cleanly() {
        let root = std::env::temp_dir().join(format!(
            "jawabu-audio-cache-test-{}",
            std::process::id()
        ));
        let store = FsObjectStore::new(&root);

        assert!(store.get("en-US/aria/none.mp3").await.unwrap().is_none());
        store
            .put("en-US/aria/abc.mp3", vec![9, 9], "audio/mpeg")
            .await
            .unwrap();
        let object = store.get("en-US/aria/abc.mp3").await.unwrap().unwrap();
        assert_eq!(object.bytes, vec![9, 9]);
        assert_eq!(object.media_type, "audio/mpeg");

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
