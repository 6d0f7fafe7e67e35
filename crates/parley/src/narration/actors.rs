//! On-disk cache of the voice-actor catalog.

use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parley_protocol::VoiceActor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct CachedActors {
    actors: Vec<VoiceActor>,
    /// Milliseconds since the Unix epoch.
    timestamp: i64,
}

/// Caches the catalog as `{actors, timestamp}` JSON for `ttl`.
#[derive(Debug, Clone)]
pub struct ActorCache {
    path: PathBuf,
    ttl: Duration,
}

impl ActorCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached actors, if the cache exists and is still fresh.
    pub fn load(&self) -> Option<Vec<VoiceActor>> {
        self.load_at(Utc::now())
    }

    /// Like [`load`](Self::load) with an explicit clock. Expired or unreadable caches
    /// are deleted.
    pub fn load_at(&self, now: DateTime<Utc>) -> Option<Vec<VoiceActor>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read actor cache {}: {}", self.path.display(), e);
                self.discard();
                return None;
            }
        };

        let cached: CachedActors = match serde_json::from_str(&text) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Discarding unreadable actor cache {}: {}", self.path.display(), e);
                self.discard();
                return None;
            }
        };

        let age_ms = i128::from(now.timestamp_millis()) - i128::from(cached.timestamp);
        if age_ms >= self.ttl.as_millis() as i128 {
            debug!("actor cache expired ({} ms old)", age_ms);
            self.discard();
            return None;
        }

        Some(cached.actors)
    }

    pub fn store(&self, actors: &[VoiceActor]) -> Result<()> {
        self.store_at(actors, Utc::now())
    }

    fn store_at(&self, actors: &[VoiceActor], now: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory {}", parent.display())
            })?;
        }
        let cached = CachedActors {
            actors: actors.to_vec(),
            timestamp: now.timestamp_millis(),
        };
        let json = serde_json::to_string_pretty(&cached)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write actor cache {}", self.path.display()))
    }

    /// Serve from the cache when fresh, otherwise call `fetch` and cache its result.
    /// `refresh` skips the cache lookup.
    pub async fn get_or_fetch<F, Fut>(&self, refresh: bool, fetch: F) -> Result<Vec<VoiceActor>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<VoiceActor>>>,
    {
        if !refresh {
            if let Some(actors) = self.load() {
                debug!("using {} cached voice actors", actors.len());
                return Ok(actors);
            }
        }

        let actors = fetch().await?;
        if let Err(e) = self.store(&actors) {
            warn!("{:#}", e);
        }
        Ok(actors)
    }

    fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove actor cache {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn actor(id: &str) -> VoiceActor {
        VoiceActor {
            id: id.to_string(),
            name: format!("Actor {id}"),
            styles: Vec::new(),
            sample_voice_url: None,
            small_image_url: None,
            picture_url: None,
        }
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_fresh_cache_is_served() {
        let dir = TempDir::new().unwrap();
        let cache = ActorCache::new(dir.path().join("nested/voice-actors.json"), DAY);
        cache.store(&[actor("a1")]).unwrap();

        let actors = cache.load().unwrap();
        assert_eq!(actors, vec![actor("a1")]);
    }

    #[test]
    fn test_expired_cache_is_deleted() {
        let dir = TempDir::new().unwrap();
        let cache = ActorCache::new(dir.path().join("voice-actors.json"), DAY);
        let stored_at = Utc::now();
        cache.store_at(&[actor("a1")], stored_at).unwrap();

        let almost = stored_at + chrono::Duration::hours(23);
        assert!(cache.load_at(almost).is_some());

        let later = stored_at + chrono::Duration::hours(24);
        assert!(cache.load_at(later).is_none());
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_corrupt_cache_is_deleted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("voice-actors.json");
        fs::write(&path, "{not json").unwrap();

        let cache = ActorCache::new(&path, DAY);
        assert!(cache.load().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_get_or_fetch_uses_cache_until_refresh() {
        let dir = TempDir::new().unwrap();
        let cache = ActorCache::new(dir.path().join("voice-actors.json"), DAY);

        let first = cache
            .get_or_fetch(false, || async { Ok::<_, anyhow::Error>(vec![actor("a1")]) })
            .await
            .unwrap();
        assert_eq!(first, vec![actor("a1")]);

        let cached = cache
            .get_or_fetch(false, || async {
                Err::<Vec<VoiceActor>, _>(anyhow::anyhow!("should not fetch"))
            })
            .await
            .unwrap();
        assert_eq!(cached, vec![actor("a1")]);

        let refreshed = cache
            .get_or_fetch(true, || async { Ok::<_, anyhow::Error>(vec![actor("a2")]) })
            .await
            .unwrap();
        assert_eq!(refreshed, vec![actor("a2")]);
        assert_eq!(cache.load().unwrap(), vec![actor("a2")]);
    }
}
