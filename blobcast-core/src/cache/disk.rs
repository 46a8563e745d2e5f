use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{CacheBackend, CacheUsage, CachedSegment, SegmentKey, SEGMENT_CONTENT_TYPE};

struct DiskEntry {
    filename: String,
    bytes: u64,
    content_type: String,
    inserted_at: SystemTime,
    last_used: u64,
}

struct Inner {
    index: HashMap<SegmentKey, DiskEntry>,
    used_bytes: u64,
    tick: u64,
}

/// On-disk backend: one file per entry, in-memory index rebuilt by scanning
/// the directory at startup, so cached segments survive restarts.
pub struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Option<Duration>,
    inner: Mutex<Inner>,
}

impl DiskCache {
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64, ttl: Option<Duration>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut index = HashMap::new();
        let mut used_bytes = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some(key) = parse_entry_name(&filename) else {
                continue;
            };
            let inserted_at = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            used_bytes += metadata.len();
            index.insert(
                key,
                DiskEntry {
                    content_type: content_type_for(&filename),
                    filename,
                    bytes: metadata.len(),
                    inserted_at,
                    last_used: 0,
                },
            );
        }
        debug!(
            target: "cache",
            entries = index.len(),
            bytes = used_bytes,
            dir = %dir.display(),
            "disk cache index rebuilt"
        );
        Ok(Self {
            dir,
            max_bytes,
            ttl,
            inner: Mutex::new(Inner {
                index,
                used_bytes,
                tick: 0,
            }),
        })
    }

    fn expired(&self, entry: &DiskEntry) -> bool {
        match self.ttl {
            Some(ttl) => entry
                .inserted_at
                .elapsed()
                .map(|age| age > ttl)
                .unwrap_or(false),
            None => false,
        }
    }

    fn remove_locked(&self, inner: &mut Inner, key: &SegmentKey) -> Option<SegmentKey> {
        let entry = inner.index.remove(key)?;
        inner.used_bytes -= entry.bytes;
        if let Err(err) = std::fs::remove_file(self.dir.join(&entry.filename)) {
            warn!(target: "cache", file = %entry.filename, "failed to drop cache file: {err}");
        }
        Some(key.clone())
    }

    fn evict_lru(&self, inner: &mut Inner) -> Option<SegmentKey> {
        let victim = inner
            .index
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())?;
        self.remove_locked(inner, &victim)
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    async fn get(&self, key: &SegmentKey) -> Option<CachedSegment> {
        let (path, content_type) = {
            let mut inner = self.inner.lock().expect("disk cache lock");
            let expired = match inner.index.get(key) {
                Some(entry) => self.expired(entry),
                None => return None,
            };
            if expired {
                self.remove_locked(&mut inner, key);
                return None;
            }
            inner.tick += 1;
            let tick = inner.tick;
            let entry = inner.index.get_mut(key)?;
            entry.last_used = tick;
            (self.dir.join(&entry.filename), entry.content_type.clone())
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(CachedSegment {
                bytes: Bytes::from(bytes),
                content_type,
            }),
            Err(err) => {
                warn!(target: "cache", path = %path.display(), "cache file unreadable: {err}");
                let mut inner = self.inner.lock().expect("disk cache lock");
                self.remove_locked(&mut inner, key);
                None
            }
        }
    }

    async fn insert(&self, key: SegmentKey, value: CachedSegment) -> Vec<SegmentKey> {
        let size = value.bytes.len() as u64;
        let mut evicted = Vec::new();
        if size > self.max_bytes {
            return evicted;
        }
        let filename = entry_name(&key);
        let path = self.dir.join(&filename);
        if let Err(err) = tokio::fs::write(&path, &value.bytes).await {
            warn!(target: "cache", path = %path.display(), "failed to persist cache entry: {err}");
            return evicted;
        }
        let mut inner = self.inner.lock().expect("disk cache lock");
        let stale: Vec<SegmentKey> = inner
            .index
            .iter()
            .filter(|(_, entry)| self.expired(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for stale_key in stale {
            if let Some(removed) = self.remove_locked(&mut inner, &stale_key) {
                evicted.push(removed);
            }
        }
        if let Some(previous) = inner.index.remove(&key) {
            inner.used_bytes -= previous.bytes;
        }
        while inner.used_bytes + size > self.max_bytes {
            match self.evict_lru(&mut inner) {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.used_bytes += size;
        inner.index.insert(
            key,
            DiskEntry {
                filename,
                bytes: size,
                content_type: value.content_type,
                inserted_at: SystemTime::now(),
                last_used: tick,
            },
        );
        evicted
    }

    async fn contains(&self, key: &SegmentKey) -> bool {
        let inner = self.inner.lock().expect("disk cache lock");
        inner
            .index
            .get(key)
            .map(|entry| !self.expired(entry))
            .unwrap_or(false)
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock().expect("disk cache lock");
        let keys: Vec<SegmentKey> = inner.index.keys().cloned().collect();
        for key in keys {
            self.remove_locked(&mut inner, &key);
        }
    }

    async fn usage(&self) -> CacheUsage {
        let inner = self.inner.lock().expect("disk cache lock");
        CacheUsage {
            bytes: inner.used_bytes,
            entries: inner.index.len(),
        }
    }
}

/// `<video_id>=<object name>`; both sides come pre-sanitized so `=` never
/// appears inside them.
fn entry_name(key: &SegmentKey) -> String {
    format!("{}={}", key.video_id, key.name)
}

fn parse_entry_name(filename: &str) -> Option<SegmentKey> {
    let (video_id, name) = filename.split_once('=')?;
    if video_id.is_empty() || name.is_empty() {
        return None;
    }
    Some(SegmentKey::new(video_id, name))
}

fn content_type_for(filename: &str) -> String {
    let content_type = match filename.rsplit_once('.').map(|(_, ext)| ext) {
        Some("ts") => SEGMENT_CONTENT_TYPE,
        Some("vtt") => "text/vtt",
        Some("srt") => "application/x-subrip",
        _ => "application/octet-stream",
    };
    content_type.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn value(len: usize) -> CachedSegment {
        CachedSegment {
            bytes: Bytes::from(vec![7u8; len]),
            content_type: SEGMENT_CONTENT_TYPE.to_string(),
        }
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let key = SegmentKey::new("movie", "segment_00000.ts");
        {
            let cache = DiskCache::open(temp.path(), 1024 * 1024, None).unwrap();
            cache.insert(key.clone(), value(128)).await;
        }
        let reopened = DiskCache::open(temp.path(), 1024 * 1024, None).unwrap();
        let loaded = reopened.get(&key).await.unwrap();
        assert_eq!(loaded.bytes.len(), 128);
        assert_eq!(loaded.content_type, SEGMENT_CONTENT_TYPE);
        assert_eq!(reopened.usage().await.entries, 1);
    }

    #[tokio::test]
    async fn byte_bound_holds_on_disk() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 300, None).unwrap();
        for index in 0..10 {
            cache
                .insert(SegmentKey::new("v", format!("s{index}.ts")), value(100))
                .await;
            assert!(cache.usage().await.bytes <= 300);
        }
        // evicted entries are gone from disk as well
        let files = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(files, cache.usage().await.entries);
    }

    #[tokio::test]
    async fn clear_removes_files() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::open(temp.path(), 1024, None).unwrap();
        cache
            .insert(SegmentKey::new("v", "a.ts"), value(10))
            .await;
        cache.clear().await;
        assert_eq!(cache.usage().await.entries, 0);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn entry_names_roundtrip() {
        let key = SegmentKey::new("some-movie.2024", "segment_00042.ts");
        assert_eq!(parse_entry_name(&entry_name(&key)), Some(key));
        assert_eq!(parse_entry_name("noseparator"), None);
    }
}
