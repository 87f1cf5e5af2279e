//! Result cache with single-flight builds
//!
//! Fingerprint -> result map with TTL, invalidation tags and at-most-one
//! concurrent builder per key. Optionally mirrored to a directory of JSON
//! files; the directory is owned by one process at a time.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::command::{AdapterKind, Command, StdinSource};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload, EvictReason};
use crate::exec::ExecutionResult;

/// Per-command cache policy.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    /// Explicit key; when unset the command fingerprint is used.
    pub key: Option<String>,
    /// Invalidation tags attached to the entry.
    pub tags: Vec<String>,
    /// Env keys that participate in the fingerprint.
    pub significant_env: Vec<String>,
    /// Mirror the entry to disk, when the cache has a directory.
    pub persist: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            key: None,
            tags: Vec::new(),
            significant_env: Vec::new(),
            persist: false,
        }
    }
}

impl CachePolicy {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }
}

/// Cache-wide configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry cap; zero disables the capacity bound.
    pub max_entries: usize,
    /// Directory for the optional disk mirror.
    pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            disk_dir: None,
        }
    }
}

/// Deterministic fingerprint of a command against its target.
pub fn fingerprint(cmd: &Command, significant_env: &[String]) -> String {
    let mut hasher = Sha256::new();

    hasher.update(cmd.target.kind().map(|k| k.to_string()).unwrap_or_default());
    hasher.update(b"\x1f");
    hasher.update(cmd.target.identity());
    hasher.update(b"\x1f");
    if let Some(line) = &cmd.shell_line {
        hasher.update(b"shell:");
        hasher.update(line.as_bytes());
    } else {
        hasher.update(cmd.program.as_deref().unwrap_or_default());
        for arg in &cmd.args {
            hasher.update(b"\x1f");
            hasher.update(arg.as_bytes());
        }
    }
    hasher.update(b"\x1f");
    match &cmd.stdin {
        StdinSource::Bytes(bytes) => hasher.update(bytes),
        StdinSource::Null => hasher.update(b"stdin:null"),
        StdinSource::Reader(_) => hasher.update(b"stdin:stream"),
        StdinSource::Inherit => hasher.update(b"stdin:inherit"),
    }
    hasher.update(b"\x1f");
    let env = cmd.merged_env();
    for key in significant_env {
        if let Some(value) = env.get(key) {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\x1f");
        }
    }
    if let Some(cwd) = &cmd.cwd {
        hasher.update(cwd.to_string_lossy().as_bytes());
    }

    hex::encode(hasher.finalize())
}

struct CacheEntry {
    result: ExecutionResult,
    created: Instant,
    ttl: Duration,
    tags: Vec<String>,
    last_access: Instant,
}

impl CacheEntry {
    fn fresh(&self) -> bool {
        self.created.elapsed() < self.ttl
    }

    fn size(&self) -> u64 {
        (self.result.stdout.len() + self.result.stderr.len()) as u64
    }
}

/// On-disk rendering of one entry.
#[derive(Serialize, Deserialize)]
struct DiskEntry {
    result: ExecutionResult,
    created_at: DateTime<Utc>,
    ttl: Duration,
    tags: Vec<String>,
}

type BuildOutcome = std::result::Result<ExecutionResult, Arc<Error>>;

/// Fingerprint-keyed result cache shared by an engine.
pub struct ResultCache {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    pending: DashMap<String, broadcast::Sender<BuildOutcome>>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        if let Some(dir) = &config.disk_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "cache directory unavailable");
            }
        }
        Self {
            config,
            entries: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up `key`, or run `build` under single-flight and store its
    /// result. Concurrent callers with the same key share one build.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &str,
        policy: &CachePolicy,
        bus: &EventBus,
        adapter: AdapterKind,
        build: F,
    ) -> Result<ExecutionResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExecutionResult>>,
    {
        loop {
            if let Some(result) = self.lookup(key, policy, bus, adapter) {
                return Ok(result);
            }

            // Join an in-flight build if one exists; otherwise claim the
            // builder slot. The subscription happens under the map entry so
            // a completing builder cannot slip between the check and the
            // wait.
            let mut rx = match self.pending.entry(key.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().subscribe(),
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, _rx) = broadcast::channel(1);
                    vacant.insert(tx.clone());
                    bus.emit(
                        adapter,
                        EventPayload::CacheMiss {
                            key: key.to_string(),
                        },
                    );
                    return self.run_builder(key, policy, bus, adapter, tx, build).await;
                }
            };

            match rx.recv().await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(shared)) => return Err(shared.duplicate()),
                // Builder dropped without publishing; start over.
                Err(_) => continue,
            }
        }
    }

    async fn run_builder<F, Fut>(
        &self,
        key: &str,
        policy: &CachePolicy,
        bus: &EventBus,
        adapter: AdapterKind,
        tx: broadcast::Sender<BuildOutcome>,
        build: F,
    ) -> Result<ExecutionResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExecutionResult>>,
    {
        // Release the single-flight slot on every exit path, including a
        // panicking builder; the entry (when the build succeeded) is
        // already visible by then, so latecomers hit instead of rebuild.
        let _slot = scopeguard::guard((key.to_string(), &self.pending), |(key, pending)| {
            pending.remove(&key);
        });

        let outcome = build().await;

        match outcome {
            Ok(result) => {
                self.insert(key, policy, result.clone(), bus, adapter);
                let _ = tx.send(Ok(result.clone()));
                Ok(result)
            }
            Err(error) => {
                // Failed builds are not cached.
                let shared = Arc::new(error.duplicate());
                let _ = tx.send(Err(shared));
                Err(error)
            }
        }
    }

    fn lookup(
        &self,
        key: &str,
        policy: &CachePolicy,
        bus: &EventBus,
        adapter: AdapterKind,
    ) -> Option<ExecutionResult> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.fresh() {
                entry.last_access = Instant::now();
                bus.emit(
                    adapter,
                    EventPayload::CacheHit {
                        key: key.to_string(),
                        ttl: Some(entry.ttl),
                    },
                );
                return Some(entry.result.clone());
            }
            drop(entry);
            self.evict(key, EvictReason::Ttl, bus, adapter);
        }

        if let Some(result) = self.load_from_disk(key) {
            self.entries.insert(
                key.to_string(),
                CacheEntry {
                    result: result.clone(),
                    created: Instant::now(),
                    ttl: policy.ttl,
                    tags: policy.tags.clone(),
                    last_access: Instant::now(),
                },
            );
            bus.emit(
                adapter,
                EventPayload::CacheHit {
                    key: key.to_string(),
                    ttl: Some(policy.ttl),
                },
            );
            return Some(result);
        }

        None
    }

    fn insert(
        &self,
        key: &str,
        policy: &CachePolicy,
        result: ExecutionResult,
        bus: &EventBus,
        adapter: AdapterKind,
    ) {
        let entry = CacheEntry {
            result,
            created: Instant::now(),
            ttl: policy.ttl,
            tags: policy.tags.clone(),
            last_access: Instant::now(),
        };
        let size = entry.size();

        if policy.persist {
            self.store_to_disk(key, &entry);
        }
        self.entries.insert(key.to_string(), entry);

        bus.emit(
            adapter,
            EventPayload::CacheSet {
                key: key.to_string(),
                ttl: Some(policy.ttl),
                size: Some(size),
            },
        );

        self.enforce_capacity(bus, adapter);
    }

    fn enforce_capacity(&self, bus: &EventBus, adapter: AdapterKind) {
        if self.config.max_entries == 0 {
            return;
        }
        while self.entries.len() > self.config.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().last_access)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => self.evict(&key, EvictReason::Capacity, bus, adapter),
                None => break,
            }
        }
    }

    fn evict(&self, key: &str, reason: EvictReason, bus: &EventBus, adapter: AdapterKind) {
        if self.entries.remove(key).is_some() {
            debug!(key, %reason, "evicted cache entry");
            self.remove_from_disk(key);
            bus.emit(
                adapter,
                EventPayload::CacheEvict {
                    key: key.to_string(),
                    reason,
                },
            );
        }
    }

    /// Drop one key.
    pub fn invalidate(&self, key: &str, bus: &EventBus, adapter: AdapterKind) {
        self.evict(key, EvictReason::Manual, bus, adapter);
    }

    /// Drop every entry carrying `tag`.
    pub fn invalidate_tag(&self, tag: &str, bus: &EventBus, adapter: AdapterKind) {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().tags.iter().any(|t| t == tag))
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.evict(&key, EvictReason::Tag, bus, adapter);
        }
    }

    /// Drop everything, without events. Used on dispose.
    pub fn clear(&self) {
        self.entries.clear();
    }

    // ========================================================================
    // Disk mirror
    // ========================================================================

    fn disk_path(&self, key: &str) -> Option<PathBuf> {
        self.config.disk_dir.as_ref().map(|dir| dir.join(format!("{}.json", key)))
    }

    fn store_to_disk(&self, key: &str, entry: &CacheEntry) {
        let Some(path) = self.disk_path(key) else {
            return;
        };
        let Some(dir) = self.config.disk_dir.as_ref() else {
            return;
        };

        let disk_entry = DiskEntry {
            result: entry.result.clone(),
            created_at: Utc::now(),
            ttl: entry.ttl,
            tags: entry.tags.clone(),
        };

        let write = || -> std::io::Result<()> {
            let file = tempfile::NamedTempFile::new_in(dir)?;
            serde_json::to_writer(&file, &disk_entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            file.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!(key, error = %e, "failed to mirror cache entry to disk");
        }
    }

    fn load_from_disk(&self, key: &str) -> Option<ExecutionResult> {
        let path = self.disk_path(key)?;
        let data = std::fs::read(&path).ok()?;
        let entry: DiskEntry = serde_json::from_slice(&data).ok()?;

        let age = Utc::now().signed_duration_since(entry.created_at);
        let age = age.to_std().unwrap_or(Duration::MAX);
        if age >= entry.ttl {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        Some(entry.result)
    }

    fn remove_from_disk(&self, key: &str) {
        if let Some(path) = self.disk_path(key) {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sample_result(stdout: &str) -> ExecutionResult {
        let mut result = ExecutionResult::new("sample", AdapterKind::Local);
        result.stdout = stdout.as_bytes().to_vec();
        result
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = Command::new("date").arg("+%s");
        let b = Command::new("date").arg("+%s");
        assert_eq!(fingerprint(&a, &[]), fingerprint(&b, &[]));

        let c = Command::new("date").arg("+%N");
        assert_ne!(fingerprint(&a, &[]), fingerprint(&c, &[]));
    }

    #[test]
    fn test_fingerprint_env_subset() {
        let sig = vec!["LANG".to_string()];
        let a = Command::new("env").env("LANG", "C").env("IGNORED", "1");
        let b = Command::new("env").env("LANG", "C").env("IGNORED", "2");
        let c = Command::new("env").env("LANG", "en_US");

        assert_eq!(fingerprint(&a, &sig), fingerprint(&b, &sig));
        assert_ne!(fingerprint(&a, &sig), fingerprint(&c, &sig));
    }

    #[test]
    fn test_fingerprint_stdin_bytes() {
        let a = Command::new("cat").stdin_bytes(&b"one"[..]);
        let b = Command::new("cat").stdin_bytes(&b"two"[..]);
        assert_ne!(fingerprint(&a, &[]), fingerprint(&b, &[]));
    }

    #[tokio::test]
    async fn test_hit_after_set() {
        let cache = ResultCache::new(CacheConfig::default());
        let bus = EventBus::new();
        let policy = CachePolicy::ttl(Duration::from_secs(60));

        let first = cache
            .get_or_build("k", &policy, &bus, AdapterKind::Local, || async {
                Ok(sample_result("one"))
            })
            .await
            .unwrap();
        assert_eq!(first.stdout, b"one");

        // Second call must not rebuild.
        let second = cache
            .get_or_build("k", &policy, &bus, AdapterKind::Local, || async {
                panic!("builder must not run on a hit")
            })
            .await
            .unwrap();
        assert_eq!(second.stdout, b"one");
    }

    #[tokio::test]
    async fn test_ttl_expiry_rebuilds() {
        let cache = ResultCache::new(CacheConfig::default());
        let bus = EventBus::new();
        let policy = CachePolicy::ttl(Duration::from_millis(10));

        cache
            .get_or_build("k", &policy, &bus, AdapterKind::Local, || async {
                Ok(sample_result("one"))
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let rebuilt = cache
            .get_or_build("k", &policy, &bus, AdapterKind::Local, || async {
                Ok(sample_result("two"))
            })
            .await
            .unwrap();
        assert_eq!(rebuilt.stdout, b"two");
    }

    #[tokio::test]
    async fn test_single_flight_one_builder() {
        let cache = Arc::new(ResultCache::new(CacheConfig::default()));
        let bus = Arc::new(EventBus::new());
        let policy = CachePolicy::ttl(Duration::from_secs(60));
        let builds = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let bus = bus.clone();
            let policy = policy.clone();
            let builds = builds.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_build("shared", &policy, &bus, AdapterKind::Local, || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(sample_result("shared"))
                    })
                    .await
                    .unwrap()
            }));
        }

        for task in tasks {
            let result = task.await.unwrap();
            assert_eq!(result.stdout, b"shared");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_build_not_cached() {
        let cache = ResultCache::new(CacheConfig::default());
        let bus = EventBus::new();
        let policy = CachePolicy::ttl(Duration::from_secs(60));

        let failed: Result<ExecutionResult> = cache
            .get_or_build("k", &policy, &bus, AdapterKind::Local, || async {
                Err(Error::Connection {
                    host: "h".into(),
                    message: "down".into(),
                })
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.is_empty());

        let ok = cache
            .get_or_build("k", &policy, &bus, AdapterKind::Local, || async {
                Ok(sample_result("recovered"))
            })
            .await
            .unwrap();
        assert_eq!(ok.stdout, b"recovered");
    }

    #[tokio::test]
    async fn test_capacity_eviction_lru() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 2,
            disk_dir: None,
        });
        let bus = EventBus::new();
        let policy = CachePolicy::ttl(Duration::from_secs(60));

        for key in ["a", "b", "c"] {
            cache
                .get_or_build(key, &policy, &bus, AdapterKind::Local, || async {
                    Ok(sample_result(key))
                })
                .await
                .unwrap();
            // Distinct last_access ordering.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let cache = ResultCache::new(CacheConfig::default());
        let bus = EventBus::new();
        let tagged = CachePolicy::ttl(Duration::from_secs(60)).tag("deploys");
        let untagged = CachePolicy::ttl(Duration::from_secs(60));

        for (key, policy) in [("a", &tagged), ("b", &tagged), ("c", &untagged)] {
            cache
                .get_or_build(key, policy, &bus, AdapterKind::Local, || async {
                    Ok(sample_result(key))
                })
                .await
                .unwrap();
        }

        cache.invalidate_tag("deploys", &bus, AdapterKind::Local);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_disk_mirror_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let policy = CachePolicy::ttl(Duration::from_secs(60)).persist();

        {
            let cache = ResultCache::new(CacheConfig {
                max_entries: 16,
                disk_dir: Some(dir.path().to_path_buf()),
            });
            cache
                .get_or_build("persisted", &policy, &bus, AdapterKind::Local, || async {
                    Ok(sample_result("on disk"))
                })
                .await
                .unwrap();
        }

        // A fresh cache over the same directory sees the entry.
        let cache = ResultCache::new(CacheConfig {
            max_entries: 16,
            disk_dir: Some(dir.path().to_path_buf()),
        });
        let result = cache
            .get_or_build("persisted", &policy, &bus, AdapterKind::Local, || async {
                panic!("must hit the disk mirror")
            })
            .await
            .unwrap();
        assert_eq!(result.stdout, b"on disk");
    }

    #[tokio::test]
    async fn test_cache_events() {
        use parking_lot::Mutex;

        let cache = ResultCache::new(CacheConfig::default());
        let bus = EventBus::new();
        let policy = CachePolicy::ttl(Duration::from_secs(60));

        let names = Arc::new(Mutex::new(Vec::new()));
        let names2 = names.clone();
        bus.subscribe("cache:*", move |event| {
            names2.lock().push(event.name().to_string());
        });

        cache
            .get_or_build("k", &policy, &bus, AdapterKind::Local, || async {
                Ok(sample_result("v"))
            })
            .await
            .unwrap();
        cache
            .get_or_build("k", &policy, &bus, AdapterKind::Local, || async {
                unreachable!()
            })
            .await
            .unwrap();

        let seen = names.lock().clone();
        assert_eq!(
            seen,
            vec![
                "cache:miss".to_string(),
                "cache:set".to_string(),
                "cache:hit".to_string()
            ]
        );
    }
}
