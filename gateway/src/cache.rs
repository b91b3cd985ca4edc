//! File-backed response cache keyed by request fingerprint.
//!
//! Committed entries live at `{dir}/{fingerprint}`; writers stream into
//! `{dir}/{fingerprint}.tmp.{nonce}` and publish atomically with a rename,
//! so readers never observe partial data. Each entry starts with a small
//! fixed-size header carrying the original status code, content type and
//! content encoding, letting a replay reconstruct the response bit-exact.
//!
//! # Coalescing
//!
//! At most one producer may exist per fingerprint. The first writer claims
//! the fingerprint in the in-flight table; concurrent requests for the same
//! fingerprint receive a wait handle and block until the producer commits
//! or aborts, then re-enter the lookup. Waiters never hold the table entry
//! while waiting.
//!
//! # Expiry and eviction
//!
//! Entries older than `expire` are treated as misses, except during the
//! grace period: while a fresh entry is being produced, other requests are
//! served the stale file instead of piling onto the backend. A background
//! sweeper removes long-expired files and, when the directory grows past
//! `max_size`, evicts the oldest entries first.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use rand::Rng;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::MAX_SWEEP_INTERVAL;
use common::config;

/// Fixed size of the on-disk entry header. The response body starts at
/// this offset.
pub const ENTRY_HEADER_SIZE: usize = 256;

const ENTRY_MAGIC: &[u8; 4] = b"CHGC";

/// Response metadata persisted in front of the body.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryHeader {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl EntryHeader {
    fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[..4].copy_from_slice(ENTRY_MAGIC);
        buf[4] = 1; // version
        buf[5..7].copy_from_slice(&self.status.to_le_bytes());
        let ct = self.content_type.as_deref().unwrap_or_default().as_bytes();
        let ce = self
            .content_encoding
            .as_deref()
            .unwrap_or_default()
            .as_bytes();
        // Both fields must fit the fixed header; anything longer is not a
        // value ClickHouse emits.
        let ct = &ct[..ct.len().min(120)];
        let ce = &ce[..ce.len().min(120)];
        buf[7] = ct.len() as u8;
        buf[8] = ce.len() as u8;
        buf[9..9 + ct.len()].copy_from_slice(ct);
        buf[9 + ct.len()..9 + ct.len() + ce.len()].copy_from_slice(ce);
        buf
    }

    fn decode(buf: &[u8; ENTRY_HEADER_SIZE]) -> std::io::Result<Self> {
        if &buf[..4] != ENTRY_MAGIC || buf[4] != 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed cache entry header",
            ));
        }
        let status = u16::from_le_bytes([buf[5], buf[6]]);
        let ct_len = buf[7] as usize;
        let ce_len = buf[8] as usize;
        let parse = |bytes: &[u8]| -> std::io::Result<Option<String>> {
            if bytes.is_empty() {
                return Ok(None);
            }
            std::str::from_utf8(bytes)
                .map(|s| Some(s.to_string()))
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "malformed cache entry header",
                    )
                })
        };
        Ok(Self {
            status,
            content_type: parse(&buf[9..9 + ct_len])?,
            content_encoding: parse(&buf[9 + ct_len..9 + ct_len + ce_len])?,
        })
    }
}

/// Completion signal shared between one producer and its waiters.
/// `None` means still in flight; `Some(true)` committed; `Some(false)`
/// aborted.
pub type WaitHandle = watch::Receiver<Option<bool>>;

/// Blocks until the producer commits or aborts. Returns `false` when the
/// producer aborted or vanished, meaning the caller should retry as a miss.
pub async fn await_producer(mut handle: WaitHandle) -> bool {
    loop {
        if let Some(done) = *handle.borrow() {
            return done;
        }
        if handle.changed().await.is_err() {
            // Producer dropped without signalling.
            return (*handle.borrow()).unwrap_or(false);
        }
    }
}

/// Result of a cache lookup.
pub enum Lookup {
    /// A committed (possibly stale-within-grace) entry.
    Hit { path: PathBuf },
    /// Another request is producing this entry right now.
    Wait(WaitHandle),
    Miss,
}

/// Result of claiming the producer role.
pub enum StartWrite {
    Producer(CacheWriter),
    /// Lost the race; wait for the winner instead.
    Wait(WaitHandle),
}

/// One named cache instance backed by a directory.
pub struct FileCache {
    name: String,
    dir: PathBuf,
    max_size: u64,
    expire: Duration,
    grace_time: Duration,
    in_flight: Arc<DashMap<String, WaitHandle>>,
    pub cfg: config::CacheConfig,
}

impl FileCache {
    /// Builds a cache over `cfg.dir`. When `prev` is a cache with the same
    /// name and directory (a reload that only changed sizes or expiry),
    /// the in-flight producer table is shared with it, so the single
    /// producer per fingerprint holds across the snapshot swap: writers
    /// started under the old object stay visible to the new one.
    pub fn from_config(
        cfg: &config::CacheConfig,
        prev: Option<&FileCache>,
    ) -> std::io::Result<Self> {
        let dir = PathBuf::from(&cfg.dir);
        std::fs::create_dir_all(&dir)?;
        let in_flight = prev
            .map(|p| p.in_flight.clone())
            .unwrap_or_default();
        Ok(Self {
            name: cfg.name.clone(),
            dir,
            max_size: cfg.max_size.as_u64(),
            expire: cfg.expire.as_std(),
            grace_time: cfg.grace_time.as_std(),
            in_flight,
            cfg: cfg.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sweep period derived from the expiry: short-lived caches are swept
    /// more aggressively, capped at one minute.
    pub fn sweep_interval(&self) -> Duration {
        if self.expire.is_zero() {
            MAX_SWEEP_INTERVAL
        } else {
            (self.expire / 2).clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL)
        }
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(fingerprint)
    }

    /// Looks up a fingerprint, applying expiry and grace rules.
    pub async fn get(&self, fingerprint: &str) -> std::io::Result<Lookup> {
        let path = self.entry_path(fingerprint);
        match fs::metadata(&path).await {
            Ok(meta) => {
                let age = meta
                    .modified()?
                    .elapsed()
                    .unwrap_or_default();
                if self.expire.is_zero() || age <= self.expire {
                    return Ok(Lookup::Hit { path });
                }
                // Expired. Within the grace period a stale entry is still
                // served as long as somebody is producing a fresh one.
                if age <= self.expire + self.grace_time && self.in_flight.contains_key(fingerprint)
                {
                    debug!(cache = %self.name, fingerprint, "serving stale entry within grace period");
                    return Ok(Lookup::Hit { path });
                }
                Ok(Lookup::Miss)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match self.in_flight.get(fingerprint) {
                    Some(handle) => Ok(Lookup::Wait(handle.clone())),
                    None => Ok(Lookup::Miss),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Opens a committed entry for replay. Returns the decoded header and a
    /// file positioned at the start of the body.
    pub async fn open(&self, path: &Path) -> std::io::Result<(EntryHeader, File)> {
        let mut file = File::open(path).await?;
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        file.read_exact(&mut buf).await?;
        Ok((EntryHeader::decode(&buf)?, file))
    }

    /// Claims the producer role for a fingerprint, or returns a wait handle
    /// when another producer got there first.
    pub async fn start_write(
        self: &Arc<Self>,
        fingerprint: &str,
        header: EntryHeader,
    ) -> std::io::Result<StartWrite> {
        use dashmap::mapref::entry::Entry;

        let (tx, rx) = watch::channel(None);
        match self.in_flight.entry(fingerprint.to_string()) {
            Entry::Occupied(e) => return Ok(StartWrite::Wait(e.get().clone())),
            Entry::Vacant(v) => {
                v.insert(rx);
            }
        }

        let nonce: u64 = rand::rng().random();
        let tmp_path = self
            .dir
            .join(format!("{fingerprint}.tmp.{nonce:016x}"));
        let mut file = match File::create(&tmp_path).await {
            Ok(f) => f,
            Err(e) => {
                self.in_flight.remove(fingerprint);
                let _ = tx.send(Some(false));
                return Err(e);
            }
        };
        if let Err(e) = file.write_all(&header.encode()).await {
            self.in_flight.remove(fingerprint);
            let _ = tx.send(Some(false));
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        Ok(StartWrite::Producer(CacheWriter {
            cache: self.clone(),
            fingerprint: fingerprint.to_string(),
            tmp_path,
            file: Some(file),
            done: tx,
            finished: false,
        }))
    }

    /// Total bytes and entry count of committed files on disk.
    pub async fn disk_stats(&self) -> std::io::Result<(u64, u64)> {
        let mut bytes = 0u64;
        let mut items = 0u64;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if is_temp_file(&entry.file_name()) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                bytes += meta.len();
                items += 1;
            }
        }
        Ok((bytes, items))
    }

    /// One sweep pass: drop entries expired past the grace period, then
    /// evict oldest-first until the directory fits `max_size`. Temp files
    /// are never touched.
    pub async fn sweep_once(&self) -> std::io::Result<()> {
        let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if is_temp_file(&entry.file_name()) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                files.push((entry.path(), meta.len(), meta.modified()?));
            }
        }

        if !self.expire.is_zero() {
            let deadline = self.expire + self.grace_time;
            let mut kept = Vec::with_capacity(files.len());
            for (path, len, mtime) in files {
                let age = mtime.elapsed().unwrap_or_default();
                if age > deadline {
                    debug!(cache = %self.name, path = %path.display(), "removing expired entry");
                    let _ = fs::remove_file(&path).await;
                } else {
                    kept.push((path, len, mtime));
                }
            }
            files = kept;
        }

        let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
        if total <= self.max_size {
            return Ok(());
        }
        files.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, len, _) in files {
            if total <= self.max_size {
                break;
            }
            debug!(cache = %self.name, path = %path.display(), "evicting entry over size limit");
            match fs::remove_file(&path).await {
                Ok(()) => total -= len,
                Err(e) => warn!(cache = %self.name, path = %path.display(), error = %e, "cannot evict cache entry"),
            }
        }
        Ok(())
    }
}

fn is_temp_file(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.contains(".tmp."))
}

/// Exclusive producer for one fingerprint. Exactly one of [`commit`] or
/// [`abort`] must be called; if the writer is dropped mid-flight (request
/// cancelled), the temp file is removed and waiters observe a failure.
///
/// [`commit`]: CacheWriter::commit
/// [`abort`]: CacheWriter::abort
pub struct CacheWriter {
    cache: Arc<FileCache>,
    fingerprint: String,
    tmp_path: PathBuf,
    file: Option<File>,
    done: watch::Sender<Option<bool>>,
    finished: bool,
}

impl CacheWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file
            .as_mut()
            .expect("writer already finished")
            .write_all(chunk)
            .await
    }

    /// Publishes the entry: fsync, atomic rename, wake all waiters.
    pub async fn commit(mut self) -> std::io::Result<u64> {
        let mut file = self.file.take().expect("writer already finished");
        file.flush().await?;
        file.sync_all().await?;
        let size = file.metadata().await?.len();
        drop(file);
        fs::rename(&self.tmp_path, self.cache.entry_path(&self.fingerprint)).await?;
        self.cache.in_flight.remove(&self.fingerprint);
        self.finished = true;
        let _ = self.done.send(Some(true));
        debug!(cache = %self.cache.name, fingerprint = %self.fingerprint, size, "cache entry committed");
        Ok(size)
    }

    /// Discards the entry: remove the temp file, signal failure to waiters.
    pub async fn abort(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.tmp_path).await;
        self.cache.in_flight.remove(&self.fingerprint);
        self.finished = true;
        let _ = self.done.send(Some(false));
        debug!(cache = %self.cache.name, fingerprint = %self.fingerprint, "cache entry aborted");
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Cancellation path: the owning task was dropped before commit or
        // abort ran. Clean up synchronously so no temp file leaks.
        self.file.take();
        let _ = std::fs::remove_file(&self.tmp_path);
        self.cache.in_flight.remove(&self.fingerprint);
        let _ = self.done.send(Some(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(dir: &Path, max_size: u64, expire: Duration, grace: Duration) -> Arc<FileCache> {
        let cfg = config::CacheConfig {
            name: "test".to_string(),
            dir: dir.display().to_string(),
            max_size: common::ByteSize(max_size),
            expire: common::Duration(expire),
            grace_time: common::Duration(grace),
        };
        Arc::new(FileCache::from_config(&cfg, None).unwrap())
    }

    fn header() -> EntryHeader {
        EntryHeader {
            status: 200,
            content_type: Some("text/plain; charset=utf-8".to_string()),
            content_encoding: None,
        }
    }

    async fn commit_entry(cache: &Arc<FileCache>, fingerprint: &str, body: &[u8]) {
        let StartWrite::Producer(mut w) = cache
            .start_write(fingerprint, header())
            .await
            .unwrap()
        else {
            panic!("expected producer role");
        };
        w.write_chunk(body).await.unwrap();
        w.commit().await.unwrap();
    }

    #[test]
    fn test_header_round_trip() {
        let h = EntryHeader {
            status: 404,
            content_type: Some("application/json".to_string()),
            content_encoding: Some("gzip".to_string()),
        };
        let decoded = EntryHeader::decode(&h.encode()).unwrap();
        assert_eq!(decoded, h);

        let empty = EntryHeader {
            status: 200,
            content_type: None,
            content_encoding: None,
        };
        assert_eq!(EntryHeader::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_header_rejects_garbage() {
        let buf = [0u8; ENTRY_HEADER_SIZE];
        assert!(EntryHeader::decode(&buf).is_err());
    }

    #[tokio::test]
    async fn test_commit_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), 1 << 20, Duration::ZERO, Duration::ZERO);

        commit_entry(&cache, "abc123", b"Ok.\n").await;

        let Lookup::Hit { path } = cache.get("abc123").await.unwrap() else {
            panic!("expected hit");
        };
        let (h, mut file) = cache.open(&path).await.unwrap();
        assert_eq!(h, header());
        let mut body = Vec::new();
        file.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"Ok.\n");
    }

    #[tokio::test]
    async fn test_miss_on_unknown_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), 1 << 20, Duration::ZERO, Duration::ZERO);
        assert!(matches!(cache.get("nope").await.unwrap(), Lookup::Miss));
    }

    #[tokio::test]
    async fn test_abort_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), 1 << 20, Duration::ZERO, Duration::ZERO);

        let StartWrite::Producer(mut w) =
            cache.start_write("fp", header()).await.unwrap()
        else {
            panic!("expected producer role");
        };
        w.write_chunk(b"partial").await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        w.abort().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(matches!(cache.get("fp").await.unwrap(), Lookup::Miss));
    }

    #[tokio::test]
    async fn test_drop_without_commit_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), 1 << 20, Duration::ZERO, Duration::ZERO);

        let StartWrite::Producer(w) = cache.start_write("fp", header()).await.unwrap() else {
            panic!("expected producer role");
        };
        drop(w);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(cache.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_single_producer_per_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), 1 << 20, Duration::ZERO, Duration::ZERO);

        let StartWrite::Producer(mut w) =
            cache.start_write("fp", header()).await.unwrap()
        else {
            panic!("expected producer role");
        };
        let StartWrite::Wait(handle) = cache.start_write("fp", header()).await.unwrap() else {
            panic!("second writer must wait");
        };
        // Lookup while in flight also routes to the wait handle.
        assert!(matches!(cache.get("fp").await.unwrap(), Lookup::Wait(_)));

        let waiter = tokio::spawn(await_producer(handle));
        w.write_chunk(b"Ok.\n").await.unwrap();
        w.commit().await.unwrap();
        assert!(waiter.await.unwrap());
        assert!(matches!(cache.get("fp").await.unwrap(), Lookup::Hit { .. }));
    }

    #[tokio::test]
    async fn test_waiters_observe_abort() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), 1 << 20, Duration::ZERO, Duration::ZERO);

        let StartWrite::Producer(w) = cache.start_write("fp", header()).await.unwrap() else {
            panic!("expected producer role");
        };
        let StartWrite::Wait(handle) = cache.start_write("fp", header()).await.unwrap() else {
            panic!("second writer must wait");
        };
        let waiter = tokio::spawn(await_producer(handle));
        w.abort().await;
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(
            dir.path(),
            1 << 20,
            Duration::from_millis(50),
            Duration::ZERO,
        );
        commit_entry(&cache, "fp", b"Ok.\n").await;
        assert!(matches!(cache.get("fp").await.unwrap(), Lookup::Hit { .. }));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(cache.get("fp").await.unwrap(), Lookup::Miss));
    }

    #[tokio::test]
    async fn test_grace_period_serves_stale_while_producing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(
            dir.path(),
            1 << 20,
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        commit_entry(&cache, "fp", b"Ok.\n").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        // No producer: expired entry is a plain miss.
        assert!(matches!(cache.get("fp").await.unwrap(), Lookup::Miss));

        // With a producer in flight the stale file is served.
        let StartWrite::Producer(w) = cache.start_write("fp", header()).await.unwrap() else {
            panic!("expected producer role");
        };
        assert!(matches!(cache.get("fp").await.unwrap(), Lookup::Hit { .. }));
        w.abort().await;
    }

    #[tokio::test]
    async fn test_sweep_removes_long_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(
            dir.path(),
            1 << 20,
            Duration::from_millis(10),
            Duration::ZERO,
        );
        commit_entry(&cache, "fp", b"Ok.\n").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.sweep_once().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        // Each entry is header + 100 bytes; cap fits two entries only.
        let entry_size = (ENTRY_HEADER_SIZE + 100) as u64;
        let cache = test_cache(dir.path(), 2 * entry_size, Duration::ZERO, Duration::ZERO);

        for fp in ["old", "mid", "new"] {
            commit_entry(&cache, fp, &[b'x'; 100]).await;
            // Distinct mtimes so eviction order is deterministic.
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        cache.sweep_once().await.unwrap();
        assert!(matches!(cache.get("old").await.unwrap(), Lookup::Miss));
        assert!(matches!(cache.get("mid").await.unwrap(), Lookup::Hit { .. }));
        assert!(matches!(cache.get("new").await.unwrap(), Lookup::Hit { .. }));

        let (bytes, items) = cache.disk_stats().await.unwrap();
        assert_eq!(items, 2);
        assert!(bytes <= 2 * entry_size);
    }

    #[tokio::test]
    async fn test_sweep_ignores_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), 1, Duration::ZERO, Duration::ZERO);

        let StartWrite::Producer(mut w) =
            cache.start_write("fp", header()).await.unwrap()
        else {
            panic!("expected producer role");
        };
        w.write_chunk(&[b'x'; 1000]).await.unwrap();

        cache.sweep_once().await.unwrap();
        // The in-flight temp file survives even though it exceeds max_size.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        w.abort().await;
    }
}
