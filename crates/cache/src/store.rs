// Persistent partial-download cache keyed by track identity

use crate::entry::{CacheEntry, Sidecar, SIDECAR_SUFFIX};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use spool_core::{AudioError, CacheConfig, Result, TrackId};
use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Chunk size used when hashing a blob
const HASH_CHUNK: usize = 256 * 1024;

/// Newly covered bytes that force a sidecar write
const SIDECAR_EVERY_BYTES: u64 = 1024 * 1024;

const DEFAULT_SIDECAR_INTERVAL: Duration = Duration::from_secs(2);

/// Result of a non-blocking cache read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeRead {
    /// Every requested byte was cached (the request is clipped at the total length)
    Complete(Vec<u8>),
    /// `data` is the contiguous cached prefix starting at the requested offset
    Partial {
        data: Vec<u8>,
        available: Vec<Range<u64>>,
        missing: Vec<Range<u64>>,
    },
}

impl RangeRead {
    pub fn data(&self) -> &[u8] {
        match self {
            RangeRead::Complete(data) => data,
            RangeRead::Partial { data, .. } => data,
        }
    }

    pub fn into_data(self) -> Vec<u8> {
        match self {
            RangeRead::Complete(data) => data,
            RangeRead::Partial { data, .. } => data,
        }
    }
}

/// An open cache entry, owned by one playback session
pub struct CacheHandle {
    id: TrackId,
    entry: Arc<Mutex<CacheEntry>>,
    open: AtomicBool,
}

impl CacheHandle {
    pub fn id(&self) -> &TrackId {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Whether writes still reach disk
    pub fn is_resumable(&self) -> bool {
        self.entry.lock().resumable
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AudioError::InvalidState(format!(
                "Cache handle for {} is closed",
                self.id
            )))
        }
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Cache store: one blob and one sidecar per track under a root directory
pub struct CacheStore {
    root: PathBuf,
    entries: Mutex<HashMap<TrackId, Arc<Mutex<CacheEntry>>>>,
    pinned: Mutex<HashMap<TrackId, usize>>,
    max_entries: Option<usize>,
    /// Longest a written range may go unrecorded in the sidecar
    sidecar_interval: Duration,
    /// Last handed-out access stamp; stamps are strictly increasing
    clock: AtomicU64,
}

impl CacheStore {
    /// Open (or create) a cache directory and load every sidecar in it
    pub fn open_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            AudioError::CacheIo(format!("create cache dir {}: {}", root.display(), e))
        })?;

        let mut entries = HashMap::new();
        let mut newest = 0;
        let listing = fs::read_dir(&root).map_err(|e| {
            AudioError::CacheIo(format!("list cache dir {}: {}", root.display(), e))
        })?;

        for item in listing.flatten() {
            let name = item.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(SIDECAR_SUFFIX) else {
                continue;
            };

            let sidecar = match Sidecar::load(&item.path()) {
                Ok(sidecar) => sidecar,
                Err(e) => {
                    log::warn!("[cache] dropping unreadable sidecar {}: {}", name, e);
                    let mut broken = CacheEntry::new(TrackId::new(""), &root, stem, 0);
                    broken.delete_files();
                    continue;
                }
            };
            if hash_id(&sidecar.track_id) != stem {
                log::warn!("[cache] sidecar {} does not match its track id, skipping", name);
                continue;
            }

            let mut entry = CacheEntry::from_sidecar(sidecar, &root, stem);
            if !entry.blob.exists() {
                entry.ranges.clear();
            }
            newest = newest.max(entry.last_access_ms);
            entries.insert(entry.id.clone(), Arc::new(Mutex::new(entry)));
        }

        log::info!(
            "[cache] opened {} with {} entries",
            root.display(),
            entries.len()
        );

        Ok(Self {
            root,
            entries: Mutex::new(entries),
            pinned: Mutex::new(HashMap::new()),
            max_entries: None,
            sidecar_interval: DEFAULT_SIDECAR_INTERVAL,
            clock: AtomicU64::new(newest),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Ok(Self::open_dir(&config.directory)?.with_max_entries(config.max_entries))
    }

    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// How often the sidecar is rewritten while a track downloads.
    /// It is always written on close and when the total length changes.
    pub fn with_sidecar_interval(mut self, interval: Duration) -> Self {
        self.sidecar_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the entry for `id`, creating it on first use
    pub fn open(&self, id: &TrackId) -> Result<CacheHandle> {
        let stamp = self.tick();
        let (entry, created) = {
            let mut entries = self.entries.lock();
            match entries.get(id) {
                Some(entry) => (entry.clone(), false),
                None => {
                    let entry = Arc::new(Mutex::new(CacheEntry::new(
                        id.clone(),
                        &self.root,
                        &hash_id(id),
                        stamp,
                    )));
                    entries.insert(id.clone(), entry.clone());
                    (entry, true)
                }
            }
        };

        let opened = {
            let mut e = entry.lock();
            e.last_access_ms = stamp;
            fs::create_dir_all(&self.root)
                .map_err(|err| {
                    AudioError::CacheIo(format!("create cache dir {}: {}", self.root.display(), err))
                })
                .and_then(|_| e.ensure_blob())
                .and_then(|_| e.persist())
                .map(|_| e.open_handles += 1)
        };

        if let Err(err) = opened {
            if created {
                self.entries.lock().remove(id);
            }
            log::error!("[cache] failed to open entry for {}: {}", id, err);
            return Err(err);
        }

        log::debug!("[cache] opened entry for {}", id);
        Ok(CacheHandle {
            id: id.clone(),
            entry,
            open: AtomicBool::new(true),
        })
    }

    /// Persist `bytes` at `offset`, writing only the sub-ranges not yet covered.
    /// The sidecar is rewritten every megabyte, every sidecar interval, and
    /// once the entry completes.
    ///
    /// Returns the number of newly covered bytes. A disk failure degrades the
    /// entry to pass-through: the error is returned once and later writes are
    /// accepted as no-ops.
    pub fn write_range(&self, handle: &CacheHandle, offset: u64, bytes: &[u8]) -> Result<u64> {
        handle.ensure_open()?;
        let mut e = handle.entry.lock();
        if !e.resumable {
            return Ok(0);
        }

        let mut end = offset + bytes.len() as u64;
        if let Some(total) = e.total_len {
            end = end.min(total);
        }
        if end <= offset {
            return Ok(0);
        }

        let gaps = e.ranges.gaps(offset..end);
        if gaps.is_empty() {
            return Ok(0);
        }

        let mut added = 0;
        for gap in &gaps {
            let slice = &bytes[(gap.start - offset) as usize..(gap.end - offset) as usize];
            if let Err(err) = e.write_at(gap.start, slice) {
                degrade(&mut e, &err);
                return Err(err);
            }
            added += e.ranges.insert(gap.clone());
        }

        e.last_access_ms = self.tick();
        e.unsaved += added;
        let due = e.unsaved >= SIDECAR_EVERY_BYTES
            || e.saved_at.elapsed() >= self.sidecar_interval
            || e.is_complete();
        if due {
            if let Err(err) = e.persist() {
                degrade(&mut e, &err);
                return Err(err);
            }
        }
        Ok(added)
    }

    /// Read `len` bytes at `offset` without blocking
    pub fn read_range(&self, handle: &CacheHandle, offset: u64, len: usize) -> Result<RangeRead> {
        handle.ensure_open()?;
        let mut e = handle.entry.lock();

        let mut end = offset + len as u64;
        if let Some(total) = e.total_len {
            end = end.min(total);
        }
        if end <= offset {
            return Ok(RangeRead::Complete(Vec::new()));
        }

        let prefix_end = e.ranges.contiguous_end_from(offset).min(end);
        let data = if prefix_end > offset {
            match e.read_at(offset, (prefix_end - offset) as usize) {
                Ok(data) => data,
                Err(err) => {
                    degrade(&mut e, &err);
                    return Err(err);
                }
            }
        } else {
            Vec::new()
        };

        if prefix_end == end {
            return Ok(RangeRead::Complete(data));
        }

        let available = e
            .ranges
            .ranges()
            .iter()
            .filter(|r| r.start < end && r.end > offset)
            .map(|r| r.start.max(offset)..r.end.min(end))
            .collect();
        let missing = e.ranges.gaps(offset..end);
        Ok(RangeRead::Partial {
            data,
            available,
            missing,
        })
    }

    pub fn covered_ranges(&self, handle: &CacheHandle) -> Vec<Range<u64>> {
        handle.entry.lock().ranges.ranges().to_vec()
    }

    pub fn covered_len(&self, handle: &CacheHandle) -> u64 {
        handle.entry.lock().ranges.covered_len()
    }

    pub fn total_len(&self, handle: &CacheHandle) -> Option<u64> {
        handle.entry.lock().total_len
    }

    /// Record the track's total length as reported by the source
    pub fn set_total_len(&self, handle: &CacheHandle, total: u64) -> Result<()> {
        handle.ensure_open()?;
        let mut e = handle.entry.lock();
        if e.total_len == Some(total) {
            return Ok(());
        }
        if let Some(previous) = e.total_len {
            log::warn!(
                "[cache] total length of {} changed from {} to {}, dropping cached ranges",
                e.id,
                previous,
                total
            );
            e.ranges.clear();
        }
        e.total_len = Some(total);
        e.ranges.truncate(total);
        if !e.resumable {
            return Ok(());
        }
        if let Err(err) = e.persist() {
            degrade(&mut e, &err);
            return Err(err);
        }
        Ok(())
    }

    /// First offset at or after `from` that is not cached
    pub fn resume_offset(&self, handle: &CacheHandle, from: u64) -> u64 {
        handle.entry.lock().ranges.contiguous_end_from(from)
    }

    pub fn is_complete(&self, handle: &CacheHandle) -> bool {
        handle.entry.lock().is_complete()
    }

    /// Protect `id` from eviction while a session uses it
    pub fn pin(&self, id: &TrackId) {
        *self.pinned.lock().entry(id.clone()).or_insert(0) += 1;
    }

    pub fn unpin(&self, id: &TrackId) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(id);
            }
        }
    }

    pub fn is_pinned(&self, id: &TrackId) -> bool {
        self.pinned.lock().contains_key(id)
    }

    /// Close a handle. A degraded entry is deleted once its last handle closes.
    pub fn close(&self, handle: &CacheHandle) {
        if !handle.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let drop_entry = {
            let mut e = handle.entry.lock();
            e.open_handles = e.open_handles.saturating_sub(1);
            e.last_access_ms = self.tick();
            if e.open_handles > 0 {
                false
            } else if !e.resumable {
                e.delete_files();
                true
            } else {
                e.release_file();
                if let Err(err) = e.persist() {
                    log::warn!("[cache] failed to persist {} on close: {}", e.id, err);
                }
                false
            }
        };

        if drop_entry {
            let mut entries = self.entries.lock();
            if entries
                .get(&handle.id)
                .map_or(false, |current| Arc::ptr_eq(current, &handle.entry))
            {
                entries.remove(&handle.id);
            }
            log::info!("[cache] removed non-resumable entry for {}", handle.id);
        }
    }

    /// Evict least-recently-used entries until the store fits `budget` bytes
    /// (and the entry limit, if any). Pinned and open entries are skipped.
    pub fn evict_if_needed(&self, budget: u64) -> Vec<TrackId> {
        let pinned = self.pinned.lock().clone();
        let mut entries = self.entries.lock();

        let mut total: u64 = entries.values().map(|e| e.lock().footprint()).sum();
        let mut count = entries.len();

        let mut candidates: Vec<(u64, TrackId, u64)> = entries
            .iter()
            .filter(|(id, _)| !pinned.contains_key(*id))
            .filter_map(|(id, entry)| {
                let e = entry.lock();
                (e.open_handles == 0).then(|| (e.last_access_ms, id.clone(), e.footprint()))
            })
            .collect();
        candidates.sort();

        let mut evicted = Vec::new();
        for (_, id, size) in candidates {
            let over_budget = total > budget;
            let over_count = self.max_entries.map_or(false, |max| count > max);
            if !over_budget && !over_count {
                break;
            }
            if let Some(entry) = entries.remove(&id) {
                entry.lock().delete_files();
                total -= size;
                count -= 1;
                log::info!("[cache] evicted {} ({} bytes)", id, size);
                evicted.push(id);
            }
        }

        if total > budget {
            log::warn!(
                "[cache] still {} bytes over budget after eviction (pinned entries)",
                total - budget
            );
        }
        evicted
    }

    /// Remove one entry. Fails for entries in use.
    pub fn remove(&self, id: &TrackId) -> Result<bool> {
        if self.is_pinned(id) {
            return Err(AudioError::InvalidState(format!(
                "Cache entry {} is in use",
                id
            )));
        }
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(id).cloned() else {
            return Ok(false);
        };
        let mut e = entry.lock();
        if e.open_handles > 0 {
            return Err(AudioError::InvalidState(format!(
                "Cache entry {} is in use",
                id
            )));
        }
        e.delete_files();
        entries.remove(id);
        Ok(true)
    }

    /// Remove every entry not in use; returns how many were removed
    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    /// Remove entries that hold no usable bytes: empty or non-resumable
    pub fn clean_incomplete(&self) -> usize {
        self.remove_where(|e| !e.resumable || e.ranges.is_empty())
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let pinned = self.pinned.lock().clone();
        let mut entries = self.entries.lock();
        let doomed: Vec<TrackId> = entries
            .iter()
            .filter(|(id, _)| !pinned.contains_key(*id))
            .filter(|(_, entry)| {
                let e = entry.lock();
                e.open_handles == 0 && predicate(&e)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &doomed {
            if let Some(entry) = entries.remove(id) {
                entry.lock().delete_files();
            }
        }
        if !doomed.is_empty() {
            log::info!("[cache] removed {} entries", doomed.len());
        }
        doomed.len()
    }

    /// Cached bytes across all entries
    pub fn total_size(&self) -> u64 {
        self.entries.lock().values().map(|e| e.lock().footprint()).sum()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn contains(&self, id: &TrackId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Path of the blob holding `id`'s bytes (possibly partial)
    pub fn blob_path(&self, id: &TrackId) -> Option<PathBuf> {
        self.entries.lock().get(id).map(|e| e.lock().blob.clone())
    }

    /// SHA-256 of a complete entry, as lowercase hex
    pub fn sha256(&self, handle: &CacheHandle) -> Result<String> {
        handle.ensure_open()?;
        let mut e = handle.entry.lock();
        let total = match e.total_len {
            Some(total) if e.is_complete() => total,
            _ => {
                return Err(AudioError::InvalidState(format!(
                    "Cache entry {} is incomplete",
                    e.id
                )))
            }
        };

        let mut hasher = Sha256::new();
        let mut offset = 0;
        while offset < total {
            let len = HASH_CHUNK.min((total - offset) as usize);
            let chunk = e.read_at(offset, len)?;
            hasher.update(&chunk);
            offset += len as u64;
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn tick(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let previous = self
            .clock
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}

fn degrade(entry: &mut CacheEntry, err: &AudioError) {
    if entry.resumable {
        log::warn!(
            "[cache] {} degraded to pass-through: {}",
            entry.id,
            err
        );
    }
    entry.resumable = false;
}

fn hash_id(id: &TrackId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}
