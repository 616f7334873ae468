// One cached track: blob file plus JSON sidecar of covered ranges

use crate::range_set::RangeSet;
use serde::{Deserialize, Serialize};
use spool_core::{AudioError, Result, TrackId};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub(crate) const BLOB_EXTENSION: &str = "blob";
pub(crate) const SIDECAR_SUFFIX: &str = ".ranges.json";

/// On-disk description of a cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Sidecar {
    pub track_id: TrackId,
    pub total_len: Option<u64>,
    /// Ordered `[start, end)` pairs
    pub ranges: Vec<(u64, u64)>,
    pub last_access_ms: u64,
}

impl Sidecar {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| cache_io("read sidecar", path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AudioError::CacheIo(format!("parse sidecar {}: {}", path.display(), e)))
    }

    /// Write through a temporary file so a crash never leaves a torn sidecar
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| AudioError::CacheIo(format!("encode sidecar: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| cache_io("write sidecar", &tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| cache_io("rename sidecar", path, e))
    }
}

/// State of one cached track
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) id: TrackId,
    pub(crate) ranges: RangeSet,
    pub(crate) total_len: Option<u64>,
    pub(crate) last_access_ms: u64,
    /// Cleared after a disk failure; the entry is dropped when its handle closes
    pub(crate) resumable: bool,
    pub(crate) blob: PathBuf,
    pub(crate) sidecar: PathBuf,
    file: Option<File>,
    pub(crate) open_handles: usize,
    /// Bytes covered since the sidecar was last written
    pub(crate) unsaved: u64,
    pub(crate) saved_at: Instant,
}

impl CacheEntry {
    pub(crate) fn new(id: TrackId, root: &Path, stem: &str, last_access_ms: u64) -> Self {
        Self {
            id,
            ranges: RangeSet::new(),
            total_len: None,
            last_access_ms,
            resumable: true,
            blob: root.join(format!("{}.{}", stem, BLOB_EXTENSION)),
            sidecar: root.join(format!("{}{}", stem, SIDECAR_SUFFIX)),
            file: None,
            open_handles: 0,
            unsaved: 0,
            saved_at: Instant::now(),
        }
    }

    pub(crate) fn from_sidecar(sidecar: Sidecar, root: &Path, stem: &str) -> Self {
        let mut entry = Self::new(sidecar.track_id, root, stem, sidecar.last_access_ms);
        entry.ranges = RangeSet::from_pairs(&sidecar.ranges);
        entry.total_len = sidecar.total_len;
        if let Some(total) = entry.total_len {
            entry.ranges.truncate(total);
        }
        entry
    }

    pub fn id(&self) -> &TrackId {
        &self.id
    }

    pub fn ranges(&self) -> &RangeSet {
        &self.ranges
    }

    pub fn total_len(&self) -> Option<u64> {
        self.total_len
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    pub fn is_complete(&self) -> bool {
        match self.total_len {
            Some(0) => true,
            Some(total) => self.ranges.contains(0..total),
            None => false,
        }
    }

    pub(crate) fn sidecar(&self) -> Sidecar {
        Sidecar {
            track_id: self.id.clone(),
            total_len: self.total_len,
            ranges: self.ranges.to_pairs(),
            last_access_ms: self.last_access_ms,
        }
    }

    pub(crate) fn persist(&mut self) -> Result<()> {
        self.sidecar().save(&self.sidecar)?;
        self.unsaved = 0;
        self.saved_at = Instant::now();
        Ok(())
    }

    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.blob)
                .map_err(|e| cache_io("open blob", &self.blob, e))?;
            self.file = Some(file);
        }
        // Populated just above
        self.file
            .as_mut()
            .ok_or_else(|| AudioError::CacheIo("blob handle unavailable".to_string()))
    }

    pub(crate) fn ensure_blob(&mut self) -> Result<()> {
        self.file().map(|_| ())
    }

    pub(crate) fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let blob = self.blob.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(bytes))
            .map_err(|e| cache_io("write blob", &blob, e))
    }

    pub(crate) fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let blob = self.blob.clone();
        let file = self.file()?;
        let mut data = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut data))
            .map_err(|e| cache_io("read blob", &blob, e))?;
        Ok(data)
    }

    pub(crate) fn release_file(&mut self) {
        self.file = None;
    }

    /// Delete blob and sidecar; missing files are fine
    pub(crate) fn delete_files(&mut self) {
        self.file = None;
        for path in [&self.blob, &self.sidecar] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("[cache] failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Bytes the entry occupies against the budget
    pub(crate) fn footprint(&self) -> u64 {
        self.ranges.covered_len()
    }
}

fn cache_io(action: &str, path: &Path, err: std::io::Error) -> AudioError {
    AudioError::CacheIo(format!("{} {}: {}", action, path.display(), err))
}
