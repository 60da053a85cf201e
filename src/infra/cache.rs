//! Content-addressed cache of circuit setup artifacts
//!
//! Setup (settings, compiled circuit, SRS, keys) depends only on the model
//! bytes, so it is keyed by model fingerprint and shared across every job for
//! that model. Entries are written to a private staging directory and renamed
//! into place, so readers never see a half-written set.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::crypto::is_hex_digest;
use crate::domain::SETUP_ARTIFACTS;

use super::{ProverError, Result};

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    populations: AtomicU64,
    races_lost: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn populations(&self) -> u64 {
        self.populations.load(Ordering::Relaxed)
    }

    /// Populations discarded because another writer installed the entry first
    pub fn races_lost(&self) -> u64 {
        self.races_lost.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "hits": self.hits(),
            "misses": self.misses(),
            "populations": self.populations(),
            "races_lost": self.races_lost(),
            "hit_rate": self.hit_rate(),
        })
    }
}

/// A complete cached artifact set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub fingerprint: String,
    pub dir: PathBuf,
}

impl ArtifactSet {
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Result of [`ArtifactCache::populate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    Created,
    /// A complete entry already existed; nothing was changed
    AlreadyPresent,
}

/// Summary of one on-disk cache entry, for operators
#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
    pub fingerprint: String,
    pub complete: bool,
    pub size_bytes: u64,
}

/// Artifact cache rooted at a directory, one subdirectory per fingerprint
pub struct ArtifactCache {
    root: PathBuf,
    stats: CacheStats,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stats: CacheStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn entry_dir(&self, fingerprint: &str) -> Result<PathBuf> {
        if !is_hex_digest(fingerprint) {
            return Err(ProverError::Cache(format!(
                "invalid fingerprint: {fingerprint:?}"
            )));
        }
        Ok(self.root.join(fingerprint))
    }

    /// Return the cached set for `fingerprint` if every artifact is present
    pub fn lookup(&self, fingerprint: &str) -> Result<Option<ArtifactSet>> {
        let dir = self.entry_dir(fingerprint)?;

        if is_complete(&dir) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint, "artifact cache hit");
            return Ok(Some(ArtifactSet {
                fingerprint: fingerprint.to_string(),
                dir,
            }));
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint, "artifact cache miss");
        Ok(None)
    }

    /// Install the setup artifacts found in `source_dir` under `fingerprint`
    pub fn populate(&self, fingerprint: &str, source_dir: &Path) -> Result<PopulateOutcome> {
        let final_dir = self.entry_dir(fingerprint)?;

        for name in SETUP_ARTIFACTS {
            if !source_dir.join(name).is_file() {
                return Err(ProverError::Cache(format!(
                    "cannot cache {fingerprint}: missing artifact {name}"
                )));
            }
        }

        if is_complete(&final_dir) {
            return Ok(PopulateOutcome::AlreadyPresent);
        }

        fs::create_dir_all(&self.root)?;

        // Dropping the TempDir removes whatever was not renamed away
        let staging = tempfile::Builder::new()
            .prefix(&format!(".tmp-{fingerprint}-"))
            .tempdir_in(&self.root)?;

        for name in SETUP_ARTIFACTS {
            fs::copy(source_dir.join(name), staging.path().join(name))?;
        }

        if final_dir.exists() {
            if is_complete(&final_dir) {
                self.stats.races_lost.fetch_add(1, Ordering::Relaxed);
                return Ok(PopulateOutcome::AlreadyPresent);
            }
            self.discard_incomplete(fingerprint, &final_dir)?;
        }

        match fs::rename(staging.path(), &final_dir) {
            Ok(()) => {
                self.stats.populations.fetch_add(1, Ordering::Relaxed);
                info!(fingerprint, "artifact cache populated");
                Ok(PopulateOutcome::Created)
            }
            Err(_) if is_complete(&final_dir) => {
                self.stats.races_lost.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint, "concurrent writer populated cache entry first");
                Ok(PopulateOutcome::AlreadyPresent)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn discard_incomplete(&self, fingerprint: &str, dir: &Path) -> Result<()> {
        warn!(fingerprint, "replacing incomplete artifact cache entry");
        let aside = tempfile::Builder::new()
            .prefix(&format!(".stale-{fingerprint}-"))
            .tempdir_in(&self.root)?;
        let target = aside.path().join("entry");
        match fs::rename(dir, &target) {
            Ok(()) => Ok(()),
            // Another writer moved or replaced it already
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy a cached set into a job directory
    pub fn restore(&self, set: &ArtifactSet, dest_dir: &Path) -> Result<()> {
        fs::create_dir_all(dest_dir)?;
        for name in SETUP_ARTIFACTS {
            fs::copy(set.file(name), dest_dir.join(name))?;
        }
        debug!(
            fingerprint = %set.fingerprint,
            dest = %dest_dir.display(),
            "restored cached artifacts"
        );
        Ok(())
    }

    /// Remove an entry. Returns whether anything was removed.
    pub fn evict(&self, fingerprint: &str) -> Result<bool> {
        let dir = self.entry_dir(fingerprint)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(fingerprint, "artifact cache entry evicted");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List entries on disk, skipping staging directories
    pub fn entries(&self) -> Result<Vec<CacheEntryInfo>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            if !is_hex_digest(&name) || !item.file_type()?.is_dir() {
                continue;
            }
            let dir = item.path();
            entries.push(CacheEntryInfo {
                complete: is_complete(&dir),
                size_bytes: dir_size(&dir)?,
                fingerprint: name,
            });
        }
        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(entries)
    }
}

fn is_complete(dir: &Path) -> bool {
    SETUP_ARTIFACTS.iter().all(|name| dir.join(name).is_file())
}

fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for item in fs::read_dir(dir)? {
        let meta = item?.metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}
