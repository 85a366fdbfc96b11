//! # Checkpoint — Durable Search Progress
//!
//! Persists the single [`Progress`] record as a flat JSON object with a
//! SHA-256 integrity checksum and rotating backup generations.
//!
//! ## File Format
//!
//! ```json
//! {"count":1000,"elapsed_time":4.2,"timestamp":1760000000.5,
//!  "largest":7919,"cursor":7920,"checksum":"…"}
//! ```
//!
//! `count`, `elapsed_time` and `timestamp` are required. `largest`, `cursor`
//! and `checksum` are optional so that hand-written or older files still
//! load: a missing `cursor` is rebuilt as `largest + 1`, a missing checksum
//! skips the integrity check.
//!
//! ## Atomic Writes
//!
//! The record is written to `<path>.tmp`, fsynced, then renamed over
//! `<path>`. A reader sees either the previous record or the new one, never a
//! mix.
//!
//! ## Generations
//!
//! Before each save the current file rotates to `.1` and `.1` to `.2`. A
//! corrupt or invalid current file falls back to the newest valid generation.
//! Invalid checkpoints are never an error: `load` reports "nothing usable"
//! and the search starts over.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::SearchError;
use crate::partition::FIRST_CANDIDATE;

/// Number of backup generations to keep (current included).
const GENERATIONS: usize = 3;

/// Cumulative search progress; the only state that survives a restart.
///
/// Everything strictly below `cursor` has been classified and merged, and
/// `discovered_count` primes were found there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub cursor: u64,
    pub discovered_count: u64,
    pub largest_discovered: u64,
    pub elapsed_seconds: f64,
    pub saved_at: f64,
}

impl Progress {
    /// Progress of a search that has not started.
    pub fn fresh() -> Self {
        Progress {
            cursor: FIRST_CANDIDATE,
            discovered_count: 0,
            largest_discovered: 0,
            elapsed_seconds: 0.0,
            saved_at: 0.0,
        }
    }

    /// True when `self` does not move any monotonic field backwards
    /// relative to `earlier`.
    pub fn is_successor_of(&self, earlier: &Progress) -> bool {
        self.cursor >= earlier.cursor
            && self.discovered_count >= earlier.discovered_count
            && self.elapsed_seconds >= earlier.elapsed_seconds
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::fresh()
    }
}

/// On-disk shape of a checkpoint.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    count: u64,
    elapsed_time: f64,
    timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    largest: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl CheckpointRecord {
    fn from_progress(progress: &Progress) -> Result<Self, serde_json::Error> {
        let mut record = CheckpointRecord {
            count: progress.discovered_count,
            elapsed_time: progress.elapsed_seconds,
            timestamp: progress.saved_at,
            largest: Some(progress.largest_discovered),
            cursor: Some(progress.cursor),
            checksum: None,
        };
        record.checksum = Some(record.digest()?);
        Ok(record)
    }

    /// SHA-256 over the record serialized without its checksum.
    fn digest(&self) -> Result<String, serde_json::Error> {
        let unsigned = CheckpointRecord {
            count: self.count,
            elapsed_time: self.elapsed_time,
            timestamp: self.timestamp,
            largest: self.largest,
            cursor: self.cursor,
            checksum: None,
        };
        Ok(sha256_hex(&serde_json::to_string(&unsigned)?))
    }

    /// Structural validation; returns a reason on failure.
    fn into_progress(self) -> Result<Progress, String> {
        if let Some(expected) = &self.checksum {
            let actual = self.digest().map_err(|e| e.to_string())?;
            if &actual != expected {
                return Err(format!(
                    "checksum mismatch (expected {}, got {})",
                    &expected[..12.min(expected.len())],
                    &actual[..12]
                ));
            }
        }
        if !self.elapsed_time.is_finite() || self.elapsed_time < 0.0 {
            return Err(format!("invalid elapsed_time {}", self.elapsed_time));
        }
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(format!("invalid timestamp {}", self.timestamp));
        }

        let largest = self.largest.unwrap_or(0);
        if largest == u64::MAX {
            return Err("largest is out of range".to_string());
        }
        let cursor = match (self.cursor, self.largest) {
            (Some(cursor), _) => cursor.max(FIRST_CANDIDATE),
            (None, Some(l)) if l > 0 => l + 1,
            (None, _) if self.count == 0 => FIRST_CANDIDATE,
            (None, _) => return Err("cursor cannot be reconstructed".to_string()),
        };
        if largest > 0 && (cursor <= largest || self.count == 0) {
            return Err(format!(
                "largest {} inconsistent with cursor {} and count {}",
                largest, cursor, self.count
            ));
        }
        if largest == 0 && self.count > 0 {
            return Err(format!("count {} without a largest prime", self.count));
        }
        if self.count > cursor {
            return Err(format!("count {} exceeds cursor {}", self.count, cursor));
        }

        Ok(Progress {
            cursor,
            discovered_count: self.count,
            largest_discovered: largest,
            elapsed_seconds: self.elapsed_time,
            saved_at: self.timestamp,
        })
    }
}

/// Compute SHA-256 hex digest of a string.
fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Return the path for generation `gen` (0 = current, 1 = .1, 2 = .2, ...).
fn generation_path(base: &Path, gen: usize) -> PathBuf {
    if gen == 0 {
        base.to_path_buf()
    } else {
        suffixed(base, &format!(".{}", gen))
    }
}

/// Append `suffix` to the full file name (`cp.json` → `cp.json.tmp`).
pub(crate) fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut p = base.as_os_str().to_os_string();
    p.push(suffix);
    PathBuf::from(p)
}

/// Current time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Render a checkpoint timestamp as RFC 3339 for log lines.
pub fn format_timestamp(ts: f64) -> String {
    DateTime::from_timestamp_millis((ts * 1000.0) as i64)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| format!("{}", ts))
}

/// Single-writer store for one checkpoint location.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    last_saved: Option<Progress>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore {
            path: path.into(),
            last_saved: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        suffixed(&self.path, ".tmp")
    }

    /// Durably replace the checkpoint with `progress`.
    ///
    /// Rejects a record that would move `cursor`, `count` or `elapsed_time`
    /// backwards relative to the last record this store saved or loaded.
    pub fn save(&mut self, progress: &Progress) -> Result<(), SearchError> {
        if let Some(prev) = &self.last_saved {
            if !progress.is_successor_of(prev) {
                return Err(SearchError::checkpoint(format!(
                    "refusing to save regressed progress (cursor {} -> {}, count {} -> {})",
                    prev.cursor, progress.cursor, prev.discovered_count, progress.discovered_count
                )));
            }
        }

        let record = CheckpointRecord::from_progress(progress)
            .map_err(|e| SearchError::checkpoint(format!("serialize: {}", e)))?;
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| SearchError::checkpoint(format!("serialize: {}", e)))?;

        // Rotate existing generations: .2 is discarded, .1 → .2, current → .1
        for gen in (1..GENERATIONS).rev() {
            let src = generation_path(&self.path, gen - 1);
            let dst = generation_path(&self.path, gen);
            if src.exists() {
                let _ = fs::rename(&src, &dst);
            }
        }

        let tmp = self.tmp_path();
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            SearchError::checkpoint(format!("write {}: {}", self.path.display(), e))
        })?;

        self.last_saved = Some(*progress);
        Ok(())
    }

    /// Load the newest valid checkpoint, falling back to older generations.
    pub fn load(&mut self) -> Option<Progress> {
        for gen in 0..GENERATIONS {
            let p = generation_path(&self.path, gen);
            if let Some(progress) = load_single(&p) {
                if gen > 0 {
                    warn!(
                        generation = gen,
                        path = %p.display(),
                        "recovered checkpoint from backup generation"
                    );
                }
                self.last_saved = Some(progress);
                return Some(progress);
            }
        }
        None
    }

    /// Remove all generations and any leftover temp file.
    pub fn clear(&mut self) {
        for gen in 0..GENERATIONS {
            let _ = fs::remove_file(generation_path(&self.path, gen));
        }
        let _ = fs::remove_file(self.tmp_path());
        self.last_saved = None;
    }
}

/// Try to load and validate a single checkpoint file.
fn load_single(path: &Path) -> Option<Progress> {
    let raw = fs::read_to_string(path).ok()?;
    let record: CheckpointRecord = match serde_json::from_str(&raw) {
        Ok(r) => r,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable checkpoint ignored");
            return None;
        }
    };
    match record.into_progress() {
        Ok(progress) => {
            info!(
                path = %path.display(),
                cursor = progress.cursor,
                count = progress.discovered_count,
                "checkpoint loaded"
            );
            Some(progress)
        }
        Err(reason) => {
            warn!(path = %path.display(), reason = %reason, "invalid checkpoint ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    //! Checkpoint persistence: atomic saves, generations, validation and
    //! the monotonic guard.

    use super::*;

    fn progress(cursor: u64, count: u64, largest: u64, elapsed: f64) -> Progress {
        Progress {
            cursor,
            discovered_count: count,
            largest_discovered: largest,
            elapsed_seconds: elapsed,
            saved_at: 1_760_000_000.25,
        }
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        assert_eq!(format_timestamp(0.0), "1970-01-01T00:00:00Z");
        assert_eq!(format_timestamp(1_760_000_000.25), "2025-10-09T08:53:20Z");
    }

    fn store_in(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("checkpoint.json"))
    }

    // ── Save and Load ────────────────────────────────────────────

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let p = progress(7920, 1000, 7919, 4.5);
        store.save(&p).unwrap();

        let mut reader = store_in(&dir);
        assert_eq!(reader.load(), Some(p));
    }

    /// A first run has nothing to resume.
    #[test]
    fn missing_file_is_no_progress() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store_in(&dir).load(), None);
    }

    /// `count`, `elapsed_time` and `timestamp` are the keys operators read.
    #[test]
    fn file_uses_operator_facing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save(&progress(30, 10, 29, 1.0)).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["count"], 10);
        assert_eq!(value["largest"], 29);
        assert_eq!(value["cursor"], 30);
        assert_eq!(value["elapsed_time"], 1.0);
        assert!(value["timestamp"].is_f64());
        assert!(value["checksum"].is_string());
    }

    #[test]
    fn no_temp_file_left_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save(&progress(30, 10, 29, 1.0)).unwrap();
        assert!(!store.tmp_path().exists());
    }

    // ── Generations and Corruption ───────────────────────────────

    /// Each save shifts the previous files to `.1` and `.2`.
    #[test]
    fn rotation_keeps_generations() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save(&progress(12, 5, 11, 1.0)).unwrap();
        store.save(&progress(30, 10, 29, 2.0)).unwrap();
        store.save(&progress(72, 20, 71, 3.0)).unwrap();

        assert_eq!(load_single(store.path()).unwrap().discovered_count, 20);
        assert_eq!(
            load_single(&generation_path(store.path(), 1))
                .unwrap()
                .discovered_count,
            10
        );
        assert_eq!(
            load_single(&generation_path(store.path(), 2))
                .unwrap()
                .discovered_count,
            5
        );
    }

    /// A corrupt primary falls back to the newest readable generation.
    #[test]
    fn fallback_on_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save(&progress(30, 10, 29, 2.0)).unwrap();
        store.save(&progress(72, 20, 71, 3.0)).unwrap();

        fs::write(store.path(), b"{\"count\": 20, \"elapsed_ti").unwrap();

        let loaded = store_in(&dir).load().unwrap();
        assert_eq!(loaded.discovered_count, 10);
        assert_eq!(loaded.cursor, 30);
    }

    #[test]
    fn truncated_and_garbage_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let junk_files: [&[u8]; 5] = [
            b"",
            b"corrupted data!!!",
            b"{\"count\": 5",
            b"[]",
            b"{\"count\": -3, \"elapsed_time\": 1.0, \"timestamp\": 1.0}",
        ];
        for junk in junk_files {
            fs::write(store.path(), junk).unwrap();
            assert_eq!(store.load(), None, "accepted {:?}", String::from_utf8_lossy(junk));
        }
    }

    /// Hand-edited fields no longer match the stored SHA-256.
    #[test]
    fn checksum_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save(&progress(7920, 1000, 7919, 4.5)).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), raw.replace("1000", "1001")).unwrap();

        assert!(load_single(store.path()).is_none());
    }

    // ── Validation ───────────────────────────────────────────────

    /// Minimal records from older writers still resume.
    #[test]
    fn record_without_checksum_or_cursor_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(
            &path,
            r#"{"count": 10, "elapsed_time": 3.5, "timestamp": 1760000000.0, "largest": 29}"#,
        )
        .unwrap();

        let loaded = CheckpointStore::new(&path).load().unwrap();
        assert_eq!(loaded.cursor, 30);
        assert_eq!(loaded.discovered_count, 10);
        assert_eq!(loaded.largest_discovered, 29);
        assert_eq!(loaded.elapsed_seconds, 3.5);
    }

    #[test]
    fn count_only_record_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(
            &path,
            r#"{"count": 1000, "elapsed_time": 12.0, "timestamp": 1760000000.0}"#,
        )
        .unwrap();
        assert_eq!(CheckpointStore::new(&path).load(), None);
    }

    /// A cursor at or below `largest` or a negative elapsed time is refused.
    #[test]
    fn inconsistent_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let cases = [
            // cursor not past largest
            r#"{"count": 10, "elapsed_time": 1.0, "timestamp": 1.0, "largest": 29, "cursor": 29}"#,
            // primes claimed but no largest
            r#"{"count": 10, "elapsed_time": 1.0, "timestamp": 1.0, "cursor": 30}"#,
            // more primes than candidates
            r#"{"count": 100, "elapsed_time": 1.0, "timestamp": 1.0, "largest": 29, "cursor": 30}"#,
            // negative elapsed time
            r#"{"count": 10, "elapsed_time": -1.0, "timestamp": 1.0, "largest": 29, "cursor": 30}"#,
            // missing required field
            r#"{"count": 10, "timestamp": 1.0, "largest": 29, "cursor": 30}"#,
        ];
        for case in cases {
            fs::write(&path, case).unwrap();
            assert_eq!(CheckpointStore::new(&path).load(), None, "accepted {}", case);
        }
    }

    // ── Monotonic Guard ──────────────────────────────────────────

    /// Saving fewer primes than the last save is a checkpoint error.
    #[test]
    fn regressed_progress_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.save(&progress(72, 20, 71, 3.0)).unwrap();

        let err = store.save(&progress(30, 10, 29, 4.0)).unwrap_err();
        assert!(matches!(err, SearchError::Checkpoint(_)));
        let err = store.save(&progress(72, 20, 71, 2.0)).unwrap_err();
        assert!(matches!(err, SearchError::Checkpoint(_)));

        assert_eq!(store_in(&dir).load().unwrap().discovered_count, 20);
    }

    #[test]
    fn load_sets_monotonic_baseline() {
        let dir = tempfile::tempdir().unwrap();
        store_in(&dir).save(&progress(72, 20, 71, 3.0)).unwrap();

        let mut store = store_in(&dir);
        store.load().unwrap();
        assert!(store.save(&progress(30, 10, 29, 9.0)).is_err());
        assert!(store.save(&progress(80, 22, 79, 9.0)).is_ok());
    }

    /// Clearing deletes every generation, so a new search may start at zero.
    #[test]
    fn clear_removes_all_and_resets_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        for i in 1..=4u64 {
            store.save(&progress(30 * i, 10 * i, 29, i as f64)).ok();
        }
        store.clear();

        assert!(!store.path().exists());
        assert!(!generation_path(store.path(), 1).exists());
        assert!(!generation_path(store.path(), 2).exists());
        assert!(store.save(&progress(3, 1, 2, 0.0)).is_ok());
    }

    // ── Failures ─────────────────────────────────────────────────

    #[test]
    fn unwritable_location_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(dir.path().join("missing").join("cp.json"));
        let err = store.save(&Progress::fresh()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
