//! # Results — Prime Log and Result Output
//!
//! The checkpoint only records counters, so the merged prime sequence itself
//! is kept in an append-only log next to it (`<checkpoint>.primes`, one
//! decimal prime per line). The coordinator syncs the log *before* every
//! checkpoint save, which gives the invariant:
//!
//! > the first `count` lines of the log are exactly the primes below the
//! > checkpoint's `cursor`.
//!
//! Lines past `count` were merged after the last checkpoint and may be torn by
//! a crash; [`PrimeLog::restore`] drops them. A log that holds fewer than
//! `count` valid ascending primes cannot back the checkpoint and the search
//! restarts from scratch.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::checkpoint::suffixed;

pub struct PrimeLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl PrimeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PrimeLog {
            path: path.into(),
            writer: None,
        }
    }

    /// The log that accompanies a checkpoint file.
    pub fn for_checkpoint(checkpoint: &Path) -> Self {
        Self::new(suffixed(checkpoint, ".primes"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back the first `count` primes and truncate everything after them.
    ///
    /// Returns `Ok(None)` without touching the file when the log cannot
    /// supply `count` strictly ascending primes.
    pub fn restore(&mut self, count: u64) -> io::Result<Option<Vec<u64>>> {
        self.writer = None;
        let mut primes = Vec::with_capacity(count.min(1 << 20) as usize);
        let mut valid_len = 0u64;

        if count > 0 {
            let file = match File::open(&self.path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            let mut reader = BufReader::new(file);
            let mut line = String::new();
            while (primes.len() as u64) < count {
                line.clear();
                let read = match reader.read_line(&mut line) {
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::InvalidData => return Ok(None),
                    Err(e) => return Err(e),
                };
                if read == 0 || !line.ends_with('\n') {
                    return Ok(None);
                }
                let Ok(p) = line.trim_end().parse::<u64>() else {
                    return Ok(None);
                };
                if primes.last().is_some_and(|&last| p <= last) {
                    return Ok(None);
                }
                primes.push(p);
                valid_len += read as u64;
            }
        }

        self.open_at(valid_len)?;
        Ok(Some(primes))
    }

    /// Start an empty log, discarding any previous content.
    pub fn reset(&mut self) -> io::Result<()> {
        self.writer = None;
        self.open_at(0)
    }

    fn open_at(&mut self, len: u64) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        file.set_len(len)?;
        file.seek(SeekFrom::End(0))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Buffer `primes` for appending; durable only after [`PrimeLog::sync`].
    pub fn append(&mut self, primes: &[u64]) -> io::Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(w) = self.writer.as_mut() {
            for p in primes {
                writeln!(w, "{}", p)?;
            }
        }
        Ok(())
    }

    /// Flush buffered lines and fsync the file.
    pub fn sync(&mut self) -> io::Result<()> {
        if let Some(w) = self.writer.as_mut() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Replace the whole log with `primes`, e.g. after a failed append left
    /// it behind the in-memory set.
    pub fn rewrite(&mut self, primes: &[u64]) -> io::Result<()> {
        self.writer = None;
        write_result_set(&self.path, primes)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.writer = None;
        let _ = fs::remove_file(&self.path);
    }
}

/// Atomically write a full result set, one prime per line.
pub fn write_result_set(path: &Path, primes: &[u64]) -> io::Result<()> {
    let tmp = suffixed(path, ".tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        for p in primes {
            writeln!(w, "{}", p)?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)
}
