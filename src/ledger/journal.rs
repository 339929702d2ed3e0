//! Durable change log for the ledger.
//!
//! `ledger.log` holds one JSON [`JournalEntry`] per line and is only ever
//! appended to. `ledger.json` is a checkpoint of the full ledger state taken
//! every few entries, after which the log is truncated. Loading reads the
//! checkpoint and replays log entries whose sequence number is newer.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::Task;
use crate::ledger::event::JournalEntry;
use crate::util::write_atomic;
use crate::{clog_debug, clog_warn, Result};

pub const LOG_FILE: &str = "ledger.log";
pub const CHECKPOINT_FILE: &str = "ledger.json";

/// Full ledger state at a journal sequence number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Sequence number of the last entry folded into this checkpoint.
    pub seq: u64,
    /// Next task insertion number.
    pub next_task_seq: u64,
    /// Tasks in insertion order.
    pub tasks: Vec<Task>,
    /// Consecutive failures per worker role.
    #[serde(default)]
    pub role_failures: BTreeMap<String, u32>,
}

#[derive(Default)]
struct LogScan {
    entries: Vec<JournalEntry>,
    /// Byte length of the log up to the end of the last good line.
    valid_len: u64,
    /// A line failed to parse.
    torn: bool,
    /// The last good line has no trailing newline.
    unterminated: bool,
}

/// Append-only journal plus checkpoint in one state directory.
#[derive(Debug)]
pub struct Journal {
    log_path: PathBuf,
    checkpoint_path: PathBuf,
}

impl Journal {
    pub fn new(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            log_path: state_dir.join(LOG_FILE),
            checkpoint_path: state_dir.join(CHECKPOINT_FILE),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Append one entry and flush it to disk.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Load the checkpoint, or an empty state when none was written yet.
    pub fn load_checkpoint(&self) -> Result<Checkpoint> {
        if !self.checkpoint_path.exists() {
            return Ok(Checkpoint::default());
        }
        let content = fs::read_to_string(&self.checkpoint_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Entries with a sequence number greater than `after`, in log order.
    ///
    /// A line that fails to parse is treated as a torn write: it and
    /// everything after it are ignored.
    pub fn entries_after(&self, after: u64) -> Result<Vec<JournalEntry>> {
        let scan = self.scan(after)?;
        clog_debug!(
            "Journal replay: {} entries after seq {}",
            scan.entries.len(),
            after
        );
        Ok(scan.entries)
    }

    /// Cut a torn write off the end of the log so later appends start on a
    /// fresh line. Returns true when the file was changed.
    pub fn repair_tail(&self) -> Result<bool> {
        let scan = self.scan(0)?;
        if scan.torn {
            let file = OpenOptions::new().write(true).open(&self.log_path)?;
            file.set_len(scan.valid_len)?;
            file.sync_data()?;
            clog_warn!(
                "Truncated torn tail of {} at byte {}",
                self.log_path.display(),
                scan.valid_len
            );
        }
        if scan.unterminated {
            let mut file = OpenOptions::new().append(true).open(&self.log_path)?;
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        Ok(scan.torn || scan.unterminated)
    }

    fn scan(&self, after: u64) -> Result<LogScan> {
        let mut scan = LogScan::default();
        if !self.log_path.exists() {
            return Ok(scan);
        }
        let mut reader = BufReader::new(File::open(&self.log_path)?);
        let mut buf = Vec::new();
        let mut lineno = 0;
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            lineno += 1;
            let terminated = buf.last() == Some(&b'\n');
            let parsed = std::str::from_utf8(&buf)
                .map_err(|e| e.to_string())
                .and_then(|line| {
                    if line.trim().is_empty() {
                        Ok(None)
                    } else {
                        serde_json::from_str::<JournalEntry>(line)
                            .map(Some)
                            .map_err(|e| e.to_string())
                    }
                });
            match parsed {
                Ok(entry) => {
                    scan.valid_len += read as u64;
                    scan.unterminated = !terminated;
                    if let Some(entry) = entry.filter(|e| e.seq > after) {
                        scan.entries.push(entry);
                    }
                }
                Err(e) => {
                    clog_warn!(
                        "Ignoring torn journal line {} in {}: {}",
                        lineno,
                        self.log_path.display(),
                        e
                    );
                    scan.torn = true;
                    scan.unterminated = false;
                    break;
                }
            }
        }
        Ok(scan)
    }

    /// Persist a checkpoint, then truncate the log it supersedes.
    pub fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_atomic(
            &self.checkpoint_path,
            &serde_json::to_string_pretty(checkpoint)?,
        )?;
        File::create(&self.log_path)?;
        clog_debug!("Ledger checkpoint written at seq {}", checkpoint.seq);
        Ok(())
    }
}
