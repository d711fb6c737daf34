//! Append-only backup log of accepted observations.
//!
//! One JSON document per line. Each append is followed by `sync_data`, and an
//! entry only counts as written once that returns, so a crash can leave at
//! most one unterminated final line. Opening the log terminates such a line
//! with a newline instead of truncating it; readers skip it as malformed.
//! Nothing in the file is ever rewritten.

pub mod reconcile;

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    db::models::{NaturalKey, NewObservation, Observation},
    log_warn,
};

pub use reconcile::{reconcile, ReconcileReport};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "audit::backup";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObservationEntry {
    pub logged_at: DateTime<Utc>,
    /// Table id assigned when the record was accepted.
    pub id: i64,
    pub key: NaturalKey,
    pub fingerprint: String,
    pub record: NewObservation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlagEntry {
    pub logged_at: DateTime<Utc>,
    pub id: i64,
    pub key: NaturalKey,
    pub fingerprint: String,
    pub flagged: bool,
    pub reason: String,
}

/// Which kind of earlier entry a void cancels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VoidedKind {
    Observation,
    Flag,
}

/// Written when the table transaction behind an already appended entry
/// failed to commit. Cancels the latest earlier entry of `voids` kind with
/// the same id and fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoidEntry {
    pub logged_at: DateTime<Utc>,
    pub voids: VoidedKind,
    pub id: i64,
    pub fingerprint: String,
}

impl VoidEntry {
    pub fn cancels(&self, entry: &LogEntry) -> bool {
        match (self.voids, entry) {
            (VoidedKind::Observation, LogEntry::Observation(logged)) => {
                logged.id == self.id && logged.fingerprint == self.fingerprint
            }
            (VoidedKind::Flag, LogEntry::Flag(flag)) => {
                flag.id == self.id && flag.fingerprint == self.fingerprint
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LogEntry {
    Observation(ObservationEntry),
    Flag(FlagEntry),
    Void(VoidEntry),
}

impl LogEntry {
    pub fn observation(id: i64, record: &NewObservation, fingerprint: &str) -> Self {
        LogEntry::Observation(ObservationEntry {
            logged_at: Utc::now(),
            id,
            key: record.natural_key(),
            fingerprint: fingerprint.to_string(),
            record: record.clone(),
        })
    }

    pub fn flag(observation: &Observation, fingerprint: &str, reason: &str) -> Self {
        LogEntry::Flag(FlagEntry {
            logged_at: Utc::now(),
            id: observation.id,
            key: observation.record.natural_key(),
            fingerprint: fingerprint.to_string(),
            flagged: observation.flagged_observation,
            reason: reason.to_string(),
        })
    }

    pub fn void(voids: VoidedKind, id: i64, fingerprint: &str) -> Self {
        LogEntry::Void(VoidEntry {
            logged_at: Utc::now(),
            voids,
            id,
            fingerprint: fingerprint.to_string(),
        })
    }
}

/// Result of reading the whole log.
#[derive(Debug, Default)]
pub struct LogScan {
    pub entries: Vec<LogEntry>,
    /// Lines that did not parse, including a torn final line.
    pub malformed: usize,
}

pub struct BackupLog {
    path: PathBuf,
    writer: Mutex<File>,
}

impl BackupLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create backup log directory {}", parent.display())
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open backup log {}", path.display()))?;

        if ends_mid_line(&mut file)? {
            log_warn!(
                "Backup log {} ends with a partial entry; terminating it",
                path.display()
            );
            file.write_all(b"\n")
                .and_then(|_| file.sync_data())
                .context("failed to terminate partial backup log entry")?;
        }

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry and waits until it is on disk.
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("failed to serialize backup entry")?;
        line.push(b'\n');

        let mut file = self
            .writer
            .lock()
            .map_err(|_| anyhow!("backup log writer lock poisoned"))?;
        file.write_all(&line)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed to sync {}", self.path.display()))?;
        Ok(())
    }

    /// Reads every entry from the start of the log.
    pub fn read_entries(&self) -> Result<LogScan> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open backup log {}", self.path.display()))?;
        let mut reader = BufReader::new(file);
        let mut scan = LogScan::default();
        let mut line = Vec::new();
        let mut line_number = 0usize;

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            if read == 0 {
                break;
            }
            line_number += 1;

            let content = trim_line(&line);
            if content.is_empty() {
                continue;
            }
            match serde_json::from_slice::<LogEntry>(content) {
                Ok(entry) => scan.entries.push(entry),
                Err(err) => {
                    scan.malformed += 1;
                    log_warn!(
                        "Skipping malformed backup entry at {}:{}: {err}",
                        self.path.display(),
                        line_number
                    );
                }
            }
        }

        Ok(scan)
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn ends_mid_line(file: &mut File) -> Result<bool> {
    let len = file.metadata().context("failed to stat backup log")?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
