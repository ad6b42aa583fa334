//! Append-only, hash-chained audit log file.
//!
//! One JSON object per line. Each record carries the SHA-256 of the previous
//! line, so an edited or truncated log is detectable:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp of the event |
//! | `level` | `debug`, `info`, `warning` or `error` |
//! | `kind` | What happened: `process_killed`, `combo_blocked`, ... |
//! | `message` | Human-readable description |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line |
//!
//! The first record uses 64 zeros as `prev_entry_sha256`. If the last line of an
//! existing log is not valid JSON, a `chain_recovery` record is written first and
//! the chain continues from it.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{AuditEvent, AuditKind, AuditLevel, AuditSink};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: String,
    pub level: AuditLevel,
    pub kind: AuditKind,
    pub message: String,
    pub prev_entry_sha256: String,
}

/// Sink that appends records from a dedicated writer thread.
pub struct JsonlAuditSink {
    path: PathBuf,
    tx: Mutex<Option<Sender<AuditEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JsonlAuditSink {
    /// Open (or create) the log and start the writer thread.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        let prev_hash = chain_head(&path, &mut file)?;

        let (tx, rx) = mpsc::channel::<AuditEvent>();
        let worker = std::thread::Builder::new()
            .name("audit-writer".into())
            .spawn(move || {
                let mut prev_hash = prev_hash;
                for event in rx {
                    match append_record(&mut file, &event, &prev_hash) {
                        Ok(hash) => prev_hash = hash,
                        Err(e) => warn!("Failed to write audit record: {:#}", e),
                    }
                }
            })
            .context("Failed to spawn audit writer thread")?;

        Ok(Self {
            path,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting events and wait until everything queued is on disk.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            warn!("Audit writer thread panicked");
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(tx) = self.tx.lock()
            && let Some(tx) = tx.as_ref()
        {
            let _ = tx.send(event.clone());
        }
    }
}

impl Drop for JsonlAuditSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hash of the last line, writing a recovery record if that line is corrupted.
fn chain_head(path: &Path, file: &mut File) -> Result<String> {
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    match content.lines().rfind(|l| !l.is_empty()) {
        Some(last_line) => {
            if serde_json::from_str::<AuditRecord>(last_line).is_ok() {
                Ok(sha256_hex(last_line.as_bytes()))
            } else {
                let recovery = AuditEvent::new(
                    AuditLevel::Warning,
                    AuditKind::ChainRecovery,
                    format!(
                        "Previous entry corrupted ({} bytes), new chain segment",
                        last_line.len()
                    ),
                );
                append_record(file, &recovery, &sha256_hex(last_line.as_bytes()))
            }
        }
        None => Ok(GENESIS_HASH.to_string()),
    }
}

/// Write one record and return the hash of the written line.
fn append_record(file: &mut File, event: &AuditEvent, prev_hash: &str) -> Result<String> {
    let record = AuditRecord {
        ts: event.timestamp.to_rfc3339(),
        level: event.level,
        kind: event.kind,
        message: event.message.clone(),
        prev_entry_sha256: prev_hash.to_string(),
    };
    let json = serde_json::to_string(&record).context("Failed to serialize audit record")?;
    writeln!(file, "{}", json).context("Failed to write audit record")?;
    file.flush().context("Failed to flush audit log")?;
    Ok(sha256_hex(json.as_bytes()))
}

/// Parse every record; corrupted lines are skipped.
pub fn read_audit_log(path: &Path) -> Result<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Line indices where the chain is broken. Empty means intact.
pub fn verify_audit_chain(path: &Path) -> Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(record) = serde_json::from_str::<AuditRecord>(line) else {
            broken.push(i);
            continue;
        };
        let expected = if i == 0 {
            GENESIS_HASH.to_string()
        } else {
            sha256_hex(lines[i - 1].as_bytes())
        };
        if record.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }
    Ok(broken)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
