//! Filesystem-backed run ledger.
//!
//! Layout: `<root>/runs/<run_id>/record.json` plus `<root>/runs/<run_id>/events.jsonl`
//! (one JSON event per line, append-only).

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::fakes::{ensure_running, ensure_seq_advances};
use crate::storage_traits::*;

const RECORD_FILE: &str = "record.json";
const EVENTS_FILE: &str = "events.jsonl";

/// Run ledger persisted as one directory per run.
pub struct FsRunLedger {
    runs_dir: PathBuf,
    // Serialises read-modify-write cycles on record files.
    write_lock: Mutex<()>,
}

impl FsRunLedger {
    /// Create a ledger rooted at `root`. Creates `root/runs/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let runs_dir = root.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            runs_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(&run_id.0)
    }

    fn read_record(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let path = self.run_dir(run_id).join(RECORD_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::RunNotFound {
                    run_id: run_id.0.clone(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_record(&self, record: &RunRecord) -> StorageResult<()> {
        let dir = self.run_dir(&record.run_id);
        fs::create_dir_all(&dir)?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(record)?)?;
        tmp.persist(dir.join(RECORD_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let path = self.run_dir(run_id).join(EVENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<RunEvent>(&line)?);
        }
        Ok(events)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn finish(&self, run_id: &RunId, summary: RunSummary, status: RunStatus) -> StorageResult<()> {
        let _guard = self.lock()?;
        let mut record = self.read_record(run_id)?;
        ensure_running(run_id, &record)?;
        record.status = status;
        record.summary = Some(summary);
        record.completed_at = Some(Utc::now());
        self.write_record(&record)
    }
}

#[async_trait]
impl RunLedger for FsRunLedger {
    async fn create_run(
        &self,
        plan_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            plan_digest: plan_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let _guard = self.lock()?;
        self.write_record(&record)?;
        debug!(run_id = %run_id, dir = ?self.run_dir(&run_id), "created run");
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let _guard = self.lock()?;
        let record = self.read_record(run_id)?;
        ensure_running(run_id, &record)?;
        let events = self.read_events(run_id)?;
        ensure_seq_advances(run_id, events.last(), &event)?;

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir(run_id).join(EVENTS_FILE))?;
        file.write_all(&line)?;
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, summary, RunStatus::Completed)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, summary, RunStatus::Failed)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.read_record(run_id)
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        // Surface RunNotFound rather than an empty list for unknown runs.
        self.read_record(run_id)?;
        let mut events = self.read_events(run_id)?;
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(
        &self,
        plan_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let run_id = RunId(entry.file_name().to_string_lossy().into_owned());
            let record = match self.read_record(&run_id) {
                Ok(r) => r,
                // Directory without a record (interrupted create); not a run.
                Err(StorageError::RunNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if plan_digest.map(|d| record.plan_digest == *d).unwrap_or(true) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
