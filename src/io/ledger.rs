//! Persisted job ledger.
//!
//! The ledger records the status of every stage and chunk together with
//! attempt counts, timestamps and artifact references. It is the only
//! mutable state shared between workers and is the sole source of truth when
//! a job resumes. Updates to a key are last-writer-wins; every update rewrites
//! the ledger file atomically (write to a temporary file, then rename).

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const LEDGER_VERSION: u32 = 1;

/// Status of a stage or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Failed once, queued to run again
    Retried,
    /// Stage not configured for the run that recorded it
    Skipped,
    /// Stage finished with gaps; later stages may use its output but a
    /// resumed run enters it again for the missing pieces
    Partial,
}

impl EntryStatus {
    /// Whether the work recorded by this entry can be trusted on resume.
    pub fn is_succeeded(self) -> bool {
        matches!(self, EntryStatus::Succeeded)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Running => "running",
            EntryStatus::Succeeded => "succeeded",
            EntryStatus::Failed => "failed",
            EntryStatus::Retried => "retried",
            EntryStatus::Skipped => "skipped",
            EntryStatus::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// One ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub status: EntryStatus,

    /// Number of attempts started
    pub attempts: u32,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,

    /// Artifact produced by the last successful attempt
    #[serde(default)]
    pub artifact: Option<String>,

    /// Last error message
    #[serde(default)]
    pub message: Option<String>,
}

impl LedgerEntry {
    fn pending() -> Self {
        Self {
            status: EntryStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
            artifact: None,
            message: None,
        }
    }
}

/// Serialized form of the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,

    /// Fingerprint of the chunk plan the chunk entries belong to
    #[serde(default)]
    pub plan_fingerprint: Option<String>,

    #[serde(default)]
    pub stages: BTreeMap<String, LedgerEntry>,

    #[serde(default)]
    pub chunks: BTreeMap<usize, LedgerEntry>,

    /// External signals and when they were recorded
    #[serde(default)]
    pub signals: BTreeMap<String, DateTime<Utc>>,
}

/// Durable record of stage and chunk progress.
pub struct JobLedger {
    path: Option<PathBuf>,
    stages: DashMap<String, LedgerEntry>,
    chunks: DashMap<usize, LedgerEntry>,
    signals: DashMap<String, DateTime<Utc>>,
    plan_fingerprint: Mutex<Option<String>>,
    write_lock: Mutex<()>,
}

impl JobLedger {
    /// Load the ledger at `path`, or start an empty one if it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let snapshot = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let snapshot: LedgerSnapshot = serde_json::from_str(&contents)?;
            if snapshot.version != LEDGER_VERSION {
                return Err(PipelineError::config(format!(
                    "ledger {} has version {} (expected {})",
                    path.display(),
                    snapshot.version,
                    LEDGER_VERSION
                )));
            }
            info!(
                "Loaded ledger {} ({} stages, {} chunks)",
                path.display(),
                snapshot.stages.len(),
                snapshot.chunks.len()
            );
            snapshot
        } else {
            debug!("No ledger at {}, starting fresh", path.display());
            LedgerSnapshot {
                version: LEDGER_VERSION,
                ..Default::default()
            }
        };

        let ledger = Self::from_snapshot(Some(path.to_path_buf()), snapshot);
        Ok(ledger)
    }

    /// Ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self::from_snapshot(
            None,
            LedgerSnapshot {
                version: LEDGER_VERSION,
                ..Default::default()
            },
        )
    }

    fn from_snapshot(path: Option<PathBuf>, snapshot: LedgerSnapshot) -> Self {
        Self {
            path,
            stages: snapshot.stages.into_iter().collect(),
            chunks: snapshot.chunks.into_iter().collect(),
            signals: snapshot.signals.into_iter().collect(),
            plan_fingerprint: Mutex::new(snapshot.plan_fingerprint),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current contents, keys sorted.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            version: LEDGER_VERSION,
            plan_fingerprint: self.fingerprint_guard().clone(),
            stages: self
                .stages
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            chunks: self.chunks.iter().map(|e| (*e.key(), e.value().clone())).collect(),
            signals: self.signals.iter().map(|e| (e.key().clone(), *e.value())).collect(),
        }
    }

    fn fingerprint_guard(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        // A poisoned lock only means a writer panicked; the value is still usable.
        self.plan_fingerprint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the ledger to disk.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    // ---- stages ----

    pub fn stage(&self, name: &str) -> Option<LedgerEntry> {
        self.stages.get(name).map(|e| e.value().clone())
    }

    pub fn stage_status(&self, name: &str) -> EntryStatus {
        self.stage(name).map_or(EntryStatus::Pending, |e| e.status)
    }

    fn update_stage(&self, name: &str, update: impl FnOnce(&mut LedgerEntry)) -> Result<()> {
        {
            let mut entry = self
                .stages
                .entry(name.to_string())
                .or_insert_with(LedgerEntry::pending);
            update(&mut entry);
            entry.updated_at = Utc::now();
        }
        self.persist()
    }

    pub fn stage_started(&self, name: &str) -> Result<()> {
        self.update_stage(name, |e| {
            e.status = EntryStatus::Running;
            e.attempts += 1;
            e.started_at = Some(Utc::now());
            e.finished_at = None;
        })
    }

    pub fn stage_succeeded(&self, name: &str, artifact: Option<String>) -> Result<()> {
        self.update_stage(name, |e| {
            e.status = EntryStatus::Succeeded;
            e.finished_at = Some(Utc::now());
            e.artifact = artifact;
            e.message = None;
        })
    }

    /// Record a stage that finished with gaps.
    pub fn stage_partial(&self, name: &str, artifact: Option<String>, message: &str) -> Result<()> {
        self.update_stage(name, |e| {
            e.status = EntryStatus::Partial;
            e.finished_at = Some(Utc::now());
            e.artifact = artifact;
            e.message = Some(message.to_string());
        })
    }

    /// Record a failed attempt; `retrying` marks it as re-entering pending.
    pub fn stage_failed(&self, name: &str, message: &str, retrying: bool) -> Result<()> {
        self.update_stage(name, |e| {
            e.status = if retrying {
                EntryStatus::Pending
            } else {
                EntryStatus::Failed
            };
            e.finished_at = Some(Utc::now());
            e.message = Some(message.to_string());
        })
    }

    pub fn stage_skipped(&self, name: &str) -> Result<()> {
        self.update_stage(name, |e| {
            e.status = EntryStatus::Skipped;
            e.finished_at = Some(Utc::now());
        })
    }

    /// Stage is blocked on an external signal.
    pub fn stage_waiting(&self, name: &str, message: &str) -> Result<()> {
        self.update_stage(name, |e| {
            e.status = EntryStatus::Pending;
            e.message = Some(message.to_string());
        })
    }

    /// Forget the given stages so they run again. Resetting `process_stage`
    /// also clears every chunk entry.
    pub fn reset_stages(&self, names: &[&str], process_stage: &str) -> Result<()> {
        for name in names {
            if self.stages.remove(*name).is_some() {
                info!("Reset stage '{}'", name);
            }
            if *name == process_stage {
                self.chunks.clear();
                *self.fingerprint_guard() = None;
            }
        }
        self.persist()
    }

    // ---- chunks ----

    pub fn chunk(&self, index: usize) -> Option<LedgerEntry> {
        self.chunks.get(&index).map(|e| e.value().clone())
    }

    fn update_chunk(&self, index: usize, update: impl FnOnce(&mut LedgerEntry)) -> Result<()> {
        {
            let mut entry = self.chunks.entry(index).or_insert_with(LedgerEntry::pending);
            update(&mut entry);
            entry.updated_at = Utc::now();
        }
        self.persist()
    }

    pub fn chunk_started(&self, index: usize) -> Result<()> {
        self.update_chunk(index, |e| {
            e.status = EntryStatus::Running;
            e.attempts += 1;
            e.started_at = Some(Utc::now());
            e.finished_at = None;
        })
    }

    pub fn chunk_succeeded(&self, index: usize, artifact: Option<String>) -> Result<()> {
        self.update_chunk(index, |e| {
            e.status = EntryStatus::Succeeded;
            e.finished_at = Some(Utc::now());
            e.artifact = artifact;
            e.message = None;
        })
    }

    pub fn chunk_retried(&self, index: usize, message: &str) -> Result<()> {
        self.update_chunk(index, |e| {
            e.status = EntryStatus::Retried;
            e.message = Some(message.to_string());
        })
    }

    pub fn chunk_failed(&self, index: usize, message: &str) -> Result<()> {
        self.update_chunk(index, |e| {
            e.status = EntryStatus::Failed;
            e.finished_at = Some(Utc::now());
            e.message = Some(message.to_string());
        })
    }

    /// Succeeded chunks with their artifact references, by index.
    pub fn succeeded_chunks(&self) -> BTreeMap<usize, Option<String>> {
        self.chunks
            .iter()
            .filter(|e| e.value().status.is_succeeded())
            .map(|e| (*e.key(), e.value().artifact.clone()))
            .collect()
    }

    /// Count chunk entries by status.
    pub fn chunk_counts(&self) -> BTreeMap<EntryStatus, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.chunks.iter() {
            *counts.entry(entry.value().status).or_insert(0) += 1;
        }
        counts
    }

    pub fn plan_fingerprint(&self) -> Option<String> {
        self.fingerprint_guard().clone()
    }

    /// Bind chunk entries to a plan. If the ledger holds entries for a
    /// different plan they are discarded. Returns true when entries were reset.
    pub fn bind_plan(&self, fingerprint: &str) -> Result<bool> {
        let reset = {
            let mut current = self.fingerprint_guard();
            if current.as_deref() == Some(fingerprint) {
                return Ok(false);
            }
            let stale = !self.chunks.is_empty();
            if stale {
                warn!(
                    "Chunk plan changed ({} -> {}), discarding {} chunk entries",
                    current.as_deref().unwrap_or("none"),
                    fingerprint,
                    self.chunks.len()
                );
                self.chunks.clear();
            }
            *current = Some(fingerprint.to_string());
            stale
        };
        self.persist()?;
        Ok(reset)
    }

    // ---- signals ----

    pub fn set_signal(&self, name: &str) -> Result<()> {
        self.signals.insert(name.to_string(), Utc::now());
        info!("Recorded signal '{}'", name);
        self.persist()
    }

    pub fn has_signal(&self, name: &str) -> bool {
        self.signals.contains_key(name)
    }

    pub fn clear_signal(&self, name: &str) -> Result<()> {
        self.signals.remove(name);
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_lifecycle_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");

        let ledger = JobLedger::open(&path).unwrap();
        assert_eq!(ledger.stage_status("import"), EntryStatus::Pending);
        ledger.stage_started("import").unwrap();
        ledger.stage_failed("import", "connection reset", true).unwrap();
        ledger.stage_started("import").unwrap();
        ledger
            .stage_succeeded("import", Some("/work/import/brain.json".into()))
            .unwrap();
        ledger.stage_skipped("stitch-align").unwrap();
        drop(ledger);

        let reloaded = JobLedger::open(&path).unwrap();
        let entry = reloaded.stage("import").unwrap();
        assert_eq!(entry.status, EntryStatus::Succeeded);
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.artifact.as_deref(), Some("/work/import/brain.json"));
        assert!(entry.message.is_none());
        assert!(entry.finished_at.is_some());
        assert_eq!(reloaded.stage_status("stitch-align"), EntryStatus::Skipped);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_partial_stage_is_not_trusted_on_resume() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");

        let ledger = JobLedger::open(&path).unwrap();
        ledger.stage_started("process").unwrap();
        ledger
            .stage_partial("process", Some("/work/output/objects.json".into()), "1 failed region")
            .unwrap();
        drop(ledger);

        let reloaded = JobLedger::open(&path).unwrap();
        let entry = reloaded.stage("process").unwrap();
        assert_eq!(entry.status, EntryStatus::Partial);
        assert!(!entry.status.is_succeeded());
        assert_eq!(entry.artifact.as_deref(), Some("/work/output/objects.json"));
        assert_eq!(entry.message.as_deref(), Some("1 failed region"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"partial\""));
    }

    #[test]
    fn test_chunk_entries_and_counts() {
        let ledger = JobLedger::in_memory();
        for i in 0..4 {
            ledger.chunk_started(i).unwrap();
        }
        ledger.chunk_succeeded(0, Some("chunk_00000.json".into())).unwrap();
        ledger.chunk_succeeded(2, Some("chunk_00002.json".into())).unwrap();
        ledger.chunk_retried(1, "boom").unwrap();
        ledger.chunk_started(1).unwrap();
        ledger.chunk_failed(1, "boom").unwrap();

        let succeeded = ledger.succeeded_chunks();
        assert_eq!(succeeded.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(ledger.chunk(1).unwrap().attempts, 2);

        let counts = ledger.chunk_counts();
        assert_eq!(counts[&EntryStatus::Succeeded], 2);
        assert_eq!(counts[&EntryStatus::Failed], 1);
        assert_eq!(counts[&EntryStatus::Running], 1);
    }

    #[test]
    fn test_bind_plan_discards_entries_of_other_plan() {
        let ledger = JobLedger::in_memory();
        assert!(!ledger.bind_plan("plan-a").unwrap());
        ledger.chunk_succeeded(0, None).unwrap();

        assert!(!ledger.bind_plan("plan-a").unwrap());
        assert!(ledger.chunk(0).is_some());

        assert!(ledger.bind_plan("plan-b").unwrap());
        assert!(ledger.chunk(0).is_none());
        assert_eq!(ledger.plan_fingerprint().as_deref(), Some("plan-b"));
    }

    #[test]
    fn test_signals_survive_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ledger.json");

        let ledger = JobLedger::open(&path).unwrap();
        assert!(!ledger.has_signal("alignment-verified"));
        ledger.set_signal("alignment-verified").unwrap();
        drop(ledger);

        let reloaded = JobLedger::open(&path).unwrap();
        assert!(reloaded.has_signal("alignment-verified"));
        reloaded.clear_signal("alignment-verified").unwrap();
        assert!(!reloaded.has_signal("alignment-verified"));
    }

    #[test]
    fn test_reset_process_stage_clears_chunks() {
        let ledger = JobLedger::in_memory();
        ledger.bind_plan("p").unwrap();
        ledger.stage_succeeded("transpose", None).unwrap();
        ledger.stage_succeeded("process", None).unwrap();
        ledger.chunk_succeeded(3, None).unwrap();

        ledger.reset_stages(&["process", "upload"], "process").unwrap();
        assert_eq!(ledger.stage_status("process"), EntryStatus::Pending);
        assert_eq!(ledger.stage_status("transpose"), EntryStatus::Succeeded);
        assert!(ledger.chunk(3).is_none());
        assert!(ledger.plan_fingerprint().is_none());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();
        assert!(matches!(JobLedger::open(&path), Err(PipelineError::Config(_))));
    }
}
