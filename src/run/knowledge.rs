//! Machine-wide outcome counters, shared by every run.
//!
//! Only one orchestrator may run per machine at a time: the file is
//! rewritten whole on each update with no locking.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::events::{Bucket, EventStatus};
use crate::error::Result;
use crate::store;

/// Per-step outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub success: u64,
    pub error: u64,
    pub exit: u64,
    pub missing: u64,
    pub warning: u64,
    pub other: u64,
}

impl Counters {
    fn bump(&mut self, bucket: Bucket) {
        let slot = match bucket {
            Bucket::Success => &mut self.success,
            Bucket::Error => &mut self.error,
            Bucket::Exit => &mut self.exit,
            Bucket::Missing => &mut self.missing,
            Bucket::Warning => &mut self.warning,
            Bucket::Other => &mut self.other,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u64 {
        self.success + self.error + self.exit + self.missing + self.warning + self.other
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KnowledgeFile {
    #[serde(default)]
    steps: BTreeMap<String, Counters>,
    #[serde(default)]
    runs: u64,
}

/// Cross-run memory, flushed to disk on every update.
#[derive(Debug)]
pub struct KnowledgeStore {
    path: PathBuf,
    data: KnowledgeFile,
}

impl KnowledgeStore {
    /// Load from `path`, starting empty if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let data = store::read_json(path)?.unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_outcome(&mut self, step: &str, status: &EventStatus) -> Result<()> {
        self.data
            .steps
            .entry(step.to_string())
            .or_default()
            .bump(status.bucket());
        debug!(step, status = %status, "Knowledge updated");
        self.flush()
    }

    /// Count one fresh run.
    pub fn record_run(&mut self) -> Result<()> {
        self.data.runs += 1;
        self.flush()
    }

    /// Counters for `step`, zeros if never seen.
    pub fn counters(&self, step: &str) -> Counters {
        self.data.steps.get(step).copied().unwrap_or_default()
    }

    pub fn runs(&self) -> u64 {
        self.data.runs
    }

    pub fn steps(&self) -> impl Iterator<Item = (&str, &Counters)> {
        self.data.steps.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn flush(&self) -> Result<()> {
        store::write_json_atomic(&self.path, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_buckets_and_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("knowledge.json");
        let mut k = KnowledgeStore::load(&path).unwrap();
        assert_eq!(k.counters("sfc"), Counters::default());

        for status in [
            EventStatus::Success,
            EventStatus::Exit(5),
            EventStatus::Exit(408),
            EventStatus::Error,
            EventStatus::Blocked,
            EventStatus::Running,
        ] {
            k.record_outcome("sfc", &status).unwrap();
        }
        k.record_run().unwrap();

        let reloaded = KnowledgeStore::load(&path).unwrap();
        let c = reloaded.counters("sfc");
        assert_eq!(c.success, 1);
        assert_eq!(c.exit, 2);
        assert_eq!(c.error, 1);
        assert_eq!(c.other, 2);
        assert_eq!(c.total(), 6);
        assert_eq!(reloaded.runs(), 1);
    }

    #[test]
    fn test_file_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k.json");
        let mut k = KnowledgeStore::load(&path).unwrap();
        k.record_outcome("Install driver INF", &EventStatus::Missing).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["steps"]["Install driver INF"]["missing"], 1);
        assert_eq!(raw["runs"], 0);
    }
}
