use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};

const PLAN_FILE: &str = "plan.json";
const EVENTS_FILE: &str = "events.json";
const STATE_FILE: &str = "state.json";
const RESULT_FILE: &str = "result.json";
const CONFIG_FILE: &str = "config.json";
const LOGS_DIR: &str = "logs";

/// One orchestration attempt. Every artifact of the run lives under `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub id: String,
    pub root: PathBuf,
}

impl RunContext {
    /// Create a fresh run directory under `runs_dir`.
    pub fn create(runs_dir: &Path) -> Result<Self> {
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..6]);
        let root = runs_dir.join(&id);
        fs::create_dir_all(root.join(LOGS_DIR)).map_err(|e| Error::io(&root, e))?;
        Ok(Self { id, root })
    }

    /// Reopen an existing run (after a reboot) by its root directory.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::UnknownRun(root.to_path_buf()));
        }
        let id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::UnknownRun(root.to_path_buf()))?;
        Ok(Self {
            id,
            root: root.to_path_buf(),
        })
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join(PLAN_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join(EVENTS_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn result_path(&self) -> PathBuf {
        self.root.join(RESULT_FILE)
    }

    /// Effective configuration the run was started with.
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Captured output of external commands, one file per step.
    pub fn log_path(&self, index: usize) -> PathBuf {
        self.root.join(LOGS_DIR).join(format!("step-{:03}.log", index))
    }
}
