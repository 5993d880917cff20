use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use super::RunContext;
use crate::error::Result;
use crate::store;

/// Key of the next step to execute.
pub const INDEX_KEY: &str = "index";
/// Key set to the step index whose reboot was triggered.
pub const REBOOT_PENDING_KEY: &str = "reboot_pending";

/// Flat key/value resume state of one run, rewritten whole on every update.
#[derive(Debug, Clone)]
pub struct RunState {
    path: PathBuf,
}

impl RunState {
    pub fn open(ctx: &RunContext) -> Self {
        Self {
            path: ctx.state_path(),
        }
    }

    pub fn get_all(&self) -> Result<BTreeMap<String, Value>> {
        Ok(store::read_json(&self.path)?.unwrap_or_default())
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut map = self.get_all()?;
        map.insert(key.to_string(), value.into());
        store::write_json_atomic(&self.path, &map)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.get_all()?;
        if map.remove(key).is_some() {
            store::write_json_atomic(&self.path, &map)?;
        }
        Ok(())
    }

    fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        Ok(self
            .get_all()?
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize))
    }

    /// Stored resume index, 0 for a fresh run.
    pub fn index(&self) -> Result<usize> {
        Ok(self.get_usize(INDEX_KEY)?.unwrap_or(0))
    }

    pub fn reboot_pending(&self) -> Result<Option<usize>> {
        self.get_usize(REBOOT_PENDING_KEY)
    }
}
