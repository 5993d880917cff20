use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store;

/// What a step does. Serialized as the dotted kind string used in manifests
/// (`repair.sfc`, `drivers.inf`, ...). Unrecognized strings are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepKind {
    Detect,
    Backup,
    RestorePoint,
    UpdateReset,
    NetworkReset,
    BootRepair,
    Sfc,
    Dism,
    DriversVerify,
    DriversInf,
    DriversScan,
    Exe,
    Msi,
    Script,
    Finalize,
    Reboot,
    Unknown(String),
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Detect => "detect",
            Self::Backup => "backup.stub",
            Self::RestorePoint => "repair.restore_point",
            Self::UpdateReset => "repair.wu.reset",
            Self::NetworkReset => "repair.net.reset",
            Self::BootRepair => "repair.boot",
            Self::Sfc => "repair.sfc",
            Self::Dism => "repair.dism",
            Self::DriversVerify => "drivers.verify",
            Self::DriversInf => "drivers.inf",
            Self::DriversScan => "drivers.scan",
            Self::Exe => "exe",
            Self::Msi => "msi",
            Self::Script => "script",
            Self::Finalize => "finalize",
            Self::Reboot => "reboot",
            Self::Unknown(s) => s,
        }
    }

    /// Any `repair.*` kind.
    pub fn is_repair(&self) -> bool {
        self.as_str().starts_with("repair.")
    }
}

impl From<String> for StepKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "detect" => Self::Detect,
            "backup" | "backup.stub" => Self::Backup,
            "repair.restore_point" => Self::RestorePoint,
            "repair.wu.reset" => Self::UpdateReset,
            "repair.net.reset" => Self::NetworkReset,
            "repair.boot" => Self::BootRepair,
            "repair.sfc" => Self::Sfc,
            "repair.dism" => Self::Dism,
            "drivers.verify" => Self::DriversVerify,
            "drivers.inf" => Self::DriversInf,
            "drivers.scan" => Self::DriversScan,
            "exe" => Self::Exe,
            "msi" => Self::Msi,
            "script" => Self::Script,
            "finalize" => Self::Finalize,
            "reboot" => Self::Reboot,
            _ => Self::Unknown(s),
        }
    }
}

impl From<&str> for StepKind {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        match kind {
            StepKind::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Advisory ordering hint; execution order is list position
    #[serde(default)]
    pub order: i64,
    pub name: String,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Expected lowercase hex SHA-256 of the artifact at `path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    /// Reboot (and arm resume) after this step
    #[serde(default)]
    pub reboot: bool,
}

impl Step {
    pub fn new(order: i64, name: impl Into<String>, kind: impl Into<StepKind>) -> Self {
        Self {
            order,
            name: name.into(),
            kind: kind.into(),
            path: None,
            args: Vec::new(),
            sha256: None,
            timeout_sec: None,
            reboot: false,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sha256(mut self, hash: impl Into<String>) -> Self {
        self.sha256 = Some(hash.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_sec = Some(secs);
        self
    }

    pub fn with_reboot(mut self) -> Self {
        self.reboot = true;
        self
    }

    /// A `reboot` kind step always reboots, whatever its flag says.
    pub fn triggers_reboot(&self) -> bool {
        self.reboot || self.kind == StepKind::Reboot
    }
}

/// Ordered list of steps for one run. Persisted as a bare JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Splice `steps` in immediately after position `index`, keeping their order.
    pub fn insert_after(&mut self, index: usize, steps: Vec<Step>) {
        let at = (index + 1).min(self.steps.len());
        self.steps.splice(at..at, steps);
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        store::read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        store::write_json_atomic(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(StepKind::from("repair.sfc"), StepKind::Sfc);
        assert_eq!(StepKind::from("backup"), StepKind::Backup);
        assert_eq!(
            StepKind::from("firmware.flash"),
            StepKind::Unknown("firmware.flash".into())
        );
        assert_eq!(String::from(StepKind::DriversInf), "drivers.inf");
        assert!(StepKind::UpdateReset.is_repair());
        assert!(!StepKind::DriversScan.is_repair());
    }

    #[test]
    fn test_step_json_shape() {
        let json = r#"{"order": 7, "name": "Tool", "kind": "exe", "path": "tools/x.exe",
                       "args": ["/quiet"], "timeoutSec": 60, "reboot": true}"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.kind, StepKind::Exe);
        assert_eq!(step.timeout_sec, Some(60));
        assert!(step.triggers_reboot());

        let back = serde_json::to_value(&step).unwrap();
        assert_eq!(back["timeoutSec"], 60);
        assert_eq!(back["kind"], "exe");
        assert!(back.get("sha256").is_none());
    }

    #[test]
    fn test_insert_after_splices_in_order() {
        let mut plan = Plan::new(vec![
            Step::new(1, "a", "detect"),
            Step::new(2, "b", "reboot"),
            Step::new(3, "c", "finalize"),
        ]);
        plan.insert_after(
            1,
            vec![Step::new(0, "x", "drivers.scan"), Step::new(0, "y", "repair.dism")],
        );
        let names: Vec<_> = plan.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "x", "y", "c"]);
    }

    #[test]
    fn test_plan_is_a_bare_array() {
        let plan = Plan::new(vec![Step::new(1, "a", "detect")]);
        let value = serde_json::to_value(&plan).unwrap();
        assert!(value.is_array());
    }
}
