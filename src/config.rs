use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::plan::StepKind;
use crate::run::RunContext;
use crate::store;

/// An external program and its literal argument vector.
///
/// Arguments may contain `{name}` placeholders that [`CommandSpec::render`]
/// fills in; the result is still passed argument by argument, never through
/// a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Arguments with every `{key}` replaced by its value.
    pub fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{}}}", key), value)
                })
            })
            .collect()
    }
}

/// Default timeouts in seconds, per step kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub sfc: u64,
    pub dism: u64,
    pub driver_install: u64,
    pub device_scan: u64,
    pub exe: u64,
    pub msi: u64,
    pub script: u64,
    /// Commands run by inline repair handlers
    pub inline: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sfc: 5400,
            dism: 5400,
            driver_install: 900,
            device_scan: 300,
            exe: 1800,
            msi: 1800,
            script: 1800,
            inline: 600,
        }
    }
}

impl Timeouts {
    pub fn for_kind(&self, kind: &StepKind) -> u64 {
        match kind {
            StepKind::Sfc => self.sfc,
            StepKind::Dism => self.dism,
            StepKind::DriversInf => self.driver_install,
            StepKind::DriversScan => self.device_scan,
            StepKind::Exe => self.exe,
            StepKind::Msi => self.msi,
            StepKind::Script => self.script,
            _ => self.inline,
        }
    }
}

/// External tools the executor drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub sfc: CommandSpec,
    pub dism: CommandSpec,
    /// `{path}` is the INF file
    pub driver_install: CommandSpec,
    pub device_scan: CommandSpec,
    /// `{path}` is the MSI package
    pub msi: CommandSpec,
    /// `{path}` is the script
    pub powershell: CommandSpec,
    /// `{path}` is the batch file
    pub batch: CommandSpec,
    pub update_reset: Vec<CommandSpec>,
    pub network_reset: Vec<CommandSpec>,
    /// `{run_id}` is the run id
    pub restore_point: CommandSpec,
    pub boot_repair: Vec<CommandSpec>,
    /// `{path}` is the file; exit 0 means a valid signature
    pub signature_check: CommandSpec,
    pub reboot: CommandSpec,
    /// `{name}` is the hook name, `{command}` the resume command line
    pub resume_task: CommandSpec,
    pub resume_run_once: CommandSpec,
    /// `{name}` is the hook name
    pub resume_task_delete: CommandSpec,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            sfc: CommandSpec::new("sfc", &["/scannow"]),
            dism: CommandSpec::new(
                "DISM",
                &["/Online", "/Cleanup-Image", "/RestoreHealth"],
            ),
            driver_install: CommandSpec::new("pnputil", &["/add-driver", "{path}", "/install"]),
            device_scan: CommandSpec::new("pnputil", &["/scan-devices"]),
            msi: CommandSpec::new("msiexec", &["/i", "{path}", "/qn", "/norestart"]),
            powershell: CommandSpec::new(
                "powershell",
                &["-NoProfile", "-ExecutionPolicy", "Bypass", "-File", "{path}"],
            ),
            batch: CommandSpec::new("cmd", &["/d", "/c", "{path}"]),
            update_reset: vec![
                CommandSpec::new("net", &["stop", "wuauserv"]),
                CommandSpec::new("net", &["stop", "bits"]),
                CommandSpec::new("net", &["stop", "cryptsvc"]),
                CommandSpec::new("net", &["start", "cryptsvc"]),
                CommandSpec::new("net", &["start", "bits"]),
                CommandSpec::new("net", &["start", "wuauserv"]),
            ],
            network_reset: vec![
                CommandSpec::new("netsh", &["winsock", "reset"]),
                CommandSpec::new("netsh", &["int", "ip", "reset"]),
                CommandSpec::new("ipconfig", &["/flushdns"]),
            ],
            restore_point: CommandSpec::new(
                "powershell",
                &[
                    "-NoProfile",
                    "-Command",
                    "Checkpoint-Computer -Description 'mend {run_id}' -RestorePointType MODIFY_SETTINGS",
                ],
            ),
            boot_repair: vec![CommandSpec::new("bcdboot", &["C:\\Windows"])],
            signature_check: CommandSpec::new("signtool", &["verify", "/pa", "/q", "{path}"]),
            reboot: CommandSpec::new("shutdown", &["/r", "/t", "5"]),
            resume_task: CommandSpec::new(
                "schtasks",
                &[
                    "/Create", "/F", "/TN", "{name}", "/SC", "ONSTART", "/RL", "HIGHEST", "/RU",
                    "SYSTEM", "/TR", "{command}",
                ],
            ),
            resume_run_once: CommandSpec::new(
                "reg",
                &[
                    "add",
                    "HKLM\\Software\\Microsoft\\Windows\\CurrentVersion\\RunOnce",
                    "/v",
                    "{name}",
                    "/t",
                    "REG_SZ",
                    "/d",
                    "{command}",
                    "/f",
                ],
            ),
            resume_task_delete: CommandSpec::new("schtasks", &["/Delete", "/F", "/TN", "{name}"]),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Roots that guarded steps may execute from; empty admits nothing
    pub allowed_roots: Vec<PathBuf>,
    pub hardware_ids: Vec<String>,
    /// Skip INFs mentioning none of `hardware_ids`
    pub filter_hardware_ids: bool,
    /// Log steps without dispatching them
    pub dry_run: bool,
    /// Stop before rebooting instead of restarting the machine
    pub no_reboot: bool,
    pub runs_dir: PathBuf,
    pub knowledge_path: PathBuf,
    /// How many recent events adaptation looks at
    pub recent_events: usize,
    pub timeouts: Timeouts,
    pub tools: Tools,
    /// Progress regex overrides keyed by step kind (`repair.sfc`, ...)
    pub progress_patterns: BTreeMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        Self {
            allowed_roots: Vec::new(),
            hardware_ids: Vec::new(),
            filter_hardware_ids: false,
            dry_run: false,
            no_reboot: false,
            runs_dir: data.join("runs"),
            knowledge_path: data.join("knowledge.json"),
            recent_events: 50,
            timeouts: Timeouts::default(),
            tools: Tools::default(),
            progress_patterns: BTreeMap::new(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mend")
}

impl Config {
    /// `<config_dir>/mend/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mend").join("config.json"))
    }

    /// Load `path`, or the default location, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };
        if let Some(path) = path {
            if let Some(config) = store::read_json::<Self>(&path)? {
                debug!(path = %path.display(), "Loaded config");
                return Ok(config);
            }
        }
        Ok(Self::default())
    }

    /// Snapshot this configuration into the run directory.
    pub fn save_for_run(&self, ctx: &RunContext) -> Result<()> {
        store::write_json_atomic(&ctx.config_path(), self)
    }

    /// The configuration a run was started with, if it saved one.
    pub fn load_for_run(ctx: &RunContext) -> Result<Option<Self>> {
        let config = store::read_json::<Self>(&ctx.config_path())?;
        if config.is_some() {
            debug!(run = %ctx.id, "Using configuration saved with the run");
        }
        Ok(config)
    }

    /// Progress patterns for `kind`: configured override, else the built-in set.
    pub fn progress_patterns_for(&self, kind: &StepKind) -> Vec<String> {
        if let Some(patterns) = self.progress_patterns.get(kind.as_str()) {
            return patterns.clone();
        }
        let builtin: &[&str] = match kind {
            StepKind::Sfc => crate::process::SFC_PATTERNS,
            StepKind::Dism => crate::process::DISM_PATTERNS,
            _ => &[],
        };
        builtin.iter().map(|p| p.to_string()).collect()
    }
}
