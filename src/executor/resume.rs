use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{CommandSpec, Tools};
use crate::error::{Error, Result};
use crate::process::run_with_timeout;
use crate::run::RunContext;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);

/// How the next boot will restart the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMethod {
    /// Boot-time scheduled task
    ScheduledTask,
    /// Run-once entry at next logon
    RunOnce,
    None,
}

impl fmt::Display for ResumeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ScheduledTask => "scheduled_task",
            Self::RunOnce => "run_once",
            Self::None => "none",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRegistration {
    pub method: ResumeMethod,
    pub identifier: Option<String>,
    pub error: Option<String>,
}

impl ResumeRegistration {
    pub fn registered(method: ResumeMethod, identifier: impl Into<String>) -> Self {
        Self {
            method,
            identifier: Some(identifier.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            method: ResumeMethod::None,
            identifier: None,
            error: Some(error.into()),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.method != ResumeMethod::None
    }
}

/// The command that resumes a run: `program args... <run root>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl EntryPoint {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The currently running binary invoked as `resume [--config <file>] --root`.
    pub fn current_exe(config: Option<&Path>) -> std::io::Result<Self> {
        let mut args = vec!["resume".to_string()];
        if let Some(config) = config {
            let config = config.canonicalize().unwrap_or_else(|_| config.to_path_buf());
            args.push("--config".into());
            args.push(config.to_string_lossy().into_owned());
        }
        args.push("--root".into());
        Ok(Self::new(std::env::current_exe()?, args))
    }

    /// Quoted command line pointing at `ctx`, as stored in the boot hook.
    pub fn command_line(&self, ctx: &RunContext) -> String {
        let mut parts = vec![quote(&self.program.to_string_lossy())];
        parts.extend(self.args.iter().map(|a| quote(a)));
        parts.push(quote(&ctx.root.to_string_lossy()));
        parts.join(" ")
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        arg.to_string()
    } else {
        format!("\"{}\"", arg.replace('"', "\\\""))
    }
}

/// Arms a boot-time hook that restarts the orchestrator on a run.
///
/// Never fails outright: an unregistered hook comes back as
/// [`ResumeMethod::None`] with the error, and the caller reboots anyway.
#[allow(async_fn_in_trait)]
pub trait ResumeScheduler {
    async fn schedule(&self, ctx: &RunContext, entry: &EntryPoint) -> ResumeRegistration;

    /// Remove the boot-time hook once the run is past its reboot.
    async fn clear(&self, ctx: &RunContext) -> Result<()>;
}

/// Scheduled task first, run-once registry entry as fallback.
#[derive(Debug, Clone)]
pub struct CommandResumeScheduler {
    task: CommandSpec,
    run_once: CommandSpec,
    task_delete: CommandSpec,
}

impl CommandResumeScheduler {
    pub fn new(tools: &Tools) -> Self {
        Self {
            task: tools.resume_task.clone(),
            run_once: tools.resume_run_once.clone(),
            task_delete: tools.resume_task_delete.clone(),
        }
    }

    async fn try_register(
        &self,
        spec: &CommandSpec,
        name: &str,
        command: &str,
    ) -> std::result::Result<(), String> {
        let args = spec.render(&[("name", name), ("command", command)]);
        match run_with_timeout(&spec.program, &args, REGISTRATION_TIMEOUT).await {
            Ok(0) => Ok(()),
            Ok(code) => Err(format!("{} exited with {}", spec.program, code)),
            Err(e) => Err(e.to_string()),
        }
    }
}

pub fn hook_name(ctx: &RunContext) -> String {
    format!("mend-resume-{}", ctx.id)
}

impl ResumeScheduler for CommandResumeScheduler {
    async fn schedule(&self, ctx: &RunContext, entry: &EntryPoint) -> ResumeRegistration {
        let name = hook_name(ctx);
        let command = entry.command_line(ctx);

        let task_err = match self.try_register(&self.task, &name, &command).await {
            Ok(()) => {
                info!(name = %name, "Resume registered as scheduled task");
                return ResumeRegistration::registered(ResumeMethod::ScheduledTask, name);
            }
            Err(e) => e,
        };
        warn!(error = %task_err, "Scheduled task registration failed, trying run-once");

        match self.try_register(&self.run_once, &name, &command).await {
            Ok(()) => {
                info!(name = %name, "Resume registered as run-once entry");
                ResumeRegistration::registered(ResumeMethod::RunOnce, name)
            }
            Err(e) => {
                warn!(error = %e, "Run-once registration failed");
                ResumeRegistration::failed(format!(
                    "scheduled task: {}; run-once: {}",
                    task_err, e
                ))
            }
        }
    }

    /// Deletes the scheduled task. Run-once entries are removed by the OS when
    /// they fire, so a failure here is expected after a run-once resume.
    async fn clear(&self, ctx: &RunContext) -> Result<()> {
        let name = hook_name(ctx);
        let args = self.task_delete.render(&[("name", name.as_str())]);
        match run_with_timeout(&self.task_delete.program, &args, REGISTRATION_TIMEOUT).await? {
            0 => {
                info!(name = %name, "Resume hook removed");
                Ok(())
            }
            code => Err(Error::Action(format!(
                "{} exited with {}",
                self.task_delete.program, code
            ))),
        }
    }
}
