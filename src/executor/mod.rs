//! Plan executor: runs a plan step by step from the persisted resume index.
//!
//! Per step: persist the index, record a `running` event, dispatch by kind,
//! record the outcome. Step failures are recorded and the loop moves on;
//! a guarded artifact outside the allow-list (or failing its hash check)
//! halts the run. Reboot steps adapt the remaining plan, arm a boot-time
//! resume hook and restart the machine.

mod actions;
mod adapt;
mod resume;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub use actions::{CommandActions, SystemActions};
pub use adapt::{adapt, PRE_REBOOT_DISM, PRE_REBOOT_NETWORK_RESET, PRE_REBOOT_RESCAN};
pub use resume::{
    hook_name, CommandResumeScheduler, EntryPoint, ResumeMethod, ResumeRegistration,
    ResumeScheduler,
};

use crate::config::{CommandSpec, Config};
use crate::error::{Error, Result};
use crate::guard::{self, PathGuard};
use crate::plan::{inf, Plan, Step, StepKind};
use crate::process::{run_with_progress, ProcessOutput, ProgressMatcher};
use crate::run::{
    Details, Event, EventLog, EventStatus, KnowledgeStore, RunContext, RunState, INDEX_KEY,
    OVERALL, REBOOT_PENDING_KEY,
};
use crate::store;

/// Event name for the resume registration record.
pub const SCHEDULE_RESUME: &str = "Schedule resume";
/// Event name for a failed reboot request.
pub const REBOOT: &str = "Reboot";

/// Extensions swept by `drivers.verify`.
const SIGNED_EXTENSIONS: &[&str] = &["sys", "cat", "dll", "exe", "msi"];

/// How a call to [`Executor::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step ran
    Completed,
    /// A guarded step was refused; nothing after it ran
    Halted { index: usize, status: EventStatus },
    /// Reboot requested; the resume hook takes over after restart
    Rebooting { index: usize },
    /// Reboot suppressed (test mode) or the reboot request failed
    PausedForReboot { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Halted,
}

/// Summary written to `result.json` when a run finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<usize>,
    pub steps: usize,
    /// Terminal step outcomes by status
    pub counts: BTreeMap<String, usize>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn load(ctx: &RunContext) -> Result<Option<Self>> {
        store::read_json(&ctx.result_path())
    }
}

struct StepOutcome {
    status: EventStatus,
    details: Details,
}

impl StepOutcome {
    fn new(status: EventStatus, details: Details) -> Self {
        Self { status, details }
    }

    fn done(
        status: EventStatus,
        started: Instant,
        path: Option<&Path>,
        message: Option<String>,
    ) -> Self {
        Self::new(
            status,
            Details::Outcome {
                exit_code: None,
                duration_ms: elapsed_ms(started),
                path: path.map(Path::to_path_buf),
                message,
                timed_out: false,
            },
        )
    }

    fn success(started: Instant) -> Self {
        Self::done(EventStatus::Success, started, None, None)
    }

    fn error(started: Instant, path: Option<&Path>, err: impl ToString) -> Self {
        Self::done(EventStatus::Error, started, path, Some(err.to_string()))
    }

    fn halts_run(&self) -> bool {
        matches!(self.status, EventStatus::Blocked | EventStatus::HashMismatch)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Drives one run of a plan.
pub struct Executor<A, R> {
    ctx: RunContext,
    config: Config,
    guard: PathGuard,
    plan: Plan,
    events: EventLog,
    state: RunState,
    actions: A,
    scheduler: R,
    entry: EntryPoint,
}

impl<A: SystemActions, R: ResumeScheduler> Executor<A, R> {
    /// Start a fresh run of `plan` under `config.runs_dir`.
    ///
    /// `config` is saved with the run so a resume after reboot sees the same
    /// allow-list and flags the run started with.
    pub fn create(
        config: Config,
        plan: Plan,
        actions: A,
        scheduler: R,
        entry: EntryPoint,
    ) -> Result<Self> {
        let ctx = RunContext::create(&config.runs_dir)?;
        let mut knowledge = KnowledgeStore::load(&config.knowledge_path)?;
        knowledge.record_run()?;
        plan.save(&ctx.plan_path())?;
        config.save_for_run(&ctx)?;
        info!(run = %ctx.id, root = %ctx.root.display(), steps = plan.len(), "Run created");
        Self::assemble(ctx, config, plan, knowledge, actions, scheduler, entry)
    }

    /// Reopen the run at `root` after an interruption.
    ///
    /// The configuration saved with the run wins over `config`, which only
    /// applies to runs that carry none.
    pub fn resume(
        root: &Path,
        config: Config,
        actions: A,
        scheduler: R,
        entry: EntryPoint,
    ) -> Result<Self> {
        let ctx = RunContext::open(root)?;
        let plan = Plan::load(&ctx.plan_path())?
            .ok_or_else(|| Error::UnknownRun(root.to_path_buf()))?;
        let config = Config::load_for_run(&ctx)?.unwrap_or(config);
        let knowledge = KnowledgeStore::load(&config.knowledge_path)?;
        info!(run = %ctx.id, steps = plan.len(), "Run reopened");
        Self::assemble(ctx, config, plan, knowledge, actions, scheduler, entry)
    }

    fn assemble(
        ctx: RunContext,
        config: Config,
        plan: Plan,
        knowledge: KnowledgeStore,
        actions: A,
        scheduler: R,
        entry: EntryPoint,
    ) -> Result<Self> {
        let events = EventLog::open(&ctx, knowledge)?;
        let state = RunState::open(&ctx);
        let guard = PathGuard::new(config.allowed_roots.clone());
        Ok(Self {
            ctx,
            config,
            guard,
            plan,
            events,
            state,
            actions,
            scheduler,
            entry,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Where to continue: the stored index, or the step after a reboot that
    /// already happened. The flag is true in the latter case.
    fn start_index(&self) -> Result<(usize, bool)> {
        let index = self.state.index()?;
        match self.state.reboot_pending()? {
            Some(pending) => {
                self.state.remove(REBOOT_PENDING_KEY)?;
                if pending == index {
                    debug!(index, "Continuing after reboot");
                    self.state.set(INDEX_KEY, index + 1)?;
                    Ok((index + 1, true))
                } else {
                    Ok((index, false))
                }
            }
            None => Ok((index, false)),
        }
    }

    /// Execute from the resume index until the plan ends, halts or reboots.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let (mut index, rebooted) = self.start_index()?;
        if rebooted {
            if let Err(e) = self.scheduler.clear(&self.ctx).await {
                warn!(error = %e, "Failed to remove resume hook");
            }
        }

        if index >= self.plan.len() {
            if let Some(result) = RunResult::load(&self.ctx)? {
                if result.status == RunStatus::Completed {
                    info!(run = %self.ctx.id, "Run already completed");
                    return Ok(RunOutcome::Completed);
                }
            }
        }
        info!(run = %self.ctx.id, start = index, total = self.plan.len(), "Executing plan");

        while let Some(step) = self.plan.get(index).cloned() {
            let total = self.plan.len();
            self.state.set(INDEX_KEY, index)?;
            self.events.append(
                Event::new(
                    &step.name,
                    EventStatus::Running,
                    Details::Step {
                        index,
                        total,
                        kind: step.kind.clone(),
                        progress: 0,
                    },
                )
                .with_kind(step.kind.clone()),
            )?;
            self.record_overall(index, total)?;

            info!(index, step = %step.name, kind = %step.kind, "Step started");
            let outcome = if self.config.dry_run {
                info!(step = %step.name, "Dry run, not dispatching");
                StepOutcome::new(
                    EventStatus::Skipped,
                    Details::Note {
                        message: "dry run".into(),
                    },
                )
            } else {
                self.dispatch(index, &step).await
            };

            match &outcome.status {
                EventStatus::Success => info!(step = %step.name, "Step succeeded"),
                status => warn!(step = %step.name, status = %status, "Step did not succeed"),
            }

            let halts = outcome.halts_run();
            let status = outcome.status.clone();
            self.events.append(
                Event::new(&step.name, outcome.status, outcome.details)
                    .with_kind(step.kind.clone()),
            )?;
            self.record_overall(index + 1, total)?;

            if halts {
                error!(index, step = %step.name, status = %status, "Run halted");
                self.finish(RunStatus::Halted, Some(index))?;
                return Ok(RunOutcome::Halted { index, status });
            }

            if step.triggers_reboot() && !self.config.dry_run {
                return self.reboot_and_resume(index).await;
            }

            index += 1;
        }

        self.state.set(INDEX_KEY, self.plan.len())?;
        self.finish(RunStatus::Completed, None)?;
        info!(run = %self.ctx.id, "Run completed");
        Ok(RunOutcome::Completed)
    }

    fn record_overall(&mut self, done: usize, total: usize) -> Result<()> {
        let percent = if total == 0 { 100 } else { (done * 100 / total) as u8 };
        self.events.append(Event::new(
            OVERALL,
            EventStatus::Progress,
            Details::Overall { done, total, percent },
        ))
    }

    fn finish(&self, status: RunStatus, halted_at: Option<usize>) -> Result<()> {
        let mut counts = BTreeMap::new();
        for event in self.events.events() {
            if event.step != OVERALL && event.kind.is_some() && !event.status.is_transient() {
                *counts.entry(event.status.to_string()).or_insert(0) += 1;
            }
        }
        let result = RunResult {
            id: self.ctx.id.clone(),
            status,
            halted_at,
            steps: self.plan.len(),
            counts,
            finished_at: Utc::now(),
        };
        store::write_json_atomic(&self.ctx.result_path(), &result)
    }

    async fn reboot_and_resume(&mut self, index: usize) -> Result<RunOutcome> {
        let recent = self.events.read_recent(self.config.recent_events).to_vec();
        let extra = adapt(&recent, self.events.knowledge(), &self.plan, index);
        let current = self.plan.get(index).map(|s| s.name.clone()).unwrap_or_default();

        if !extra.is_empty() {
            let names: Vec<String> = extra.iter().map(|s| s.name.clone()).collect();
            self.plan.insert_after(index, extra);
            self.events.append(Event::new(
                &current,
                EventStatus::Inserted,
                Details::Inserted {
                    after: index,
                    steps: names,
                },
            ))?;
        }
        self.plan.save(&self.ctx.plan_path())?;
        self.state.set(REBOOT_PENDING_KEY, index)?;

        let registration = self.scheduler.schedule(&self.ctx, &self.entry).await;
        let status = if registration.is_registered() {
            EventStatus::Success
        } else {
            error!(error = ?registration.error, "No resume hook registered; rebooting anyway");
            EventStatus::Error
        };
        self.events.append(Event::new(
            SCHEDULE_RESUME,
            status,
            Details::Resume {
                method: registration.method.to_string(),
                identifier: registration.identifier,
                error: registration.error,
            },
        ))?;

        if self.config.no_reboot {
            info!(index, "Reboot suppressed; run paused");
            return Ok(RunOutcome::PausedForReboot { index });
        }

        info!(index, "Rebooting");
        match self.actions.reboot().await {
            Ok(()) => Ok(RunOutcome::Rebooting { index }),
            Err(e) => {
                error!(error = %e, "Reboot request failed");
                // Nothing restarted: a resume must run this step again.
                self.state.remove(REBOOT_PENDING_KEY)?;
                self.events.append(Event::new(
                    REBOOT,
                    EventStatus::Error,
                    Details::Note {
                        message: e.to_string(),
                    },
                ))?;
                Ok(RunOutcome::PausedForReboot { index })
            }
        }
    }

    async fn dispatch(&mut self, index: usize, step: &Step) -> StepOutcome {
        let started = Instant::now();
        match &step.kind {
            StepKind::Detect | StepKind::Backup | StepKind::Finalize | StepKind::Reboot => {
                StepOutcome::success(started)
            }
            StepKind::RestorePoint => {
                let result = self.actions.create_restore_point(&self.ctx.id).await;
                inline_outcome(result, started)
            }
            StepKind::UpdateReset => {
                let result = self.actions.reset_update_components().await;
                inline_outcome(result, started)
            }
            StepKind::NetworkReset => {
                let result = self.actions.reset_network().await;
                inline_outcome(result, started)
            }
            StepKind::BootRepair => {
                let result = self.actions.repair_boot().await;
                inline_outcome(result, started)
            }
            StepKind::Sfc => {
                let spec = with_step_args(&self.config.tools.sfc, step);
                self.run_tool_step(index, step, &spec, Vec::new(), started).await
            }
            StepKind::Dism => {
                let spec = with_step_args(&self.config.tools.dism, step);
                self.run_tool_step(index, step, &spec, Vec::new(), started).await
            }
            StepKind::DriversVerify => self.verify_signatures(step, started).await,
            StepKind::DriversScan => {
                let spec = with_step_args(&self.config.tools.device_scan, step);
                self.run_tool_step(index, step, &spec, Vec::new(), started).await
            }
            StepKind::DriversInf => self.install_inf(index, step, started).await,
            StepKind::Exe | StepKind::Msi | StepKind::Script => {
                self.run_artifact(index, step, started).await
            }
            StepKind::Unknown(kind) => {
                warn!(kind = %kind, step = %step.name, "Unknown step kind, skipping");
                StepOutcome::done(
                    EventStatus::Success,
                    started,
                    None,
                    Some(format!("unknown kind {}", kind)),
                )
            }
        }
    }

    /// Allow-list, existence and hash checks shared by guarded kinds.
    /// Returns the resolved artifact path, or the outcome that ends the step.
    fn admit(&self, step: &Step, started: Instant) -> std::result::Result<PathBuf, StepOutcome> {
        let Some(path) = step.path.as_deref() else {
            return Err(StepOutcome::done(
                EventStatus::Missing,
                started,
                None,
                Some("no path declared".into()),
            ));
        };

        let resolved = match self.guard.check(path) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(path = %path.display(), "Artifact outside allowed roots");
                return Err(StepOutcome::done(
                    EventStatus::Blocked,
                    started,
                    Some(path),
                    Some(e.to_string()),
                ));
            }
        };

        if !resolved.exists() {
            return Err(StepOutcome::done(
                EventStatus::Missing,
                started,
                Some(resolved.as_path()),
                None,
            ));
        }

        if let Some(expected) = &step.sha256 {
            match guard::hash_matches(&resolved, expected) {
                Ok(true) => {}
                Ok(false) => {
                    error!(path = %resolved.display(), "Hash mismatch");
                    return Err(StepOutcome::done(
                        EventStatus::HashMismatch,
                        started,
                        Some(resolved.as_path()),
                        Some(format!("expected sha256 {}", expected)),
                    ));
                }
                Err(e) => return Err(StepOutcome::error(started, Some(resolved.as_path()), e)),
            }
        }

        Ok(resolved)
    }

    async fn run_artifact(&mut self, index: usize, step: &Step, started: Instant) -> StepOutcome {
        let path = match self.admit(step, started) {
            Ok(path) => path,
            Err(outcome) => return outcome,
        };

        let spec = match step.kind {
            StepKind::Msi => self.config.tools.msi.clone(),
            StepKind::Script => script_command(&path, &self.config),
            _ => CommandSpec {
                program: path.to_string_lossy().into_owned(),
                args: Vec::new(),
            },
        };
        let mut outcome = self
            .run_tool_step(index, step, &spec_for(&spec, &path), step.args.clone(), started)
            .await;
        if let Details::Outcome { path: p, .. } = &mut outcome.details {
            *p = Some(path);
        }
        outcome
    }

    async fn install_inf(&mut self, index: usize, step: &Step, started: Instant) -> StepOutcome {
        let path = match self.admit(step, started) {
            Ok(path) => path,
            Err(outcome) => return outcome,
        };

        let info = match inf::read_inf(&path) {
            Ok(content) => {
                if self.config.filter_hardware_ids
                    && !inf::matches_hardware_id(&content, &self.config.hardware_ids)
                {
                    info!(path = %path.display(), "No matching hardware id, skipping INF");
                    return StepOutcome::done(
                        EventStatus::Skipped,
                        started,
                        Some(path.as_path()),
                        Some("no matching hardware id".into()),
                    );
                }
                inf::parse_info(&content)
            }
            Err(e) => return StepOutcome::error(started, Some(path.as_path()), e),
        };

        let spec = spec_for(&self.config.tools.driver_install, &path);
        let outcome = self
            .run_tool_step(index, step, &spec, step.args.clone(), started)
            .await;
        let exit_code = match &outcome.details {
            Details::Outcome { exit_code, .. } => *exit_code,
            _ => None,
        };
        if outcome.status == EventStatus::Error {
            return outcome;
        }
        StepOutcome::new(
            outcome.status,
            Details::Driver {
                path,
                provider: info.provider,
                class: info.class,
                version: info.version,
                exit_code,
                duration_ms: elapsed_ms(started),
            },
        )
    }

    async fn verify_signatures(&self, step: &Step, started: Instant) -> StepOutcome {
        let Some(path) = step.path.as_deref().filter(|p| p.exists()) else {
            return StepOutcome::done(EventStatus::Missing, started, step.path.as_deref(), None);
        };

        let files: Vec<PathBuf> = if path.is_dir() {
            let mut files: Vec<PathBuf> = WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| is_signed_artifact(p))
                .collect();
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut ok = 0;
        let mut bad_files = Vec::new();
        for file in &files {
            match self.actions.verify_signature(file).await {
                Ok(true) => ok += 1,
                Ok(false) => bad_files.push(file.clone()),
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Signature check failed to run");
                    bad_files.push(file.clone());
                }
            }
        }

        let status = if bad_files.is_empty() {
            EventStatus::Success
        } else {
            EventStatus::Warning
        };
        info!(checked = files.len(), ok, bad = bad_files.len(), "Signatures verified");
        StepOutcome::new(
            status,
            Details::Signatures {
                checked: files.len(),
                ok,
                bad: bad_files.len(),
                bad_files,
                duration_ms: elapsed_ms(started),
            },
        )
    }

    /// Run an external tool for `step`, streaming progress into the event log
    /// and saving its output under the run's logs directory.
    async fn run_tool_step(
        &mut self,
        index: usize,
        step: &Step,
        spec: &CommandSpec,
        extra_args: Vec<String>,
        started: Instant,
    ) -> StepOutcome {
        let patterns = self.config.progress_patterns_for(&step.kind);
        let matcher = match ProgressMatcher::new(&patterns) {
            Ok(m) => m,
            Err(e) => return StepOutcome::error(started, None, e),
        };
        let timeout = Duration::from_secs(
            step.timeout_sec
                .unwrap_or_else(|| self.config.timeouts.for_kind(&step.kind)),
        );
        let mut args = spec.args.clone();
        args.extend(extra_args);

        let total = self.plan.len();
        let events = &mut self.events;
        let on_progress = |percent: u8| {
            let event = Event::new(
                &step.name,
                EventStatus::Running,
                Details::Step {
                    index,
                    total,
                    kind: step.kind.clone(),
                    progress: percent,
                },
            )
            .with_kind(step.kind.clone());
            if let Err(e) = events.append(event) {
                warn!(error = %e, "Failed to record progress");
            }
        };

        match run_with_progress(&spec.program, &args, timeout, &matcher, on_progress).await {
            Ok(output) => {
                self.save_output(index, &output);
                StepOutcome::new(
                    EventStatus::from_exit_code(output.exit_code),
                    Details::Outcome {
                        exit_code: Some(output.exit_code),
                        duration_ms: elapsed_ms(started),
                        path: None,
                        message: None,
                        timed_out: output.timed_out,
                    },
                )
            }
            Err(e) => StepOutcome::error(started, None, e),
        }
    }

    fn save_output(&self, index: usize, output: &ProcessOutput) {
        let mut content = output.stdout.clone();
        if !output.stderr.is_empty() {
            content.push_str("\n--- STDERR ---\n");
            content.push_str(&output.stderr);
        }
        let path = self.ctx.log_path(index);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(&path, content) {
            warn!(path = %path.display(), error = %e, "Failed to save step output");
        }
    }
}

fn inline_outcome(result: Result<()>, started: Instant) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::success(started),
        Err(e) => StepOutcome::error(started, None, e),
    }
}

/// Arguments declared on the step replace the tool's defaults.
fn with_step_args(spec: &CommandSpec, step: &Step) -> CommandSpec {
    if step.args.is_empty() {
        spec.clone()
    } else {
        CommandSpec {
            program: spec.program.clone(),
            args: step.args.clone(),
        }
    }
}

/// `spec` with `{path}` filled in.
fn spec_for(spec: &CommandSpec, path: &Path) -> CommandSpec {
    let path = path.to_string_lossy().into_owned();
    CommandSpec {
        program: spec.program.replace("{path}", &path),
        args: spec.render(&[("path", path.as_str())]),
    }
}

/// Interpreter for a script artifact, chosen by extension.
fn script_command(path: &Path, config: &Config) -> CommandSpec {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "ps1" => config.tools.powershell.clone(),
        "cmd" | "bat" => config.tools.batch.clone(),
        _ => CommandSpec {
            program: "{path}".into(),
            args: Vec::new(),
        },
    }
}

fn is_signed_artifact(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            SIGNED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plan::{build_plan, Manifest, Plan, INSTALL_INF_STEP};
    use crate::run::{Bucket, Counters};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, TempDir};

    #[derive(Clone, Default)]
    struct FakeActions {
        calls: Arc<Mutex<Vec<String>>>,
        /// Reboot requests that fail before one succeeds
        failing_reboots: Arc<AtomicUsize>,
    }

    impl FakeActions {
        fn called(&self, name: &str) {
            self.calls.lock().unwrap().push(name.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SystemActions for FakeActions {
        async fn create_restore_point(&self, _run_id: &str) -> Result<()> {
            self.called("restore_point");
            Ok(())
        }

        async fn reset_update_components(&self) -> Result<()> {
            self.called("update_reset");
            Ok(())
        }

        async fn reset_network(&self) -> Result<()> {
            self.called("network_reset");
            Ok(())
        }

        async fn repair_boot(&self) -> Result<()> {
            self.called("boot_repair");
            Err(Error::Action("bcdboot exited with 1".into()))
        }

        async fn verify_signature(&self, path: &Path) -> Result<bool> {
            self.called("verify");
            Ok(!path.to_string_lossy().contains("bad"))
        }

        async fn reboot(&self) -> Result<()> {
            self.called("reboot");
            let left = self.failing_reboots.load(Ordering::SeqCst);
            if left > 0 {
                self.failing_reboots.store(left - 1, Ordering::SeqCst);
                return Err(Error::Action("shutdown exited with 1190".into()));
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeScheduler {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeScheduler {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ResumeScheduler for FakeScheduler {
        async fn schedule(&self, ctx: &RunContext, _entry: &EntryPoint) -> ResumeRegistration {
            self.calls.lock().unwrap().push("schedule".into());
            ResumeRegistration::registered(ResumeMethod::ScheduledTask, hook_name(ctx))
        }

        async fn clear(&self, _ctx: &RunContext) -> Result<()> {
            self.calls.lock().unwrap().push("clear".into());
            Ok(())
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", &["-c", script])
    }

    struct Fixture {
        dir: TempDir,
        config: Config,
        actions: FakeActions,
        scheduler: FakeScheduler,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let pkg = dir.path().join("pkg");
            fs::create_dir_all(&pkg).unwrap();
            let mut config = Config {
                allowed_roots: vec![pkg],
                runs_dir: dir.path().join("runs"),
                knowledge_path: dir.path().join("knowledge.json"),
                no_reboot: true,
                ..Config::default()
            };
            config.tools.sfc = sh("echo 'Verification 50% complete'; echo done");
            config.tools.device_scan = sh("exit 0");
            config.tools.driver_install =
                CommandSpec::new("sh", &["-c", "test -f \"$0\"", "{path}"]);
            config.tools.batch = CommandSpec::new("sh", &["{path}"]);
            Self {
                dir,
                config,
                actions: FakeActions::default(),
                scheduler: FakeScheduler::default(),
            }
        }

        fn pkg(&self) -> PathBuf {
            self.dir.path().join("pkg")
        }

        fn executor(&self, plan: Plan) -> Executor<FakeActions, FakeScheduler> {
            Executor::create(
                self.config.clone(),
                plan,
                self.actions.clone(),
                self.scheduler.clone(),
                EntryPoint::new("/usr/bin/mend", vec!["resume".into(), "--root".into()]),
            )
            .unwrap()
        }

        fn reopen(&self, root: &Path) -> Executor<FakeActions, FakeScheduler> {
            Executor::resume(
                root,
                self.config.clone(),
                self.actions.clone(),
                self.scheduler.clone(),
                EntryPoint::new("/usr/bin/mend", vec![]),
            )
            .unwrap()
        }
    }

    /// Final outcome of every step, in order.
    fn outcomes(events: &EventLog) -> Vec<(String, EventStatus)> {
        events
            .events()
            .iter()
            .filter(|e| e.kind.is_some() && !e.status.is_transient())
            .map(|e| (e.step.clone(), e.status.clone()))
            .collect()
    }

    fn ok(name: &str) -> (String, EventStatus) {
        (name.to_string(), EventStatus::Success)
    }

    #[tokio::test]
    async fn test_reboot_pauses_then_resume_continues_after_it() {
        let fx = Fixture::new();
        let plan = Plan::new(vec![
            Step::new(1, "Detect hardware", StepKind::Detect),
            Step::new(2, "System file check", StepKind::Sfc),
            Step::new(3, "Reboot", StepKind::Reboot),
            Step::new(4, "Finalize", StepKind::Finalize),
        ]);
        let mut exec = fx.executor(plan);
        let root = exec.context().root.clone();

        let outcome = exec.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::PausedForReboot { index: 2 });
        assert_eq!(
            outcomes(exec.events()),
            vec![ok("Detect hardware"), ok("System file check"), ok("Reboot")]
        );

        let progress: Vec<u8> = exec
            .events()
            .events()
            .iter()
            .filter_map(|e| match e.details {
                Details::Step { progress, .. } if e.step == "System file check" => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0, 50]);

        let resume = exec
            .events()
            .events()
            .iter()
            .find(|e| e.step == SCHEDULE_RESUME)
            .unwrap();
        assert_eq!(resume.status, EventStatus::Success);

        let state = RunState::open(exec.context());
        assert_eq!(state.index().unwrap(), 2);
        assert_eq!(state.reboot_pending().unwrap(), Some(2));

        let log = fs::read_to_string(exec.context().log_path(1)).unwrap();
        assert!(log.contains("Verification 50% complete"));

        let mut exec = fx.reopen(&root);
        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        let reboots = outcomes(exec.events())
            .iter()
            .filter(|(name, _)| name == "Reboot")
            .count();
        assert_eq!(reboots, 1);
        assert_eq!(outcomes(exec.events()).last(), Some(&ok("Finalize")));
        assert_eq!(state.reboot_pending().unwrap(), None);
        assert_eq!(state.index().unwrap(), 4);

        let result = RunResult::load(exec.context()).unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.counts["success"], 4);
        assert!(fx.actions.calls().is_empty());
        assert_eq!(fx.scheduler.calls(), vec!["schedule", "clear"]);
    }

    #[tokio::test]
    async fn test_completed_run_resumes_as_noop() {
        let fx = Fixture::new();
        let mut exec = fx.executor(Plan::new(vec![Step::new(1, "Finalize", StepKind::Finalize)]));
        let root = exec.context().root.clone();
        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        let recorded = exec.events().events().len();
        let finished = RunResult::load(exec.context()).unwrap().unwrap().finished_at;

        let mut exec = fx.reopen(&root);
        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(exec.events().events().len(), recorded);
        let result = RunResult::load(exec.context()).unwrap().unwrap();
        assert_eq!(result.finished_at, finished);
    }

    #[tokio::test]
    async fn test_artifact_outside_allowed_roots_halts_run() {
        let fx = Fixture::new();
        let outside = fx.dir.path().join("elsewhere").join("evil.exe");
        let plan = Plan::new(vec![
            Step::new(1, "Detect hardware", StepKind::Detect),
            Step::new(2, "Vendor tool", StepKind::Exe).with_path(&outside),
            Step::new(3, "Finalize", StepKind::Finalize),
        ]);
        let mut exec = fx.executor(plan);

        let outcome = exec.run().await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Halted {
                index: 1,
                status: EventStatus::Blocked
            }
        );
        assert_eq!(
            outcomes(exec.events()),
            vec![
                ok("Detect hardware"),
                ("Vendor tool".to_string(), EventStatus::Blocked)
            ]
        );

        let result = RunResult::load(exec.context()).unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Halted);
        assert_eq!(result.halted_at, Some(1));
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_not_dispatched() {
        let fx = Fixture::new();
        let script = fx.pkg().join("fix.sh");
        let marker = fx.pkg().join("ran");
        fs::write(&script, format!("#!/bin/sh\ntouch {}\n", marker.display())).unwrap();
        let plan = Plan::new(vec![
            Step::new(1, "Fix script", StepKind::Script)
                .with_path(&script)
                .with_sha256("00ff"),
            Step::new(2, "Finalize", StepKind::Finalize),
        ]);
        let mut exec = fx.executor(plan);

        let outcome = exec.run().await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Halted {
                status: EventStatus::HashMismatch,
                ..
            }
        ));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_recorded_and_run_continues() {
        let fx = Fixture::new();
        let plan = Plan::new(vec![
            Step::new(1, "Vendor package", StepKind::Msi).with_path(fx.pkg().join("absent.msi")),
            Step::new(2, "Finalize", StepKind::Finalize),
        ]);
        let mut exec = fx.executor(plan);

        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(
            outcomes(exec.events()),
            vec![
                ("Vendor package".to_string(), EventStatus::Missing),
                ok("Finalize")
            ]
        );
    }

    #[tokio::test]
    async fn test_driver_folder_flow() {
        let mut fx = Fixture::new();
        fx.config.filter_hardware_ids = true;
        fx.config.hardware_ids = vec![r"PCI\VEN_8086".into()];

        let drivers = fx.pkg().join("drivers");
        fs::create_dir_all(&drivers).unwrap();
        fs::write(
            drivers.join("a.inf"),
            "[Version]\nClass=Net\nProvider=%Vendor%\nDriverVer=01/02/2024,1.2.3.4\n\n\
             [Models]\n%Dev% = Install, PCI\\VEN_8086&DEV_1234\n\n[Strings]\nVendor=\"Intel\"\n",
        )
        .unwrap();
        fs::write(drivers.join("b.inf"), "[Version]\nClass=Media\n").unwrap();
        fs::write(drivers.join("good.sys"), b"x").unwrap();
        fs::write(drivers.join("bad.cat"), b"x").unwrap();
        fs::write(drivers.join("readme.txt"), b"x").unwrap();

        let plan = Plan::new(vec![
            Step::new(1, "Verify driver signatures", StepKind::DriversVerify).with_path(&drivers),
            Step::new(2, INSTALL_INF_STEP, StepKind::DriversInf).with_path(drivers.join("a.inf")),
            Step::new(3, INSTALL_INF_STEP, StepKind::DriversInf).with_path(drivers.join("b.inf")),
            Step::new(4, "Scan for hardware changes", StepKind::DriversScan),
        ]);
        let mut exec = fx.executor(plan);
        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);

        let statuses: Vec<EventStatus> =
            outcomes(exec.events()).into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            statuses,
            vec![
                EventStatus::Warning,
                EventStatus::Success,
                EventStatus::Skipped,
                EventStatus::Success
            ]
        );
        assert_eq!(fx.actions.calls(), vec!["verify", "verify"]);

        let details: Vec<&Details> = exec
            .events()
            .events()
            .iter()
            .filter(|e| e.kind.is_some() && !e.status.is_transient())
            .map(|e| &e.details)
            .collect();
        match details[0] {
            Details::Signatures { checked, bad, bad_files, .. } => {
                assert_eq!(*checked, 2);
                assert_eq!(*bad, 1);
                assert!(bad_files[0].ends_with("bad.cat"));
            }
            other => panic!("unexpected details {:?}", other),
        }
        match details[1] {
            Details::Driver { provider, class, exit_code, .. } => {
                assert_eq!(provider.as_deref(), Some("Intel"));
                assert_eq!(class.as_deref(), Some("Net"));
                assert_eq!(*exit_code, Some(0));
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_knowledge_inserts_rescan_before_reboot() {
        let fx = Fixture::new();
        let mut knowledge = KnowledgeStore::load(&fx.config.knowledge_path).unwrap();
        for _ in 0..3 {
            knowledge.record_outcome(INSTALL_INF_STEP, &EventStatus::Error).unwrap();
        }

        let plan = Plan::new(vec![
            Step::new(1, "Detect hardware", StepKind::Detect),
            Step::new(2, "Reboot", StepKind::Reboot),
            Step::new(3, "Finalize", StepKind::Finalize),
        ]);
        let mut exec = fx.executor(plan);
        assert_eq!(exec.run().await.unwrap(), RunOutcome::PausedForReboot { index: 1 });

        let names = |plan: &Plan| -> Vec<String> {
            plan.steps().iter().map(|s| s.name.clone()).collect()
        };
        let expected = vec!["Detect hardware", "Reboot", PRE_REBOOT_RESCAN, "Finalize"];
        assert_eq!(names(exec.plan()), expected);
        let saved = Plan::load(&exec.context().plan_path()).unwrap().unwrap();
        assert_eq!(names(&saved), expected);

        let inserted = exec
            .events()
            .events()
            .iter()
            .find(|e| e.status == EventStatus::Inserted)
            .unwrap();
        assert_eq!(
            inserted.details,
            Details::Inserted {
                after: 1,
                steps: vec![PRE_REBOOT_RESCAN.to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_failed_repair_and_real_reboot() {
        let mut fx = Fixture::new();
        fx.config.no_reboot = false;
        let plan = Plan::new(vec![
            Step::new(1, "Repair boot", StepKind::BootRepair),
            Step::new(2, "Reboot", StepKind::Reboot),
            Step::new(3, "Finalize", StepKind::Finalize),
        ]);
        let mut exec = fx.executor(plan);

        assert_eq!(exec.run().await.unwrap(), RunOutcome::Rebooting { index: 1 });
        assert_eq!(outcomes(exec.events())[0].1, EventStatus::Error);
        assert_eq!(fx.actions.calls(), vec!["boot_repair", "reboot"]);
        let names: Vec<&str> = exec.plan().steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Repair boot", "Reboot", PRE_REBOOT_NETWORK_RESET, PRE_REBOOT_DISM, "Finalize"]
        );
    }

    #[tokio::test]
    async fn test_timeout_records_sentinel_exit() {
        let mut fx = Fixture::new();
        fx.config.tools.dism = sh("sleep 5");
        let plan = Plan::new(vec![
            Step::new(1, "Component store repair", StepKind::Dism).with_timeout(1)
        ]);
        let mut exec = fx.executor(plan);

        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        let last = exec
            .events()
            .events()
            .iter()
            .rev()
            .find(|e| e.kind.is_some())
            .unwrap();
        assert_eq!(last.status, EventStatus::Exit(crate::process::TIMEOUT_EXIT_CODE));
        assert!(matches!(last.details, Details::Outcome { timed_out: true, .. }));
    }

    #[tokio::test]
    async fn test_dry_run_dispatches_nothing() {
        let mut fx = Fixture::new();
        fx.config.dry_run = true;
        let plan = Plan::new(vec![
            Step::new(1, "Reset network stack", StepKind::NetworkReset),
            Step::new(2, "Vendor tool", StepKind::Exe).with_path("/nowhere/tool.exe"),
        ]);
        let mut exec = fx.executor(plan);

        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        assert!(outcomes(exec.events())
            .iter()
            .all(|(_, status)| *status == EventStatus::Skipped));
        assert!(fx.actions.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_never_reboots() {
        let mut fx = Fixture::new();
        fx.config.dry_run = true;
        fx.config.no_reboot = false;
        let plan = Plan::new(vec![
            Step::new(1, "Detect hardware", StepKind::Detect),
            Step::new(2, "Reboot", StepKind::Reboot),
            Step::new(3, "Finalize", StepKind::Finalize),
        ]);
        let mut exec = fx.executor(plan);

        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(outcomes(exec.events()).len(), 3);
        assert!(fx.actions.calls().is_empty());
        assert!(fx.scheduler.calls().is_empty());
        assert_eq!(RunState::open(exec.context()).reboot_pending().unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_reboot_is_retried_on_resume() {
        let mut fx = Fixture::new();
        fx.config.no_reboot = false;
        fx.actions.failing_reboots.store(1, Ordering::SeqCst);
        let plan = Plan::new(vec![
            Step::new(1, "Reboot", StepKind::Reboot),
            Step::new(2, "Finalize", StepKind::Finalize),
        ]);
        let mut exec = fx.executor(plan);
        let root = exec.context().root.clone();

        assert_eq!(exec.run().await.unwrap(), RunOutcome::PausedForReboot { index: 0 });
        let state = RunState::open(exec.context());
        assert_eq!(state.reboot_pending().unwrap(), None);
        assert_eq!(state.index().unwrap(), 0);

        let mut exec = fx.reopen(&root);
        assert_eq!(exec.run().await.unwrap(), RunOutcome::Rebooting { index: 0 });
        assert_eq!(fx.actions.calls(), vec!["reboot", "reboot"]);

        let mut exec = fx.reopen(&root);
        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(outcomes(exec.events()).last(), Some(&ok("Finalize")));
        assert_eq!(fx.scheduler.calls(), vec!["schedule", "schedule", "clear"]);
    }

    #[tokio::test]
    async fn test_resume_uses_settings_saved_with_run() {
        let fx = Fixture::new();
        let script = fx.pkg().join("fix.cmd");
        fs::write(&script, "printf '%s ' \"$@\" > \"$(dirname \"$0\")/out.txt\"\n").unwrap();
        let plan = Plan::new(vec![
            Step::new(1, "Reboot", StepKind::Reboot),
            Step::new(2, "Fix script", StepKind::Script)
                .with_path(&script)
                .with_args(["one", "two"]),
        ]);
        let mut exec = fx.executor(plan);
        let root = exec.context().root.clone();
        assert_eq!(exec.run().await.unwrap(), RunOutcome::PausedForReboot { index: 0 });

        // What `mend resume` builds without the start-time flags.
        let bare = Config {
            runs_dir: fx.dir.path().join("runs"),
            knowledge_path: fx.dir.path().join("knowledge.json"),
            ..Config::default()
        };
        let mut exec = Executor::resume(
            &root,
            bare,
            fx.actions.clone(),
            fx.scheduler.clone(),
            EntryPoint::new("/usr/bin/mend", vec![]),
        )
        .unwrap();

        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(outcomes(exec.events()).last(), Some(&ok("Fix script")));
        let out = fs::read_to_string(fx.pkg().join("out.txt")).unwrap();
        assert_eq!(out, "one two ");
    }

    #[tokio::test]
    async fn test_msi_gets_path_and_step_args() {
        let mut fx = Fixture::new();
        fx.config.tools.msi =
            CommandSpec::new("sh", &["-c", "printf '%s' \"$0\" > \"$1\"", "{path}"]);
        let msi = fx.pkg().join("app.msi");
        fs::write(&msi, b"package").unwrap();
        let digest = guard::sha256_file(&msi).unwrap().to_uppercase();
        let out = fx.pkg().join("installed.txt");
        let plan = Plan::new(vec![Step::new(1, "Vendor package", StepKind::Msi)
            .with_path(&msi)
            .with_sha256(digest)
            .with_args([out.to_string_lossy().into_owned()])]);
        let mut exec = fx.executor(plan);

        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);
        let resolved = msi.canonicalize().unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), resolved.to_string_lossy());

        let last = exec.events().events().iter().rev().find(|e| e.kind.is_some()).unwrap();
        assert_eq!(last.status, EventStatus::Success);
        match &last.details {
            Details::Outcome { exit_code, path, .. } => {
                assert_eq!(*exit_code, Some(0));
                assert_eq!(path.as_deref(), Some(resolved.as_path()));
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_built_plan_installs_every_inf_and_feeds_knowledge() {
        let mut fx = Fixture::new();
        fx.config.tools.dism = sh("exit 0");
        let drivers = fx.pkg().join("drivers");
        fs::create_dir_all(&drivers).unwrap();
        fs::write(drivers.join("a.inf"), "[Version]\nClass=Net\n").unwrap();
        fs::write(drivers.join("b.inf"), "[Version]\nClass=Media\n").unwrap();
        let manifest_path = fx.pkg().join("manifest.json");
        fs::write(
            &manifest_path,
            r#"{"models": [{"id": "m1", "aliases": ["Latitude"], "steps": [
                {"order": 10, "name": "Drivers", "kind": "drivers.inf", "path": "drivers"}
            ]}]}"#,
        )
        .unwrap();

        let manifest = Manifest::load(&manifest_path).unwrap();
        let plan = build_plan(&manifest, "m1", &fx.pkg()).unwrap();
        let mut exec = fx.executor(plan);
        assert_eq!(exec.run().await.unwrap(), RunOutcome::Completed);

        let finals: Vec<&Event> = exec
            .events()
            .events()
            .iter()
            .filter(|e| e.kind.is_some() && !e.status.is_transient())
            .collect();
        assert!(finals.iter().all(|e| e.status == EventStatus::Success));
        let tail: Vec<StepKind> = finals[finals.len() - 5..]
            .iter()
            .filter_map(|e| e.kind.clone())
            .collect();
        assert_eq!(
            tail,
            vec![
                StepKind::DriversVerify,
                StepKind::DriversInf,
                StepKind::DriversInf,
                StepKind::DriversScan,
                StepKind::Finalize
            ]
        );
        let installed: Vec<&Path> = finals
            .iter()
            .filter_map(|e| match &e.details {
                Details::Driver { path, .. } => Some(path.as_path()),
                _ => None,
            })
            .collect();
        assert_eq!(installed.len(), 2);
        assert!(installed[0].ends_with("a.inf"));
        assert!(installed[1].ends_with("b.inf"));

        // Knowledge holds exactly the per-name, per-bucket event counts.
        let mut expected: BTreeMap<String, Counters> = BTreeMap::new();
        for event in exec.events().events() {
            let c = expected.entry(event.step.clone()).or_default();
            match event.status.bucket() {
                Bucket::Success => c.success += 1,
                Bucket::Error => c.error += 1,
                Bucket::Exit => c.exit += 1,
                Bucket::Missing => c.missing += 1,
                Bucket::Warning => c.warning += 1,
                Bucket::Other => c.other += 1,
            }
        }
        let knowledge = KnowledgeStore::load(&fx.config.knowledge_path).unwrap();
        assert_eq!(knowledge.runs(), 1);
        assert_eq!(knowledge.steps().count(), expected.len());
        for (name, counters) in &expected {
            assert_eq!(knowledge.counters(name), *counters, "counters for {}", name);
        }
        assert_eq!(knowledge.counters(INSTALL_INF_STEP).success, 2);
    }
}
