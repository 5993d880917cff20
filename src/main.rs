//! mend: run a resumable repair plan for the current machine.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mend::config::Config;
use mend::executor::{
    CommandActions, CommandResumeScheduler, EntryPoint, Executor, RunOutcome, RunResult,
};
use mend::plan::{build_plan, Manifest, Plan, ResolvedBy};
use mend::run::{KnowledgeStore, RunContext, RunState};

#[derive(Parser)]
#[command(name = "mend")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: <config dir>/mend/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a plan for this machine and start a new run
    Start(StartArgs),

    /// Continue an interrupted run
    Resume {
        /// Run directory
        #[arg(long)]
        root: PathBuf,
    },

    /// Print the plan that `start` would execute
    Plan(TargetArgs),

    /// Show the resume state and result of a run
    Status {
        /// Run directory
        #[arg(long)]
        root: PathBuf,
    },

    /// Show cross-run outcome counters
    Knowledge {
        /// Only this step name
        #[arg(long)]
        step: Option<String>,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Manifest describing known models
    #[arg(long)]
    manifest: PathBuf,

    /// Model string reported by the machine
    #[arg(long)]
    model: String,

    /// Manufacturer string reported by the machine
    #[arg(long, default_value = "")]
    manufacturer: String,

    /// Root that relative step paths resolve against (default: manifest directory)
    #[arg(long)]
    package_root: Option<PathBuf>,
}

#[derive(Args)]
struct StartArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Record every step as skipped without running anything
    #[arg(long)]
    dry_run: bool,

    /// Pause instead of rebooting when a step asks for a restart
    #[arg(long)]
    no_reboot: bool,

    /// Additional root guarded steps may execute from
    #[arg(long = "allow-root")]
    allow_roots: Vec<PathBuf>,

    /// Only install INFs that mention one of these hardware ids
    #[arg(long = "hardware-id")]
    hardware_ids: Vec<String>,
}

impl TargetArgs {
    fn package_root(&self) -> PathBuf {
        self.package_root.clone().unwrap_or_else(|| manifest_dir(&self.manifest))
    }

    fn resolve_plan(&self) -> Result<Plan> {
        let manifest = Manifest::load(&self.manifest)
            .with_context(|| format!("Failed to load manifest {}", self.manifest.display()))?;

        let Some(resolution) = manifest.resolve_target(&self.model, &self.manufacturer) else {
            bail!(
                "No manifest entry matches model {:?} (manufacturer {:?})",
                self.model,
                self.manufacturer
            );
        };
        match &resolution.resolved_by {
            ResolvedBy::Alias(alias) => {
                info!(model = %resolution.model_id, alias = %alias, "Target resolved")
            }
            ResolvedBy::ManufacturerDefault(m) => info!(
                model = %resolution.model_id,
                manufacturer = %m,
                "Target resolved by manufacturer default"
            ),
        }
        if resolution.is_ambiguous() {
            eprintln!(
                "warning: model {:?} also matches {}; using {}",
                self.model,
                resolution.also_matched.join(", "),
                resolution.model_id
            );
        }

        Ok(build_plan(&manifest, &resolution.model_id, &self.package_root())?)
    }
}

fn manifest_dir(manifest: &Path) -> PathBuf {
    match manifest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "mend=debug" } else { "mend=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Start(args) => start(args, config, cli.config.as_deref()).await,
        Commands::Resume { root } => resume(&root, config, cli.config.as_deref()).await,
        Commands::Plan(target) => {
            let plan = target.resolve_plan()?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { root } => status(&root),
        Commands::Knowledge { step } => knowledge(&config, step.as_deref()),
    }
}

async fn start(
    args: StartArgs,
    mut config: Config,
    config_path: Option<&Path>,
) -> Result<ExitCode> {
    let plan = args.target.resolve_plan()?;

    config.dry_run |= args.dry_run;
    config.no_reboot |= args.no_reboot;
    config.allowed_roots.extend(args.allow_roots);
    config.allowed_roots.push(args.target.package_root());
    if !args.hardware_ids.is_empty() {
        config.hardware_ids.extend(args.hardware_ids);
        config.filter_hardware_ids = true;
    }

    let actions = CommandActions::new(config.tools.clone(), &config.timeouts);
    let scheduler = CommandResumeScheduler::new(&config.tools);
    let entry =
        EntryPoint::current_exe(config_path).context("Failed to locate the mend executable")?;

    let mut executor = Executor::create(config, plan, actions, scheduler, entry)
        .context("Failed to create run")?;
    println!("run {} at {}", executor.context().id, executor.context().root.display());
    let outcome = executor.run().await.context("Run failed")?;
    Ok(report(&outcome))
}

async fn resume(root: &Path, config: Config, config_path: Option<&Path>) -> Result<ExitCode> {
    // Tools and flags come from the run's own snapshot when it has one.
    let ctx = RunContext::open(root)?;
    let config = Config::load_for_run(&ctx)?.unwrap_or(config);
    let actions = CommandActions::new(config.tools.clone(), &config.timeouts);
    let scheduler = CommandResumeScheduler::new(&config.tools);
    let entry =
        EntryPoint::current_exe(config_path).context("Failed to locate the mend executable")?;

    let mut executor = Executor::resume(root, config, actions, scheduler, entry)
        .with_context(|| format!("Failed to reopen run {}", root.display()))?;
    let outcome = executor.run().await.context("Run failed")?;
    Ok(report(&outcome))
}

fn report(outcome: &RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Completed => {
            println!("completed");
            ExitCode::SUCCESS
        }
        RunOutcome::Halted { index, status } => {
            eprintln!("halted at step {}: {}", index, status);
            ExitCode::from(2)
        }
        RunOutcome::Rebooting { index } => {
            println!("rebooting after step {}", index);
            ExitCode::SUCCESS
        }
        RunOutcome::PausedForReboot { index } => {
            println!("paused for reboot after step {}; continue with `mend resume`", index);
            ExitCode::SUCCESS
        }
    }
}

fn status(root: &Path) -> Result<ExitCode> {
    let ctx = RunContext::open(root)?;
    let plan = Plan::load(&ctx.plan_path())?.unwrap_or_default();
    let state = RunState::open(&ctx).get_all()?;

    println!("run:   {}", ctx.id);
    println!("steps: {}", plan.len());
    println!("state: {}", serde_json::to_string(&state)?);
    match RunResult::load(&ctx)? {
        Some(result) => println!("result: {}", serde_json::to_string_pretty(&result)?),
        None => println!("result: (in progress)"),
    }
    Ok(ExitCode::SUCCESS)
}

fn knowledge(config: &Config, step: Option<&str>) -> Result<ExitCode> {
    let store = KnowledgeStore::load(&config.knowledge_path)?;
    if let Some(step) = step {
        println!("{}", serde_json::to_string_pretty(&store.counters(step))?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("runs: {}", store.runs());
    for (name, counters) in store.steps() {
        println!(
            "{:<40} success={} error={} exit={} missing={} warning={} other={}",
            name,
            counters.success,
            counters.error,
            counters.exit,
            counters.missing,
            counters.warning,
            counters.other
        );
    }
    if store.steps().next().is_none() {
        warn!(path = %store.path().display(), "No outcomes recorded yet");
    }
    Ok(ExitCode::SUCCESS)
}
