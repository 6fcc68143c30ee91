//! Mender CLI
//!
//! Usage:
//!   mender plan "Log in as demo" --markup login.html -o login.yaml
//!   mender plan "Log in as demo" -o login.yaml          # live page via the extension bridge
//!   mender validate login.yaml --markup login.html
//!   mender run login.yaml                               # execute with healing, write back repairs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mender::llm::{self, UsageTracker};
use mender::logging::init_logging;
use mender::markup::{MarkupExtractor, PageMarkup, StaticMarkup};
use mender::{
    ArtifactStore, BridgePage, Decomposer, ExtensionBridge, Healer, Instruction, LanguageModel,
    MenderConfig, PageSnapshot, Subtask, Task, Validator, YamlArtifactStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mender")]
#[command(about = "Self-healing browser automation from natural-language instructions")]
struct Cli {
    /// Configuration file (YAML)
    #[clap(long, short = 'c', global = true, env = "MENDER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    /// What the automation should do
    instruction: String,

    /// Acceptance criterion; repeat for several
    #[clap(long = "criterion")]
    criteria: Vec<String>,

    /// Saved page markup to plan against instead of the live page
    #[clap(long, short = 'm')]
    markup: Option<PathBuf>,

    /// Artifact to write; prints YAML to stdout when omitted
    #[clap(long, short = 'o')]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Artifact holding the commands
    artifact: PathBuf,

    /// Saved page markup to validate against
    #[clap(long, short = 'm')]
    markup: PathBuf,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Artifact holding the commands
    artifact: PathBuf,

    /// Keep healed commands out of the artifact
    #[clap(long)]
    no_write_back: bool,

    /// Overrides healing.max_attempts
    #[clap(long)]
    max_attempts: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Turn an instruction into a command artifact
    Plan(PlanArgs),
    /// Statically check an artifact against saved markup
    Validate(ValidateArgs),
    /// Execute an artifact on the live page, healing failed commands
    Run(RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging().context("Failed to initialize logging")?;

    let config = MenderConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Plan(args) => plan(&config, args).await,
        Commands::Validate(args) => validate(&config, args).await,
        Commands::Run(args) => run(&config, args).await,
    }
}

fn build_model(config: &MenderConfig) -> Result<Arc<UsageTracker>> {
    let model = llm::from_config(&config.model).context("Failed to set up the language model")?;
    info!(model = %model.name(), "Language model ready");
    Ok(Arc::new(UsageTracker::new(model)))
}

async fn connect_bridge(config: &MenderConfig) -> Result<Arc<BridgePage>> {
    let bridge = ExtensionBridge::start(&config.bridge.listen)
        .await
        .with_context(|| format!("Failed to start extension bridge on {}", config.bridge.listen))?;
    info!(
        "Waiting up to {:?} for the browser extension on {}",
        config.bridge.connect_timeout,
        bridge.local_addr()
    );
    if !bridge.wait_for_client(config.bridge.connect_timeout).await {
        bail!(
            "No browser extension connected to {} within {:?}",
            bridge.local_addr(),
            config.bridge.connect_timeout
        );
    }
    Ok(Arc::new(BridgePage::new(Arc::new(bridge))))
}

fn read_markup(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read markup file {}", path.display()))
}

async fn plan(config: &MenderConfig, args: PlanArgs) -> Result<()> {
    let model = build_model(config)?;
    let extractor: Arc<dyn MarkupExtractor> = match &args.markup {
        Some(path) => Arc::new(StaticMarkup::new(read_markup(path)?)),
        None => Arc::new(PageMarkup::new(connect_bridge(config).await?)),
    };

    let instruction = Instruction::new(args.instruction).with_criteria(args.criteria);
    let unit = Decomposer::from_config(model.clone(), extractor, config)
        .decompose(&instruction)
        .await;

    let unverified = unit.commands.iter().filter(|c| c.unverified).count();
    if unverified > 0 {
        warn!("{} command(s) could not be verified against the page", unverified);
    }

    match &args.output {
        Some(path) => {
            YamlArtifactStore::new()
                .write(path, &unit.commands)
                .await
                .with_context(|| format!("Failed to write artifact {}", path.display()))?;
            println!("Wrote {} command(s) to {}", unit.commands.len(), path.display());
        }
        None => {
            let yaml = serde_yaml::to_string(&unit.commands).context("Failed to render commands")?;
            print!("{yaml}");
        }
    }
    info!(usage = ?model.report(), "Model usage");
    Ok(())
}

async fn validate(config: &MenderConfig, args: ValidateArgs) -> Result<()> {
    let commands = YamlArtifactStore::new()
        .read(&args.artifact)
        .await
        .with_context(|| format!("Failed to read artifact {}", args.artifact.display()))?;
    let snapshot = PageSnapshot::new(read_markup(&args.markup)?);
    let validator = Validator::new(config.decomposition.exempt_patterns.clone());

    let mut invalid = 0;
    for (index, command) in commands.iter().enumerate() {
        let outcome = validator.validate(command, &snapshot);
        let status = match (outcome.valid, outcome.deferred, outcome.ambiguous) {
            (true, true, _) => "deferred",
            (true, false, _) => "ok",
            (false, _, true) => "ambiguous",
            (false, _, false) => "invalid",
        };
        if !outcome.valid {
            invalid += 1;
        }
        match &outcome.reason {
            Some(reason) => println!("{index:>3}  {status:<9} {}  ({reason})", command.summary()),
            None => println!("{index:>3}  {status:<9} {}", command.summary()),
        }
    }

    if invalid > 0 {
        bail!("{invalid} of {} command(s) failed validation", commands.len());
    }
    Ok(())
}

async fn run(config: &MenderConfig, args: RunArgs) -> Result<()> {
    let store = Arc::new(YamlArtifactStore::new());
    let commands = store
        .read(&args.artifact)
        .await
        .with_context(|| format!("Failed to read artifact {}", args.artifact.display()))?;
    if commands.is_empty() {
        bail!("Artifact {} holds no commands", args.artifact.display());
    }

    let model = build_model(config)?;
    let page = connect_bridge(config).await?;

    let mut healer = Healer::from_config(page, model.clone(), config);
    if let Some(max_attempts) = args.max_attempts {
        healer = healer.with_max_attempts(max_attempts);
    }
    if !args.no_write_back {
        healer = healer.with_store(store);
    }

    let name = args
        .artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let unit = Subtask::new(name.clone(), commands).from_artifact(&args.artifact, 0);
    let mut task = Task::new(name, vec![unit]);

    let summary = healer
        .run_task(&mut task)
        .await
        .context("Task aborted")?;

    for unit in &task.units {
        println!(
            "{}",
            serde_json::to_string_pretty(unit).context("Failed to render unit result")?
        );
    }
    info!(usage = ?model.report(), "Model usage");

    if !summary.succeeded() {
        bail!(
            "{} unit(s) failed, {} blocked",
            summary.failed,
            summary.blocked
        );
    }
    println!(
        "Completed with {} healed command(s) over {} healing attempt(s)",
        summary.healed_commands, summary.healing_attempts
    );
    Ok(())
}
