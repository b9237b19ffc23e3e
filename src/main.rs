//! ecsprov CLI entrypoint.
//!
//! This is the main entrypoint for the ecsprov command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ecs_provision::cli::{Cli, Commands, OutputFormatter, StateCommands, exit};
use ecs_provision::config::{
    ConfigParser, ConfigValidator, DesiredDocument, StateBackend, find_config_file,
};
use ecs_provision::error::{ProvisionError, Result};
use ecs_provision::graph::GraphBuilder;
use ecs_provision::planner::{ProvisionPlan, cancel_pair};
use ecs_provision::provider::SimulatedProvider;
use ecs_provision::reconciler::Reconciler;
use ecs_provision::state::{
    LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id,
};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// File holding the simulated provider's inventory.
const SANDBOX_FILE: &str = "sandbox.json";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings),
        Commands::Graph => cmd_graph(config, &formatter).await,
        Commands::Plan { detailed } => cmd_plan(config, cli.concurrency, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config, cli.concurrency, yes, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, cli.concurrency, yes, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing new ecsprov project in: {}", path.display());

    let config_path = path.join("ecsprov.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Document already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/ecsprov.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let ignored = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ignored.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# ecsprov")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{ignored}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit ecsprov.yaml with your resources");
    eprintln!("  2. Run 'ecsprov validate' to check the document");
    eprintln!("  3. Run 'ecsprov plan' to see what will be provisioned");
    eprintln!("  4. Run 'ecsprov apply' to provision it");

    Ok(ExitCode::SUCCESS)
}

/// Validate the document.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating document: {}", config_file.display());

    let document = load_document(&config_file)?;
    let result = ConfigValidator::new().check(&document);

    if !result.is_valid() {
        eprintln!("Document is invalid:");
        for error in &result.errors {
            eprintln!("  - {error}");
        }
        return Ok(ExitCode::FAILURE);
    }

    // References and cycles are only known once the graph is built.
    let graph = GraphBuilder::new().build(&document)?;

    eprintln!("Document is valid!");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nDocument summary:");
    eprintln!("  Project: {}", document.project.name);
    eprintln!("  Environment: {}", document.project.environment);
    eprintln!("  Resources: {}", graph.len());
    eprintln!("  Ranks: {}", graph.batches().len());

    Ok(ExitCode::SUCCESS)
}

/// Show the resource graph.
async fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let ctx = Context::load(config_path, None).await?;
    let graph = ctx.reconciler().graph()?;
    println!("{}", formatter.format_graph(&graph));
    Ok(ExitCode::SUCCESS)
}

/// Show the provisioning plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    concurrency: Option<usize>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let ctx = Context::load(config_path, concurrency).await?;
    let plan = ctx.reconciler().plan().await?;

    println!("{}", formatter.format_plan(&plan, detailed));

    Ok(ExitCode::from(exit::plan_status(&plan)))
}

/// Apply the provisioning plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    concurrency: Option<usize>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let ctx = Context::load(config_path, concurrency).await?;
    let (handle, signal) = cancel_pair();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight actions");
            handle.cancel();
        }
    });

    let reconciler = ctx.reconciler().with_cancel(signal);
    let result = reconciler
        .apply(|plan| confirm(plan, formatter, auto_approve, "Do you want to apply this plan? [y/N]: ", "y"))
        .await;
    ctrl_c.abort();
    let result = result?;

    println!("{}", formatter.format_apply(&result));
    Ok(ExitCode::from(exit::apply_status(&result)))
}

/// Destroy every applied resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    concurrency: Option<usize>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let ctx = Context::load(config_path, concurrency).await?;
    let (handle, signal) = cancel_pair();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let reconciler = ctx.reconciler().with_cancel(signal);
    let result = reconciler
        .destroy(|plan| {
            confirm(
                plan,
                formatter,
                auto_approve,
                "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
                "destroy",
            )
        })
        .await;
    ctrl_c.abort();
    let result = result?;

    println!("{}", formatter.format_apply(&result));
    Ok(ExitCode::from(exit::apply_status(&result)))
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let ctx = Context::load(config_path, None).await?;
    let report = ctx.reconciler().check_drift().await?;

    println!("{}", formatter.format_drift(&report));
    Ok(ExitCode::from(exit::drift_status(&report)))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let ctx = Context::load(config_path, None).await?;
    let store = &ctx.state_store;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                println!("{}", formatter.format_state(&state));
            } else {
                eprintln!(
                    "No state found at {} ({} backend).",
                    store.location(),
                    store.backend_type()
                );
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            eprintln!("State locked: {lock}");
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command needs: the document, its state backend and the
/// provider.
struct Context {
    document: DesiredDocument,
    state_store: Box<dyn StateStore>,
    provider: SimulatedProvider,
    concurrency: Option<usize>,
}

impl Context {
    /// Loads the document and creates the state store and provider.
    async fn load(config_path: Option<&Path>, concurrency: Option<usize>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading document from: {}", config_file.display());

        let document = load_document(&config_file)?;
        let base_dir = config_file.parent().unwrap_or_else(|| Path::new("."));

        let state_store: Box<dyn StateStore> = match document.state.backend {
            StateBackend::Local => {
                let path = document
                    .state
                    .path
                    .as_ref()
                    .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
                Box::new(LocalStateStore::with_base_dir(path))
            }
            StateBackend::S3 => {
                let bucket = document
                    .state
                    .bucket
                    .as_deref()
                    .ok_or_else(|| ProvisionError::internal("S3 bucket not configured"))?;
                let prefix = document.state.prefix.as_deref();
                let region = document.state.region.as_deref();
                Box::new(S3StateStore::new(bucket, prefix, region).await?)
            }
        };

        let mut provider = SimulatedProvider::open(base_dir.join(STATE_DIR).join(SANDBOX_FILE))?;
        if let Some(region) = &document.project.region {
            provider = provider.with_region(region.clone());
        }

        Ok(Self {
            document,
            state_store,
            provider,
            concurrency,
        })
    }

    fn reconciler(&self) -> Reconciler<'_, Box<dyn StateStore>> {
        let reconciler = Reconciler::new(&self.document, &self.state_store, &self.provider);
        match self.concurrency {
            Some(concurrency) => reconciler.with_concurrency(concurrency.max(1)),
            None => reconciler,
        }
    }
}

/// Resolves the document path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads `.env`, then the document with environment overrides.
fn load_document(config_file: &Path) -> Result<DesiredDocument> {
    let parser = ConfigParser::new()
        .with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")));
    parser.load_dotenv()?;
    parser.load_with_env(config_file)
}

/// Shows the plan and asks for confirmation unless `auto_approve` is set.
fn confirm(
    plan: &ProvisionPlan,
    formatter: &OutputFormatter,
    auto_approve: bool,
    prompt: &str,
    expected: &str,
) -> bool {
    eprintln!("{}", formatter.format_plan(plan, false));
    if auto_approve {
        return true;
    }

    eprint!("{prompt}");
    if std::io::stderr().flush().is_err() {
        return false;
    }
    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case(expected)
}
