//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use converge::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use converge::config::{
    find_config_file, ConfigParser, ConfigValidator, DesiredStateDocument, ProviderKind, StateBackend,
};
use converge::error::{ConfigError, ConvergeError, Result};
use converge::graph::GraphBuilder;
use converge::provider::{EchoProvider, HttpProvider, Provider};
use converge::reconciler::{Reconciler, RunStatus};
use converge::source::FileSource;
use converge::state::{LocalStateStore, MemoryStateStore, StateStore, STATE_DIR};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

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

/// Initializes the logging system. `RUST_LOG` takes precedence over
/// `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config, yes, &formatter).await,
        Commands::Reconcile { watch, interval } => cmd_reconcile(config, watch, interval, &formatter).await,
        Commands::Status => cmd_status(config, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Validate the desired-state document.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config_file, document) = load_document(config_path)?;
    info!("Validating desired state: {}", config_file.display());

    let result = ConfigValidator::new().check(&document);
    println!("{}", formatter.format_validation(&result, show_warnings));

    if result.is_valid() {
        eprintln!("  Project: {}", document.qualified_name());
        eprintln!("  Resources: {}", document.resources.len());
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Print the dependency graph.
fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (_, document) = load_validated(config_path)?;
    let graph = GraphBuilder::new().build(document.resources)?;
    println!("{}", formatter.format_graph(&graph));
    Ok(ExitCode::SUCCESS)
}

/// Show the change-set.
async fn cmd_plan(config_path: Option<&Path>, detailed: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let reconciler = build_reconciler(config_path)?;
    let plan = reconciler.plan().await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(ExitCode::SUCCESS)
}

/// Apply the change-set once.
async fn cmd_apply(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let reconciler = build_reconciler(config_path)?;
    let plan = reconciler.plan().await?;

    if plan.is_empty() {
        println!("{}", formatter.success("No changes to apply."));
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", formatter.format_plan(&plan, false));

    if !auto_approve {
        eprint!("Do you want to apply this change-set? [y/N]: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let run = reconciler.apply_confirmed(&plan).await?;
    println!("{}", formatter.format_run(&run));
    Ok(exit_code(run.status))
}

/// Reconcile once, or keep reconciling until interrupted.
async fn cmd_reconcile(
    config_path: Option<&Path>,
    watch: bool,
    interval: Option<u64>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let reconciler = Arc::new(build_reconciler(config_path)?);

    if !watch {
        let run = reconciler.run_once().await?;
        println!("{}", formatter.format_run(&run));
        return Ok(exit_code(run.status));
    }

    let interval = interval.map_or_else(|| reconciler.settings().interval(), Duration::from_secs);
    let handle = reconciler.start(interval);
    eprintln!("Reconciling every {}s. Press Ctrl-C to stop.", interval.as_secs());

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping after in-flight operations settle");
    handle.stop().await?;

    let status = reconciler.status().await;
    match status.last_run {
        Some(run) => {
            println!("{}", formatter.format_run(&run));
            Ok(exit_code(run.status))
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

/// Show recorded resources and the last run.
async fn cmd_status(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config_file, document) = load_validated(config_path)?;
    let store = create_state_store(&config_file, &document);

    let state = store
        .load()
        .await?
        .unwrap_or_else(|| converge::state::ObservedState::new(&document.project.name));
    let lock = store.get_lock_info().await?;

    println!("{}", formatter.format_status(&state, lock.as_ref()));
    Ok(ExitCode::SUCCESS)
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let reconciler = build_reconciler(config_path)?;
    let report = reconciler.check_drift().await?;
    println!("{}", formatter.format_drift(&report));

    if report.is_converged() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config_file, document) = load_validated(config_path)?;
    let store = create_state_store(&config_file, &document);

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                println!("{}", formatter.format_state(&state));
            } else {
                println!("{}", formatter.warning("No state found."));
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or_default()).await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    store.release_lock(&lock.lock_id).await?;
                    println!("{}", formatter.success("State forcefully unlocked."));
                } else {
                    println!("{}", formatter.warning("State is not locked."));
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                println!("{}", formatter.success("State unlocked."));
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

/// Maps a run status onto a process exit code.
fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Converged => ExitCode::SUCCESS,
        RunStatus::PartialFailure | RunStatus::Cancelled => ExitCode::from(2),
        RunStatus::Failed => ExitCode::FAILURE,
    }
}

/// Resolves the document path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Returns the directory holding the document.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads `.env` and the document, with environment overrides applied.
fn load_document(config_path: Option<&Path>) -> Result<(PathBuf, DesiredStateDocument)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading desired state from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let document = parser.load_with_env(&config_file)?;

    Ok((config_file, document))
}

/// Loads the document and rejects it if validation fails.
fn load_validated(config_path: Option<&Path>) -> Result<(PathBuf, DesiredStateDocument)> {
    let (config_file, document) = load_document(config_path)?;
    let result = ConfigValidator::new().validate(&document)?;
    for warning in &result.warnings {
        debug!("Validation warning: {warning}");
    }
    Ok((config_file, document))
}

/// Wires source, provider and store for the document.
fn build_reconciler(config_path: Option<&Path>) -> Result<Reconciler> {
    let (config_file, document) = load_validated(config_path)?;
    let provider = create_provider(&document)?;
    let store = create_state_store(&config_file, &document);

    Ok(Reconciler::new(
        Arc::new(FileSource::new(&config_file)),
        provider,
        store,
        document.engine.clone(),
    )
    .with_project(document.project.name))
}

/// Creates the configured provider.
fn create_provider(document: &DesiredStateDocument) -> Result<Arc<dyn Provider>> {
    match document.provider.kind {
        ProviderKind::Echo => Ok(Arc::new(EchoProvider)),
        ProviderKind::Http => {
            let url = document.provider.url.as_deref().ok_or_else(|| {
                ConvergeError::Config(ConfigError::validation(
                    "The http provider requires a URL",
                    "provider.url",
                ))
            })?;
            Ok(Arc::new(HttpProvider::from_env(url, document.provider.timeout_secs)?))
        }
    }
}

/// Creates the configured state store.
fn create_state_store(config_file: &Path, document: &DesiredStateDocument) -> Arc<dyn StateStore> {
    match document.state.backend {
        StateBackend::Local => {
            let path = document
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(STATE_DIR), PathBuf::from);
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
    }
}
