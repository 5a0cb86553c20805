use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcp_deep_research::{
    config::{Config, LogFormat},
    langbase::LangbaseClient,
    queue::{JobQueue, QueueWorker, SqliteJobQueue},
    research::{
        pipes::provision_pipes, BackendRegistry, ExecutionMode, InlineExecutor,
        IterationJobProcessor, PipeAgents, QueuedExecutor, ResearchEngine, ResearchService,
        RunExecutor, RunGuard, ITERATION_JOB,
    },
    server::{AppState, McpServer},
    storage::{SqliteStorage, Storage},
};

#[derive(Parser)]
#[command(name = "mcp-deep-research")]
#[command(about = "MCP server for autonomous deep research over Langbase Pipes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP over stdio (default)
    Serve,
    /// Process queued research iterations until Ctrl-C
    Worker {
        /// Concurrent jobs; defaults to QUEUE_WORKER_CONCURRENCY
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

/// Everything both commands need.
struct Components {
    config: Config,
    storage: SqliteStorage,
    guard: RunGuard,
    engine: Arc<ResearchEngine>,
    queue: Arc<dyn JobQueue>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        execution_mode = %config.research.execution_mode,
        "MCP Deep Research starting..."
    );

    let components = build_components(config).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(components).await,
        Commands::Worker { concurrency } => work(components, concurrency).await,
    }
}

async fn build_components(config: Config) -> anyhow::Result<Components> {
    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };
    let shared: Arc<dyn Storage> = Arc::new(storage.clone());

    // Initialize Langbase client
    let langbase = match LangbaseClient::new(&config.langbase, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.langbase.base_url, "Langbase client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize Langbase client");
            return Err(e.into());
        }
    };

    info!("Ensuring research pipes exist...");
    if let Err(e) = provision_pipes(&langbase, &config.pipes).await {
        error!(error = %e, "Failed to provision research pipes");
        return Err(e.into());
    }

    let agents = PipeAgents::new(langbase.clone(), shared.clone(), config.pipes.clone());
    let backends = BackendRegistry::from_pipes(&config.pipes, langbase, shared.clone());
    let engine = Arc::new(ResearchEngine::new(
        shared.clone(),
        Arc::new(agents),
        backends,
        config.research.clone(),
    ));
    let guard = RunGuard::from_config(shared, &config.research);
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(storage.pool().clone()));

    Ok(Components {
        config,
        storage,
        guard,
        engine,
        queue,
    })
}

async fn spawn_workers(
    components: &Components,
    concurrency: Option<usize>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let processor = Arc::new(IterationJobProcessor::new(
        components.engine.clone(),
        components.guard.clone(),
        components.queue.clone(),
    ));
    let mut worker = QueueWorker::new(
        components.queue.clone(),
        processor,
        ITERATION_JOB,
        &components.config.queue,
    );
    if let Some(n) = concurrency {
        worker = worker.with_concurrency(n);
    }
    worker.spawn(shutdown).await
}

async fn serve(components: Components) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mode = components.config.research.execution_mode;

    let executor: Arc<dyn RunExecutor> = match mode {
        ExecutionMode::Inline => Arc::new(InlineExecutor::new(
            components.engine.clone(),
            components.guard.clone(),
        )),
        ExecutionMode::Queue => Arc::new(QueuedExecutor::new(
            components.queue.clone(),
            components.guard.clone(),
            Arc::new(components.storage.clone()),
        )),
    };

    let service = Arc::new(ResearchService::new(
        Arc::new(components.storage.clone()),
        components.guard.clone(),
        executor,
        components.config.research.clone(),
    ));

    match service.recover_orphaned_runs().await {
        Ok(0) => {}
        Ok(n) => warn!(runs = n, "Marked runs interrupted by restart as failed"),
        Err(e) => error!(error = %e, "Failed to recover orphaned runs"),
    }

    let workers = if mode == ExecutionMode::Queue && components.config.queue.embedded_workers {
        spawn_workers(&components, None, shutdown_rx).await
    } else {
        Vec::new()
    };

    // Create application state
    let state = Arc::new(AppState::new(
        components.config,
        components.storage,
        service,
    ));

    // Start MCP server
    let server = McpServer::new(state);

    info!("Server ready, waiting for requests on stdin...");

    let result = server.run().await;

    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Queue worker ended abnormally");
        }
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn work(components: Components, concurrency: Option<usize>) -> anyhow::Result<()> {
    if components.config.research.execution_mode != ExecutionMode::Queue {
        warn!("EXECUTION_MODE is not 'queue'; servers will not enqueue work for this worker");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&components, concurrency, shutdown_rx).await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing in-flight jobs...");
    let _ = shutdown_tx.send(true);

    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Queue worker ended abnormally");
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
