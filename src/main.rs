use clap::Parser;
use mongo_river::checkpoint::CheckpointStore;
use mongo_river::context::{RiverStatus, SharedContext};
use mongo_river::indexer::{run_indexer, CheckpointIndexer, Indexer};
use mongo_river::mongo::MongoConnector;
use mongo_river::tailer::{ChangeStreamTailerFactory, TailerHandle};
use mongo_river::{Config, ConnectionPool, Error, Result, SupervisorOutcome, TailerSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "mongo-river")]
#[command(about = "MongoDB change-feed river with per-shard tailers", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Discard saved checkpoints and tail from the current position")]
    reset_checkpoints: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting mongo-river");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(Error::Config(e.to_string()));
        }
    };

    info!(
        servers = ?config.mongodb.servers,
        is_mongos = ?config.is_mongos(),
        admin_auth_database = %config.admin_auth_database(),
        index = %config.index_name(),
        "Configuration summary"
    );

    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let store = CheckpointStore::new(&config.indexer.checkpoint_dir);
    if args.reset_checkpoints {
        reset_checkpoints(&config.indexer.checkpoint_dir).await?;
    }
    let indexer: Arc<dyn Indexer> = Arc::new(CheckpointIndexer::new(store));

    let (context, queue) = SharedContext::new(config.indexer.queue_capacity);
    let context = Arc::new(context);

    let indexer_task = tokio::spawn(run_indexer(
        queue,
        Arc::clone(&indexer),
        config.indexer.bulk_size,
        Duration::from_millis(config.indexer.flush_interval_ms),
        cancel.clone(),
    ));

    let pool = Arc::new(ConnectionPool::new(MongoConnector::new(&config)));
    let supervisor = TailerSupervisor::new(
        Arc::clone(&pool),
        Arc::clone(&config),
        Arc::clone(&context),
        Arc::clone(&indexer),
        ChangeStreamTailerFactory,
    )
    .with_cancellation(cancel.clone());

    let mut supervisor_task = tokio::spawn(supervisor.run());

    let outcome = tokio::select! {
        joined = &mut supervisor_task => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            cancel.cancel();
            supervisor_task.await
        }
    };

    let (tailers, result) = settle(outcome);

    if !tailers.is_empty() && !cancel.is_cancelled() {
        info!(tailers = tailers.len(), "River running, press Ctrl+C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown requested");
    }

    context.set_status(RiverStatus::Stopped);
    cancel.cancel();
    for tailer in &tailers {
        tailer.abort();
    }
    if let Err(e) = indexer_task.await {
        warn!(error = %e, "Indexer task ended abnormally");
    }
    pool.close_all().await;

    info!("mongo-river stopped");
    result
}

/// Splits the supervisor's outcome into the started tailers and the
/// process result.
fn settle(
    outcome: std::result::Result<SupervisorOutcome, JoinError>,
) -> (Vec<TailerHandle>, Result<()>) {
    match outcome {
        Ok(SupervisorOutcome::Started(handles)) => (handles, Ok(())),
        Ok(SupervisorOutcome::Interrupted) => (Vec::new(), Ok(())),
        Ok(SupervisorOutcome::Failed(e)) => {
            error!(error = %e, "River failed to start");
            (Vec::new(), Err(e))
        }
        Ok(SupervisorOutcome::RetriesExhausted { attempts, last_error }) => {
            error!(attempts, error = %last_error, "River failed to start");
            (Vec::new(), Err(last_error))
        }
        Err(e) => {
            error!(error = %e, "Supervisor task panicked");
            (Vec::new(), Err(Error::Task(format!("supervisor: {}", e))))
        }
    }
}

async fn reset_checkpoints(dir: &std::path::Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
        info!("Removed checkpoint directory {:?}", dir);
    }
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("mongo_river=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mongo_river=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
