//! # Jobqueue E2E
//!
//! Demo binary. Configuration comes from `./config` and `JOBQUEUE_*`
//! environment variables, see `config/default.toml`.

use jobqueue_config::{AppConfig, ConfigLoader, LoggingConfig, StoreKind};
use jobqueue_core::{Manager, MemoryStore, StatsRequest, Store};
use jobqueue_e2e::driver;
use jobqueue_mysql::{create_pool, MySqlStore};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ConfigLoader::from_default_location() {
        Ok(loader) => loader.get().await,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.logging);

    info!("Starting jobqueue demo...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("Demo failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Exiting");
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    info!(
        environment = %config.app.environment,
        store = %config.store.kind,
        ranks = config.demo.ranks,
        concurrency = config.demo.concurrency,
        topics = ?config.demo.topics,
        "Configuration loaded"
    );

    let store: Arc<dyn Store> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Mysql => Arc::new(MySqlStore::new(
            create_pool(&config.store.database).await?,
        )),
    };

    // Every demo rank gets the demo concurrency unless the manager section
    // sets that rank explicitly.
    let mut manager_config = config.manager.clone();
    for rank in 0..config.demo.ranks {
        manager_config
            .rank_concurrency
            .entry(rank)
            .or_insert(config.demo.concurrency);
    }

    let manager = Manager::builder()
        .shared_store(store)
        .config(manager_config)
        .build()?;
    driver::register_processors(&manager, &config.demo)?;
    manager.start().await?;

    let cancel = CancellationToken::new();
    let mut producer = tokio::spawn(driver::enqueue(
        manager.clone(),
        config.demo.clone(),
        cancel.clone(),
    ));
    let logger = tokio::spawn(driver::log_stats(
        manager.clone(),
        config.demo.log_interval(),
        cancel.clone(),
    ));

    let produced = tokio::select! {
        () = shutdown_signal() => None,
        joined = &mut producer => Some(joined),
    };

    cancel.cancel();
    let produced = match produced {
        Some(joined) => joined?,
        None => producer.await?,
    };
    let closed = manager.shutdown().await;
    logger.await?;

    let stats = manager.stats(&StatsRequest::default()).await?;
    info!("{}", driver::format_stats(&stats));

    let added = produced?;
    closed?;
    info!(added, "Demo finished");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
