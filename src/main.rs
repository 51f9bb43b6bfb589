mod config;
mod db;
mod dispatch;
mod fetch;
mod job;
mod router;
mod service;

use clap::{CommandFactory, error::ErrorKind};
use color_eyre::eyre::WrapErr;
use tracing_subscriber::EnvFilter;

use db::JobStore;
use dispatch::Dispatcher;
use router::create_router;
use service::JobService;

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    let config = config::config();
    init_tracing(config.debug);

    if let Err(e) = config.validate() {
        config::Config::command()
            .error(ErrorKind::ValueValidation, e)
            .exit();
    }
    tracing::info!("Downloads directory: {}", config.downloads_path.display());

    let store = JobStore::connect(&config.db_config)
        .await
        .wrap_err("Failed to connect to job store")?;

    let workers = &config.worker_config;
    let fetcher = workers
        .fetcher()
        .wrap_err("Failed to set up fetch engine")?;
    tracing::info!(engine = ?workers.engine, workers = workers.workers, "Starting fetch workers");
    let dispatcher = Dispatcher::start(
        store.clone(),
        fetcher,
        workers.workers,
        config.downloads_path.clone(),
    );

    let service = JobService::new(
        store,
        dispatcher.clone(),
        config.downloads_path.clone(),
        workers.restart_delay(),
    );
    let app = create_router(service);

    let listener = tokio::net::TcpListener::bind((config.listen_host.as_str(), config.listen_port))
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to bind {}:{}",
                config.listen_host, config.listen_port
            )
        })?;
    tracing::info!("Listening on: {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown();
    Ok(())
}
