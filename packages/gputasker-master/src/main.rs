use std::sync::Arc;

use gputasker_master::config::MasterConfig;
use gputasker_master::notify::Notifier;
use gputasker_master::report_api;
use gputasker_master::scheduler;
use gputasker_master::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = MasterConfig::from_env();

    log::info!("🚀 GPUTasker Master v{} starting", env!("CARGO_PKG_VERSION"));
    log::info!("  🌐 HTTP: {}", config.bind_addr);
    log::info!("  🗄️  Store: {}", config.db_path.display());
    log::info!("  📂 Run logs: {}", config.running_log_dir.display());

    std::fs::create_dir_all(&config.running_log_dir)?;

    let store = Arc::new(Store::open(&config.db_path)?);
    let notifier = Notifier::new();

    let router = report_api::create_router(store.clone());
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    let http_server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            log::error!("HTTP server error: {}", err);
        }
    });

    let driver_store = store.clone();
    let driver = tokio::spawn(async move {
        scheduler::run(driver_store, notifier).await;
    });

    log::info!("📡 Listening for agent reports...");

    tokio::select! {
        _ = http_server => log::error!("HTTP server stopped"),
        _ = driver => log::error!("scheduler stopped"),
        _ = tokio::signal::ctrl_c() => log::info!("interrupted, shutting down"),
    }

    Ok(())
}
