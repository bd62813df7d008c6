//! `rigger-worker`: runs provisioning chains for pending hosts, work
//! attempts and queued scripts.

use std::sync::Arc;

use anyhow::Context;
use rigger_core::scripting::executor::ScriptExecutor;
use rigger_core::scripting::shell::ShellExecutor;
use rigger_events::{EventBus, WebhookRelay};
use rigger_pipeline::pg::PgStore;
use rigger_pipeline::store::{EntityStore, ExecutionStore};
use rigger_pipeline::ChainRunner;
use rigger_worker::config::WorkerConfig;
use rigger_worker::dispatcher::ChainDispatcher;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let pool = rigger_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    rigger_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    rigger_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let bus = Arc::new(EventBus::default());
    if let Some(url) = &config.change_webhook_url {
        let relay = WebhookRelay::new(url.clone()).context("Failed to build change relay")?;
        tokio::spawn(relay.run(bus.subscribe()));
    }

    let store = Arc::new(PgStore::new(pool.clone()));
    let entities: Arc<dyn EntityStore> = Arc::clone(&store) as Arc<dyn EntityStore>;
    let records: Arc<dyn ExecutionStore> = store;
    let executor: Arc<dyn ScriptExecutor> = Arc::new(ShellExecutor::new(config.ssh.clone()));
    let runner = ChainRunner::new(entities, records, executor, bus, config.chain_settings());
    let dispatcher = ChainDispatcher::new(pool, runner, config.max_concurrent_chains)
        .with_poll_interval(config.poll_interval);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    dispatcher.run(cancel).await;
    Ok(())
}

/// `RUST_LOG` filter, human-readable output unless `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rigger_worker=debug,rigger_pipeline=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping worker");
}
