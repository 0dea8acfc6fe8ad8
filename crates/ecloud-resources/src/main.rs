// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! eCloud worker
//!
//! Runs the job chain queue: claims due steps, calls NSX and Kingpin, and
//! completes or fails units of work. Several workers may share one database;
//! set `ECLOUD_REDIS_URL` so they also share resource locks.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use ecloud_core::config::Config;
use ecloud_core::lock::{InMemoryLockManager, LockManager, RedisLockManager};
use ecloud_core::migrations;
use ecloud_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use ecloud_core::runtime::EngineRuntime;
use ecloud_remote::RemoteConfig;
use ecloud_resources::Remotes;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    init_tracing()?;

    info!("Starting eCloud worker");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let remote = RemoteConfig::from_env().map_err(|e| {
        error!("Remote configuration error: {}", e);
        e
    })?;

    info!(
        workers = config.worker_count,
        poll_interval_ms = u64::try_from(config.worker.poll_interval.as_millis())
            .unwrap_or(u64::MAX),
        redis = config.redis_url.is_some(),
        nsx = %remote.nsx.base_url,
        kingpin = %remote.kingpin.base_url,
        "Configuration loaded"
    );

    let persistence = connect(&config.database_url).await?;

    let locks: Arc<dyn LockManager> = match &config.redis_url {
        Some(url) => {
            info!("Using Redis resource locks");
            Arc::new(RedisLockManager::connect(url).await?)
        }
        None => {
            info!("ECLOUD_REDIS_URL not set, using in-process resource locks");
            Arc::new(InMemoryLockManager::new())
        }
    };

    let (nsx, kingpin) = ecloud_remote::clients(&remote)?;
    let remotes = Remotes { nsx, kingpin };

    let runtime = EngineRuntime::builder()
        .config(&config)
        .persistence(persistence)
        .locks(locks)
        .steps(ecloud_resources::steps(&remotes))
        .chains(ecloud_resources::chains())
        .hooks(ecloud_resources::hooks())
        .start()
        .await?;

    info!("eCloud worker initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

/// `RUST_LOG` filtering; `ECLOUD_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("ecloud_core=info".parse()?)
        .add_directive("ecloud_resources=info".parse()?);

    let json = std::env::var("ECLOUD_LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Open the database named by `url` and bring its schema up to date.
async fn connect(url: &str) -> Result<Arc<dyn Persistence>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
        info!(result = row.0, "Database health check passed");

        info!("Running database migrations...");
        migrations::run_postgres(&pool).await?;
        info!("Migrations completed");

        Ok(Arc::new(PostgresPersistence::new(pool)))
    } else if let Some(path) = url.strip_prefix("sqlite://").or(url.strip_prefix("sqlite:")) {
        info!(path, "Opening SQLite database");
        Ok(Arc::new(SqlitePersistence::from_path(path).await?))
    } else {
        anyhow::bail!("ECLOUD_DATABASE_URL must be a postgres:// or sqlite: URL")
    }
}
