use std::path::Path;
use std::sync::Arc;

use job_pool::cleanup::cleanup_task;
use job_pool::config::PoolConfig;
use job_pool::pool::Pool;
use job_pool::store::{JobStore, LibSqlBackend};

#[tokio::main]
async fn main() -> job_pool::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PoolConfig::from_env()?;

    eprintln!("Job Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   Retention: {:?}", config.retention);
    eprintln!("   Press Ctrl-C to stop.\n");

    // ── Database ─────────────────────────────────────────────────────────
    let backend = if config.database_path == Path::new(":memory:") {
        LibSqlBackend::new_memory().await
    } else {
        LibSqlBackend::new_local(&config.database_path).await
    };
    let store: Arc<dyn JobStore> = Arc::new(backend?);

    // ── Pool ─────────────────────────────────────────────────────────────
    let mut pool = Pool::new(Arc::clone(&store), config.clone());
    pool.add(cleanup_task(store, config.cleanup_interval, config.retention))?;
    let running = pool.run()?;

    tokio::signal::ctrl_c().await?;
    running.close().await;

    Ok(())
}
