//! Database initialization.
//!
//! Creates the target database if absent and applies the wave-db
//! migrations. `DATABASE_URL` selects the target; when it is unset the
//! pipeline runs with the in-memory checkpointer instead, and this
//! command says so rather than touching the default database.

use std::io::Write;

use anyhow::{Result, bail};

use wave_db::config::DbConfig;
use wave_db::pool;

pub async fn run() -> Result<()> {
    let config = DbConfig::from_env();
    if !config.is_configured() {
        bail!(
            "DATABASE_URL is not set; the pipeline falls back to in-memory checkpointing. \
             Set DATABASE_URL to initialize a persistent store."
        );
    }

    pool::ensure_database_exists(&config).await?;
    let db_pool = pool::create_pool(&config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;

    let mut out = std::io::stdout();
    writeln!(
        out,
        "database ready at {} (migrations applied)",
        config.database_url
    )?;
    Ok(())
}
