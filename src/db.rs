// src/db.rs

use std::time::Duration;

use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::info;
use tokio_postgres::{Config, NoTls};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Connection settings of the snapshot database, read from `POSTGRES_*`.
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
}

impl DbSettings {
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        Self {
            host: var("POSTGRES_HOST", "127.0.0.1"),
            port: var("POSTGRES_PORT", "5432").parse().unwrap_or(5432),
            dbname: var("POSTGRES_DB", "learning_analytics"),
            user: var("POSTGRES_USER", "postgres"),
            password: var("POSTGRES_PASSWORD", ""),
            pool_size: var("POSTGRES_POOL_SIZE", "8").parse().unwrap_or(8),
        }
    }

    fn pg_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .password(&self.password)
            .application_name("pathwise")
            .connect_timeout(Duration::from_secs(10));
        config
    }
}

/// Builds the pool and checks one connection with a trivial query.
pub async fn connect() -> Result<PgPool> {
    let settings = DbSettings::from_env();
    info!(
        "Connecting to PostgreSQL {}@{}:{}/{} (pool of {})",
        settings.user, settings.host, settings.port, settings.dbname, settings.pool_size
    );
    let manager = PostgresConnectionManager::new(settings.pg_config(), NoTls);
    let pool = Pool::builder()
        .max_size(settings.pool_size.max(1))
        .min_idle(Some(1))
        .idle_timeout(Some(Duration::from_secs(180)))
        .connection_timeout(Duration::from_secs(15))
        .build(manager)
        .await
        .context("Failed to build database connection pool")?;

    {
        let conn = pool
            .get()
            .await
            .context("Failed to get test connection from pool")?;
        conn.query_one("SELECT 1", &[])
            .await
            .context("Test query 'SELECT 1' failed")?;
    }
    info!("Database pool ready");
    Ok(pool)
}
