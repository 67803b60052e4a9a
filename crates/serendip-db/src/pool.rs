//! PostgreSQL pool setup for the mining store.
//!
//! Mining batches hold one connection for the whole commit transaction and
//! sketch runs stream a key range, so the pool stays small. An optional
//! `statement_timeout` is applied to every new connection so a runaway scan
//! is cancelled by the server even if the caller's budget already fired.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use tracing::{debug, info, warn};

use serendip_core::{Error, Result};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long to wait for a free connection.
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Server-side cap per statement. `None` keeps the server default.
    pub statement_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            statement_timeout: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl PoolConfig {
    /// Overlay environment settings on the defaults.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DB_MAX_CONNECTIONS` | `5` |
    /// | `DB_CONNECT_TIMEOUT_SECS` | `30` |
    /// | `DB_STATEMENT_TIMEOUT_MS` | unset |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<u32>("DB_MAX_CONNECTIONS") {
            config.max_connections = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("DB_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        config.statement_timeout = env_parse::<u64>("DB_STATEMENT_TIMEOUT_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        config
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    fn session_setup(&self) -> Option<String> {
        self.statement_timeout
            .map(|t| format!("SET statement_timeout = {}", t.as_millis()))
    }
}

/// Connect with [`PoolConfig::default`].
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let started = Instant::now();

    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout);
    if let Some(sql) = config.session_setup() {
        options = options.after_connect(move |conn, _meta| {
            let sql = sql.clone();
            Box::pin(async move {
                conn.execute(sql.as_str()).await?;
                Ok(())
            })
        });
    }

    let pool = options.connect(database_url).await.map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        statement_timeout_ms = config.statement_timeout.map(|t| t.as_millis() as u64),
        pool_size = pool.size(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Connected to mining store"
    );
    Ok(pool)
}

/// Emit pool occupancy; warns when every connection is checked out.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();
    debug!(
        subsystem = "db",
        component = "pool",
        pool_size = size,
        pool_idle = idle,
        "Pool occupancy"
    );
    if size > 0 && idle == 0 {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = size,
            "All pooled connections are busy"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_clamps_connections_and_sets_timeouts() {
        let config = PoolConfig::default()
            .max_connections(0)
            .connect_timeout(Duration::from_secs(5))
            .statement_timeout(Duration::from_secs(60));
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(
            config.session_setup().as_deref(),
            Some("SET statement_timeout = 60000")
        );
    }

    #[test]
    fn test_default_leaves_statement_timeout_to_server() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.session_setup().is_none());
    }
}
