//! Database connection pool: PostgreSQL via `sqlx`, SQL Server via `tiberius`.
//!
//! sqlx has no SQL Server driver, so the mssql path pools `tiberius::Client` connections
//! through a small `bb8::ManageConnection` adapter — the same shape `bb8-tiberius` uses
//! upstream, kept in-tree so the dependency list stays limited to crates the pack actually
//! exercises.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::dialect::{Dialect, PostgresDialect, SqlServerDialect};

#[cfg(feature = "mssql")]
pub mod mssql_pool {
    use async_trait::async_trait;
    use tiberius::{Client, Config};
    use tokio::net::TcpStream;
    use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

    pub type MssqlClient = Client<Compat<TcpStream>>;

    pub struct TiberiusConnectionManager {
        config: Config,
    }

    impl TiberiusConnectionManager {
        pub fn new(config: Config) -> Self {
            Self { config }
        }
    }

    #[async_trait]
    impl bb8::ManageConnection for TiberiusConnectionManager {
        type Connection = MssqlClient;
        type Error = tiberius::error::Error;

        async fn connect(&self) -> Result<Self::Connection, Self::Error> {
            let tcp = TcpStream::connect(self.config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Client::connect(self.config.clone(), tcp.compat_write()).await
        }

        async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
            conn.simple_query("SELECT 1").await?.into_results().await?;
            Ok(())
        }

        fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
            false
        }
    }
}

#[cfg(feature = "mssql")]
pub type MssqlPool = bb8::Pool<mssql_pool::TiberiusConnectionManager>;

/// A connected pool, tagged by backend. `Clone` is cheap (inner handles are reference counted).
#[derive(Clone)]
pub enum DbPool {
    Postgres(sqlx::PgPool),
    #[cfg(feature = "mssql")]
    Mssql(Arc<MssqlPool>),
}

impl DbPool {
    pub fn dialect(&self) -> Arc<dyn Dialect> {
        match self {
            DbPool::Postgres(_) => Arc::new(PostgresDialect),
            #[cfg(feature = "mssql")]
            DbPool::Mssql(_) => Arc::new(SqlServerDialect),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DbPool::Postgres(_) => "postgres",
            #[cfg(feature = "mssql")]
            DbPool::Mssql(_) => "mssql",
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self {
            DbPool::Postgres(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
                Ok(())
            }
            #[cfg(feature = "mssql")]
            DbPool::Mssql(pool) => {
                let mut conn = pool.get().await.context("acquiring mssql connection")?;
                conn.simple_query("SELECT 1").await?.into_results().await?;
                Ok(())
            }
        }
    }

    pub async fn close(&self) {
        if let DbPool::Postgres(pool) = self {
            pool.close().await;
        }
    }
}

/// Connect to `database_url`, dispatching on its scheme. Retries with backoff up to
/// `connect_timeout`, matching the teacher's `connect_with_retry` idiom.
pub async fn connect_with_retry(database_url: &str, connect_timeout: Duration) -> Result<DbPool> {
    let deadline = tokio::time::Instant::now() + connect_timeout;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match connect_once(database_url).await {
            Ok(pool) => return Ok(pool),
            Err(e) if tokio::time::Instant::now() < deadline => {
                let backoff = Duration::from_millis(200 * attempt.min(10) as u64);
                tracing::warn!(attempt, error = %e, "database connect failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e).context("database connect_with_retry: deadline exceeded"),
        }
    }
}

async fn connect_once(database_url: &str) -> Result<DbPool> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(DbPool::Postgres(pool))
    } else if database_url.starts_with("mssql://") || database_url.starts_with("sqlserver://") {
        #[cfg(feature = "mssql")]
        {
            let config = tiberius::Config::from_ado_string(database_url)
                .context("parsing mssql connection string")?;
            let manager = mssql_pool::TiberiusConnectionManager::new(config);
            let pool = bb8::Pool::builder()
                .max_size(10)
                .build(manager)
                .await
                .context("connecting to sql server")?;
            Ok(DbPool::Mssql(Arc::new(pool)))
        }
        #[cfg(not(feature = "mssql"))]
        {
            anyhow::bail!("DATABASE_URL selects mssql but the `mssql` feature is not compiled in")
        }
    } else {
        anyhow::bail!("unrecognized DATABASE_URL scheme (expected postgres:// or mssql://)")
    }
}
