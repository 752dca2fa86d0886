//! Postgres backend
//!
//! One `PgConnection` per backend. Statements go through the simple query
//! protocol so that generated multi-row and multi-statement text is sent
//! as-is.

use crate::backend::{Row, StorageBackend, StorageConnector};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use bmpsink_common::PostgresConfig;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Column, Connection, Executor, Row as _};
use std::time::Duration;
use tracing::debug;

/// Application name reported to the server
pub const APPLICATION_NAME: &str = "bmpsink";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens Postgres backends from the `[postgres]` section
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(config: &PostgresConfig) -> bmpsink_common::Result<Self> {
        let (host, port) = config.host_and_port()?;

        let ssl_mode = if config.ssl_enable {
            config.ssl_mode.parse::<PgSslMode>().map_err(|e| {
                bmpsink_common::ConfigError::invalid(format!(
                    "postgres.ssl_mode '{}': {e}",
                    config.ssl_mode
                ))
            })?
        } else {
            PgSslMode::Disable
        };

        let options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .database(&config.db_name)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(ssl_mode)
            .application_name(APPLICATION_NAME);

        Ok(Self { options })
    }
}

impl StorageConnector for PgConnector {
    fn open(&self) -> Box<dyn StorageBackend> {
        Box::new(PgBackend {
            options: self.options.clone(),
            conn: None,
        })
    }
}

struct PgBackend {
    options: PgConnectOptions,
    conn: Option<PgConnection>,
}

impl PgBackend {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| StorageError::connection("no connection to the server"))
    }

    fn fail(&mut self, err: sqlx::Error) -> StorageError {
        let err = classify(err);
        if err.is_connection() {
            self.conn = None;
        }
        err
    }
}

#[async_trait]
impl StorageBackend for PgBackend {
    async fn connect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            close(conn).await;
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, PgConnection::connect_with(&self.options))
            .await
        {
            Ok(Ok(conn)) => {
                self.conn = Some(conn);
                Ok(())
            }
            Ok(Err(e)) => Err(StorageError::connection(e.to_string())),
            Err(_) => Err(StorageError::connection("connection attempt timed out")),
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let conn = self.conn()?;
        match conn.execute(sqlx::raw_sql(sql)).await {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn select(&mut self, sql: &str) -> Result<Vec<Row>> {
        let conn = self.conn()?;
        let pg_rows = match conn.fetch_all(sqlx::raw_sql(sql)).await {
            Ok(rows) => rows,
            Err(e) => return Err(self.fail(e)),
        };

        let mut rows = Vec::with_capacity(pg_rows.len());
        for pg_row in &pg_rows {
            let mut row = Row::new();
            for column in pg_row.columns() {
                // simple query results arrive in text format
                match pg_row.try_get_unchecked::<Option<String>, _>(column.ordinal()) {
                    Ok(Some(value)) => {
                        row.insert(column.name().to_string(), value);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(column = column.name(), error = %e, "Skipping undecodable column"),
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }

    async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            close(conn).await;
        }
    }
}

fn classify(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => StorageError::connection(err.to_string()),
        sqlx::Error::Database(db) => {
            StorageError::from_message(db.code().map(|c| c.into_owned()), db.message())
        }
        _ => StorageError::from_message(None, err.to_string()),
    }
}

async fn close(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Closing connection failed");
    }
}
