//! PostgreSQL binding of the driver seam over `tokio_postgres`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::debug;

use crate::driver::{Connector, WriteConnection, WriteRow};
use crate::error::{ErrorClass, WorkloadError};
use crate::identity::SessionIdentity;

/// Default identity probe: server address plus recovery (standby) state.
pub const DEFAULT_IDENTITY_QUERY: &str =
    "SELECT COALESCE(host(inet_server_addr()), 'localhost'), pg_is_in_recovery()";

/// Endpoint, credentials and per-connection limits.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
    pub table_prefix: String,
    pub identity_query: String,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .field("table_prefix", &self.table_prefix)
            .field("identity_query", &self.identity_query)
            .finish()
    }
}

/// Opens `tokio_postgres` sessions against the configured endpoint.
pub struct PgConnector {
    config: tokio_postgres::Config,
    settings: ConnectionSettings,
}

impl PgConnector {
    pub fn new(settings: ConnectionSettings) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .dbname(&settings.database)
            .user(&settings.username)
            .password(&settings.password)
            .application_name("failover-workload")
            .connect_timeout(settings.connect_timeout);
        Self { config, settings }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, WorkloadError> {
        let connect = self.config.connect(NoTls);
        let (client, connection) =
            match tokio::time::timeout(self.settings.connect_timeout, connect).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(err)) => return Err(WorkloadError::ConnectFailed(err.to_string())),
                Err(_) => {
                    return Err(WorkloadError::ConnectFailed(format!(
                        "connect to {}:{} timed out after {:?}",
                        self.settings.host, self.settings.port, self.settings.connect_timeout
                    )))
                }
            };
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "postgres connection task ended");
            }
        });
        Ok(PgConnection {
            client,
            driver,
            statement_timeout: self.settings.statement_timeout,
            table_prefix: self.settings.table_prefix.clone(),
            identity_query: self.settings.identity_query.clone(),
        })
    }
}

/// One PostgreSQL session plus the task driving its socket.
pub struct PgConnection {
    client: Client,
    driver: JoinHandle<()>,
    statement_timeout: Duration,
    table_prefix: String,
    identity_query: String,
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl WriteConnection for PgConnection {
    async fn insert(&mut self, row: &WriteRow) -> Result<u64, WorkloadError> {
        let sql = insert_statement(&row.table_name(&self.table_prefix));
        let params = insert_params(row);
        let exec = self.client.execute(sql.as_str(), &params);
        match tokio::time::timeout(self.statement_timeout, exec).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(err)) => Err(classify_error(&err)),
            Err(_) => Err(WorkloadError::Timeout(format!(
                "insert did not complete within {:?}",
                self.statement_timeout
            ))),
        }
    }

    async fn session_identity(&mut self) -> Result<SessionIdentity, WorkloadError> {
        let query = self.client.query_opt(self.identity_query.as_str(), &[]);
        let row = match tokio::time::timeout(self.statement_timeout, query).await {
            Ok(Ok(row)) => row,
            Ok(Err(err)) => return Err(WorkloadError::IdentityLookupFailed(err.to_string())),
            Err(_) => {
                return Err(WorkloadError::IdentityLookupFailed(
                    "identity query timed out".to_string(),
                ))
            }
        };
        let Some(row) = row else {
            return Err(WorkloadError::IdentityLookupFailed(
                "identity query returned no rows".to_string(),
            ));
        };
        let hostname = row
            .try_get::<_, Option<String>>(0)
            .map_err(|err| WorkloadError::IdentityLookupFailed(err.to_string()))?;
        let read_only = row
            .try_get::<_, bool>(1)
            .or_else(|_| row.try_get::<_, i32>(1).map(|flag| flag != 0))
            .or_else(|_| row.try_get::<_, i64>(1).map(|flag| flag != 0))
            .map_err(|err| WorkloadError::IdentityLookupFailed(err.to_string()))?;
        Ok(SessionIdentity {
            hostname,
            read_only,
        })
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

fn insert_statement(table: &str) -> String {
    format!("INSERT INTO {table} (col1, col2, col3, col4, col5) VALUES ($1, $2, $3, $4, $5)")
}

/// Bound parameters in column order.
fn insert_params(row: &WriteRow) -> [&(dyn ToSql + Sync); 5] {
    [&row.col1, &row.col2, &row.col3, &row.col4, &row.col5]
}

/// Maps a driver error onto the workload taxonomy from its SQLSTATE and
/// connection state rather than its message text.
pub fn classify_error(err: &tokio_postgres::Error) -> WorkloadError {
    let class = if err.is_closed() {
        ErrorClass::ConnectionLost
    } else if let Some(code) = err.code() {
        classify_sqlstate(code)
    } else if has_io_source(err) {
        ErrorClass::ConnectionLost
    } else {
        ErrorClass::Other
    };
    WorkloadError::from_class(class, err.to_string())
}

/// Classifies a server-reported SQLSTATE.
pub fn classify_sqlstate(code: &SqlState) -> ErrorClass {
    if *code == SqlState::T_R_DEADLOCK_DETECTED {
        ErrorClass::Deadlock
    } else if *code == SqlState::QUERY_CANCELED {
        ErrorClass::Timeout
    } else if code.code().starts_with("08")
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
    {
        ErrorClass::ConnectionLost
    } else {
        ErrorClass::Other
    }
}

fn has_io_source(err: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if inner.is::<std::io::Error>() {
            return true;
        }
        source = inner.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstates_map_to_taxonomy() {
        assert_eq!(
            classify_sqlstate(&SqlState::T_R_DEADLOCK_DETECTED),
            ErrorClass::Deadlock
        );
        assert_eq!(
            classify_sqlstate(&SqlState::QUERY_CANCELED),
            ErrorClass::Timeout
        );
        assert_eq!(
            classify_sqlstate(&SqlState::CONNECTION_FAILURE),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify_sqlstate(&SqlState::ADMIN_SHUTDOWN),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify_sqlstate(&SqlState::CANNOT_CONNECT_NOW),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify_sqlstate(&SqlState::UNDEFINED_TABLE),
            ErrorClass::Other
        );
        assert_eq!(
            classify_sqlstate(&SqlState::READ_ONLY_SQL_TRANSACTION),
            ErrorClass::Other
        );
    }

    #[test]
    fn insert_binds_every_column_in_order() {
        use rand::rngs::SmallRng;
        use rand::SeedableRng;

        let mut rng = SmallRng::seed_from_u64(7);
        let row = WriteRow::random(&mut rng, 12_000);
        let sql = insert_statement(&row.table_name("test_"));
        assert!(sql.starts_with(&format!("INSERT INTO {} ", row.table_name("test_"))));
        assert!(sql.ends_with("VALUES ($1, $2, $3, $4, $5)"));

        let params = insert_params(&row);
        let rendered: Vec<String> = params.iter().map(|p| format!("{p:?}")).collect();
        assert_eq!(
            rendered,
            vec![
                format!("{:?}", row.col1),
                format!("{:?}", row.col2),
                format!("{:?}", row.col3),
                format!("{:?}", row.col4),
                format!("{:?}", row.col5),
            ]
        );
    }

    #[test]
    fn settings_debug_redacts_password() {
        let settings = ConnectionSettings {
            host: "db".into(),
            port: 5432,
            database: "lab_db".into(),
            username: "admin".into(),
            password: "hunter2".into(),
            connect_timeout: Duration::from_secs(1),
            statement_timeout: Duration::from_secs(1),
            table_prefix: "test_".into(),
            identity_query: DEFAULT_IDENTITY_QUERY.into(),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
