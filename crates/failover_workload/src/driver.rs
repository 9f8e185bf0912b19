//! Narrow driver seam: open a connection, write one row, read session identity.
//!
//! The workload engine only talks to the database through these traits, so
//! the PostgreSQL binding and the scripted test driver are interchangeable.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::WorkloadError;
use crate::identity::SessionIdentity;

/// Opens new physical connections to the target endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: WriteConnection;

    async fn connect(&self) -> Result<Self::Connection, WorkloadError>;
}

/// One live physical connection.
#[async_trait]
pub trait WriteConnection: Send + 'static {
    /// Inserts `row`, returning the number of affected rows.
    async fn insert(&mut self, row: &WriteRow) -> Result<u64, WorkloadError>;

    /// Reads the serving hostname and read-only flag of this session.
    async fn session_identity(&mut self) -> Result<SessionIdentity, WorkloadError>;

    /// Whether the driver already knows the connection is unusable.
    fn is_closed(&self) -> bool;
}

/// A single row destined for table `{table_prefix}{table_index:04}`.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRow {
    pub table_index: u32,
    pub col1: String,
    pub col2: i32,
    pub col3: String,
    pub col4: f64,
    pub col5: i64,
}

impl WriteRow {
    /// Draws a target table uniformly from `[1, key_space]` and fills the
    /// columns with random values.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, key_space: u32) -> Self {
        let table_index = rng.gen_range(1..=key_space.max(1));
        Self {
            table_index,
            col1: random_string(rng, 20),
            col2: rng.gen_range(0..1000),
            col3: random_string(rng, 50),
            col4: rng.gen::<f64>() * 1000.0,
            col5: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Table name used both in SQL and in log lines.
    pub fn table_name(&self, prefix: &str) -> String {
        format!("{prefix}{:04}", self.table_index)
    }
}

fn random_string<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn random_rows_stay_inside_key_space() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let row = WriteRow::random(&mut rng, 12);
            assert!((1..=12).contains(&row.table_index));
            assert_eq!(row.col1.len(), 20);
            assert_eq!(row.col3.len(), 50);
            assert!((0..1000).contains(&row.col2));
            assert!((0.0..1000.0).contains(&row.col4));
        }
    }

    #[test]
    fn table_name_is_zero_padded() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut row = WriteRow::random(&mut rng, 1);
        assert_eq!(row.table_name("test_"), "test_0001");
        row.table_index = 12000;
        assert_eq!(row.table_name("test_"), "test_12000");
    }
}
