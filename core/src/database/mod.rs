//! # Database Operations
//!
//! SQLite persistence of rounds, claims and forfeits. Every completed round is
//! written in a single SQL transaction together with the exit material of its
//! claims, so a claim is never visible without the transactions it depends
//! on.

use crate::config::ArkConfig;
use crate::errors::ArkError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

mod claims;
mod rounds;
mod wrapper;

pub use rounds::{CompletedRound, RoundOutcome, RoundRecord};
pub use wrapper::*;

pub type DatabaseTransaction<'a, 'b> = &'a mut sqlx::Transaction<'b, Sqlite>;

/// Runs `$query.$method(..)` on the given transaction if there is one, on
/// the pool otherwise.
#[macro_export]
macro_rules! execute_query_with_tx {
    ($conn:expr, $tx:expr, $query:expr, $method:ident) => {
        match $tx {
            Some(tx) => $query.$method(&mut **tx).await,
            None => $query.$method(&$conn).await,
        }
    };
}

/// SQLite database connection.
#[derive(Clone, Debug)]
pub struct Database {
    connection: Pool<Sqlite>,
}

impl Database {
    /// Connects to the database in the configuration and brings its schema up
    /// to date.
    ///
    /// # Errors
    ///
    /// Returns a [`ArkError`] if the database is not accessible.
    pub async fn new(config: &ArkConfig) -> Result<Self, ArkError> {
        Database::connect(&config.db_url).await
    }

    /// Connects to `url`. `sqlite::memory:` gives a private in-memory
    /// database, which needs a single long-lived connection to survive.
    pub async fn connect(url: &str) -> Result<Self, ArkError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let connection = pool_options.connect_with(options).await?;
        let database = Self { connection };
        database.run_schema_script().await?;

        tracing::debug!("Connected to database at {url}");

        Ok(database)
    }

    /// Closes database connection.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    async fn run_schema_script(&self) -> Result<(), ArkError> {
        sqlx::raw_sql(include_str!("../../../scripts/schema.sql"))
            .execute(&self.connection)
            .await?;

        Ok(())
    }

    /// Starts a database transaction.
    ///
    /// Return value can be used for committing changes. If not committed,
    /// database will rollback every operation done after that call.
    pub async fn begin_transaction(&self) -> Result<sqlx::Transaction<'_, Sqlite>, ArkError> {
        Ok(self.connection.begin().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use tempfile::tempdir;

    #[tokio::test]
    async fn in_memory_database() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        assert_eq!(db.get_last_round_id(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn schema_script_is_idempotent() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ark.db").display());

        let db = Database::connect(&url).await.unwrap();
        db.close().await;

        // Reopening runs the schema again on existing tables.
        Database::connect(&url).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_database_url() {
        assert!(
            Database::connect("sqlite:///nonexisting-directory/for-sure/ark.db")
                .await
                .is_err()
        );
    }
}
