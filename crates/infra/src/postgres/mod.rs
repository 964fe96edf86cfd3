//! Postgres-backed booking storage.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `RepositoryError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Backend` |
//! | RowNotFound | N/A | `NotFound` |
//! | PoolClosed, network, decode | N/A | `Backend` |

mod archives;
mod bookings;

pub use archives::{PostgresBookingLogStore, PostgresHistoryStore, PostgresWebhookRequestStore};
pub use bookings::PostgresBookingRepository;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use cabinet_booking::error::RepositoryError;

const SCHEMA: &str = include_str!("../../migrations/0001_bookings.sql");

/// Opens a pool against `database_url`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, RepositoryError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Creates the booking tables when they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), RepositoryError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    info!("booking schema ready");
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => RepositoryError::conflict(msg),
                _ => RepositoryError::backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            RepositoryError::not_found(format!("row not found in {}", operation))
        }
        _ => RepositoryError::backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
