//! Embedded schema for the inventory tables and the reconcile queue.

use crate::error::DbError;
use crate::pool::DbPool;

/// Bring the inventory schema up to date.
///
/// `0001` creates the source, canonical, conflict and change-event tables;
/// `0002` adds `reconcile_queue`. The worker calls this once before its first
/// poll and exits if it fails.
///
/// ```rust,ignore
/// let pool = DbPool::connect("postgres://localhost/stockline").await?;
/// run_migrations(&pool).await?;
/// ```
///
/// # Errors
///
/// Returns `DbError::MigrationFailed` if any migration fails to apply.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    let migrator = sqlx::migrate!("./migrations");
    tracing::info!(
        migrations = migrator.iter().count(),
        "Applying inventory schema migrations"
    );

    migrator
        .run(pool.inner())
        .await
        .map_err(DbError::MigrationFailed)?;

    tracing::info!("Inventory schema is current");
    Ok(())
}
