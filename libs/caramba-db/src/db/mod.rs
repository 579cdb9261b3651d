use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;

/// Transaction primitive: runs `f` against a fresh transaction,
/// commits on its successful return, rolls back otherwise. Callers never
/// issue `begin`/`commit`/`rollback` themselves.
pub async fn with_transaction<F, Fut, T>(pool: &PgPool, f: F) -> Result<T>
where
    F: FnOnce(&mut Transaction<'_, Postgres>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await.context("failed to commit transaction")?;
            Ok(value)
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}
