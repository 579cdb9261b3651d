use crate::models::admin::AdminAccount;
use anyhow::{Context, Result};
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct AdminRepository {
    pool: PgPool,
}

impl AdminRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, username: &str) -> Result<Option<AdminAccount>> {
        sqlx::query_as::<_, AdminAccount>("SELECT * FROM admin_accounts WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch admin account")
    }

    /// Update-then-insert: an existing account keeps its `created_at`.
    pub async fn set_password(&self, username: &str, password_hash: &str) -> Result<()> {
        let updated = sqlx::query("UPDATE admin_accounts SET password_hash = $1 WHERE username = $2")
            .bind(password_hash)
            .bind(username)
            .execute(&self.pool)
            .await
            .context("Failed to update admin password")?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO admin_accounts (username, password_hash, created_at) VALUES ($1, $2, now())",
            )
            .bind(username)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .context("Failed to create admin account")?;
        }
        Ok(())
    }
}
