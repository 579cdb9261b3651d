use crate::models::settings::GlobalSetting;
use anyhow::{Context, Result};
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: PgPool,
}

impl SettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<GlobalSetting>> {
        sqlx::query_as::<_, GlobalSetting>("SELECT * FROM global_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch global setting")
    }

    pub async fn list(&self) -> Result<Vec<GlobalSetting>> {
        sqlx::query_as::<_, GlobalSetting>("SELECT * FROM global_settings ORDER BY key ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list global settings")
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<GlobalSetting> {
        sqlx::query_as::<_, GlobalSetting>(
            r#"
            INSERT INTO global_settings (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            RETURNING *
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .context("Failed to set global setting")
    }

    pub async fn delete(&self, key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM global_settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Failed to delete global setting")?;
        Ok(result.rows_affected())
    }
}
