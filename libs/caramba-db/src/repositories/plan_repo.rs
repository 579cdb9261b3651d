use crate::models::plan::Plan;
use anyhow::{Context, Result};
use sqlx::{PgPool, Row, postgres::PgRow};

#[derive(Debug, Clone)]
pub struct PlanRepository {
    pool: PgPool,
}

pub struct UpsertPlanFields<'a> {
    pub plan_id: &'a str,
    pub name: &'a str,
    pub period_days: i32,
    pub price_cents: i64,
    pub traffic_quota: i64,
    pub device_limit: i32,
    pub speed_limit_mbps: i32,
    pub connection_limit: i32,
    pub enabled: bool,
    pub max_users: i32,
    pub features: &'a serde_json::Value,
}

impl PlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_plan(row: &PgRow) -> Plan {
        Plan {
            plan_id: row.try_get::<String, _>("plan_id").unwrap_or_default(),
            name: row.try_get::<String, _>("name").unwrap_or_default(),
            period_days: row.try_get::<i32, _>("period_days").unwrap_or_default(),
            price_cents: row.try_get::<i64, _>("price_cents").unwrap_or_default(),
            traffic_quota: row.try_get::<i64, _>("traffic_quota").unwrap_or_default(),
            device_limit: row.try_get::<i32, _>("device_limit").unwrap_or_default(),
            speed_limit_mbps: row.try_get::<i32, _>("speed_limit_mbps").unwrap_or_default(),
            connection_limit: row.try_get::<i32, _>("connection_limit").unwrap_or_default(),
            enabled: row.try_get::<bool, _>("enabled").unwrap_or(true),
            max_users: row.try_get::<i32, _>("max_users").unwrap_or_default(),
            features: row
                .try_get::<serde_json::Value, _>("features")
                .unwrap_or(serde_json::Value::Null),
        }
    }

    pub async fn get(&self, plan_id: &str) -> Result<Option<Plan>> {
        let row = sqlx::query("SELECT * FROM plans WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch plan")?;
        Ok(row.map(|r| Self::row_to_plan(&r)))
    }

    pub async fn list_enabled(&self) -> Result<Vec<Plan>> {
        let rows = sqlx::query("SELECT * FROM plans WHERE enabled ORDER BY price_cents ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list enabled plans")?;
        Ok(rows.iter().map(Self::row_to_plan).collect())
    }

    pub async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<Plan>, i64)> {
        let rows = sqlx::query("SELECT * FROM plans ORDER BY price_cents ASC OFFSET $1 LIMIT $2")
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list plans")?;
        let total: i64 = sqlx::query_scalar("SELECT count(*) FROM plans")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count plans")?;
        Ok((rows.iter().map(Self::row_to_plan).collect(), total))
    }

    pub async fn upsert(&self, fields: &UpsertPlanFields<'_>) -> Result<Plan> {
        let row = sqlx::query(
            r#"
            INSERT INTO plans (
                plan_id, name, period_days, price_cents, traffic_quota,
                device_limit, speed_limit_mbps, connection_limit, enabled,
                max_users, features
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (plan_id) DO UPDATE SET
                name = excluded.name,
                period_days = excluded.period_days,
                price_cents = excluded.price_cents,
                traffic_quota = excluded.traffic_quota,
                device_limit = excluded.device_limit,
                speed_limit_mbps = excluded.speed_limit_mbps,
                connection_limit = excluded.connection_limit,
                enabled = excluded.enabled,
                max_users = excluded.max_users,
                features = excluded.features
            RETURNING *
            "#,
        )
        .bind(fields.plan_id)
        .bind(fields.name)
        .bind(fields.period_days)
        .bind(fields.price_cents)
        .bind(fields.traffic_quota)
        .bind(fields.device_limit)
        .bind(fields.speed_limit_mbps)
        .bind(fields.connection_limit)
        .bind(fields.enabled)
        .bind(fields.max_users)
        .bind(fields.features)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert plan")?;
        Ok(Self::row_to_plan(&row))
    }

    pub async fn delete(&self, plan_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM plans WHERE plan_id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete plan")?;
        Ok(result.rows_affected())
    }
}
