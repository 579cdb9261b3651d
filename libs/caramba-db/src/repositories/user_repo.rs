use crate::models::user::User;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

pub struct CreateUserFields<'a> {
    pub user_id: &'a str,
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub plan_id: Option<&'a str>,
    pub traffic_quota: i64,
    pub device_limit: i32,
    pub speed_limit_mbps: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub subscription_token: &'a str,
}

pub struct UpdateUserFields<'a> {
    pub user_id: &'a str,
    pub username: Option<&'a str>,
    pub email: Option<&'a str>,
    pub status: Option<&'a str>,
    pub plan_id: Option<&'a str>,
    pub traffic_quota: Option<i64>,
    pub device_limit: Option<i32>,
    pub speed_limit_mbps: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_user(row: &PgRow) -> User {
        User {
            user_id: row.try_get::<String, _>("user_id").unwrap_or_default(),
            username: row.try_get::<String, _>("username").unwrap_or_default(),
            email: row.try_get::<String, _>("email").unwrap_or_default(),
            password_hash: row.try_get::<String, _>("password_hash").unwrap_or_default(),
            status: row
                .try_get::<String, _>("status")
                .unwrap_or_else(|_| "active".to_string()),
            plan_id: row.try_get::<Option<String>, _>("plan_id").ok().flatten(),
            traffic_quota: row.try_get::<i64, _>("traffic_quota").unwrap_or_default(),
            traffic_used: row.try_get::<i64, _>("traffic_used").unwrap_or_default(),
            traffic_reset_at: row
                .try_get::<Option<DateTime<Utc>>, _>("traffic_reset_at")
                .ok()
                .flatten(),
            device_limit: row.try_get::<i32, _>("device_limit").unwrap_or_default(),
            speed_limit_mbps: row.try_get::<i32, _>("speed_limit_mbps").unwrap_or_default(),
            expires_at: row
                .try_get::<Option<DateTime<Utc>>, _>("expires_at")
                .ok()
                .flatten(),
            locked_until: row
                .try_get::<Option<DateTime<Utc>>, _>("locked_until")
                .ok()
                .flatten(),
            login_attempts: row.try_get::<i32, _>("login_attempts").unwrap_or_default(),
            subscription_token: row
                .try_get::<String, _>("subscription_token")
                .unwrap_or_default(),
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .unwrap_or_else(|_| Utc::now()),
        }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;
        Ok(row.map(|r| Self::row_to_user(&r)))
    }

    pub async fn get_by_subscription_token(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE subscription_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by subscription token")?;
        Ok(row.map(|r| Self::row_to_user(&r)))
    }

    pub async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<User>, i64)> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY created_at DESC OFFSET $1 LIMIT $2")
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list users")?;
        let total: i64 = sqlx::query_scalar("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count users")?;
        Ok((rows.iter().map(Self::row_to_user).collect(), total))
    }

    pub async fn create(&self, fields: &CreateUserFields<'_>) -> Result<User> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (
                user_id, username, email, password_hash, status, plan_id,
                traffic_quota, traffic_used, device_limit, speed_limit_mbps,
                expires_at, login_attempts, subscription_token
            )
            VALUES ($1, $2, $3, $4, 'active', $5, $6, 0, $7, $8, $9, 0, $10)
            RETURNING *
            "#,
        )
        .bind(fields.user_id)
        .bind(fields.username)
        .bind(fields.email)
        .bind(fields.password_hash)
        .bind(fields.plan_id)
        .bind(fields.traffic_quota)
        .bind(fields.device_limit)
        .bind(fields.speed_limit_mbps)
        .bind(fields.expires_at)
        .bind(fields.subscription_token)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create user")?;

        Ok(Self::row_to_user(&row))
    }

    pub async fn update(&self, fields: &UpdateUserFields<'_>) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            UPDATE users SET
                username = COALESCE($1, username),
                email = COALESCE($2, email),
                status = COALESCE($3, status),
                plan_id = COALESCE($4, plan_id),
                traffic_quota = COALESCE($5, traffic_quota),
                device_limit = COALESCE($6, device_limit),
                speed_limit_mbps = COALESCE($7, speed_limit_mbps),
                expires_at = COALESCE($8, expires_at)
            WHERE user_id = $9
            RETURNING *
            "#,
        )
        .bind(fields.username)
        .bind(fields.email)
        .bind(fields.status)
        .bind(fields.plan_id)
        .bind(fields.traffic_quota)
        .bind(fields.device_limit)
        .bind(fields.speed_limit_mbps)
        .bind(fields.expires_at)
        .bind(fields.user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update user")?;
        Ok(row.map(|r| Self::row_to_user(&r)))
    }

    pub async fn set_status(&self, user_id: &str, status: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE users SET status = $1 WHERE user_id = $2")
            .bind(status)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to set user status")?;
        Ok(result.rows_affected())
    }

    /// Atomic relative update, mirrors `nodes.cumulative_*`.
    pub async fn add_traffic(&self, user_id: &str, delta: i64) -> Result<()> {
        sqlx::query("UPDATE users SET traffic_used = traffic_used + $1 WHERE user_id = $2")
            .bind(delta)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to add user traffic")?;
        Ok(())
    }

    pub async fn reset_traffic(&self, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET traffic_used = 0, traffic_reset_at = now() WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to reset user traffic")?;
        Ok(())
    }

    pub async fn delete(&self, user_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete user")?;
        Ok(result.rows_affected())
    }

    pub async fn username_taken(&self, username: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM users WHERE username = $1")
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check username uniqueness")?;
        Ok(count > 0)
    }

    pub async fn email_taken(&self, email: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM users WHERE email = $1")
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check email uniqueness")?;
        Ok(count > 0)
    }

    pub async fn count_total(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count users")
    }

    pub async fn count_active(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM users WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count active users")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_unlimited_is_negative() {
        let user = User {
            user_id: "u1".into(),
            username: "a".into(),
            email: "a@example.com".into(),
            password_hash: "x".into(),
            status: "active".into(),
            plan_id: None,
            traffic_quota: -1,
            traffic_used: 999_999_999,
            traffic_reset_at: None,
            device_limit: 3,
            speed_limit_mbps: 0,
            expires_at: None,
            locked_until: None,
            login_attempts: 0,
            subscription_token: "tok".into(),
            created_at: Utc::now(),
        };
        assert!(!user.quota_exceeded());
    }
}
