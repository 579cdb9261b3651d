use crate::models::node::Node;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

#[derive(Debug, Clone)]
pub struct NodeRepository {
    pool: PgPool,
}

impl NodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_node(row: &PgRow) -> Node {
        Node {
            node_id: row.try_get::<String, _>("node_id").unwrap_or_default(),
            name: row.try_get::<String, _>("name").unwrap_or_default(),
            host: row.try_get::<String, _>("host").unwrap_or_default(),
            port: row
                .try_get::<i32, _>("port")
                .or_else(|_| row.try_get::<i16, _>("port").map(i32::from))
                .unwrap_or_default(),
            status: row
                .try_get::<String, _>("status")
                .unwrap_or_else(|_| "offline".to_string()),
            last_heartbeat: row
                .try_get::<Option<DateTime<Utc>>, _>("last_heartbeat")
                .ok()
                .flatten(),
            cpu_percent: row.try_get::<Option<f64>, _>("cpu_percent").ok().flatten(),
            mem_percent: row.try_get::<Option<f64>, _>("mem_percent").ok().flatten(),
            disk_percent: row.try_get::<Option<f64>, _>("disk_percent").ok().flatten(),
            load1: row.try_get::<Option<f64>, _>("load1").ok().flatten(),
            load5: row.try_get::<Option<f64>, _>("load5").ok().flatten(),
            load15: row.try_get::<Option<f64>, _>("load15").ok().flatten(),
            in_bps: row.try_get::<Option<f64>, _>("in_bps").ok().flatten(),
            out_bps: row.try_get::<Option<f64>, _>("out_bps").ok().flatten(),
            active_connections: row
                .try_get::<Option<i32>, _>("active_connections")
                .ok()
                .flatten(),
            cumulative_upload: row.try_get::<i64, _>("cumulative_upload").unwrap_or_default(),
            cumulative_download: row
                .try_get::<i64, _>("cumulative_download")
                .unwrap_or_default(),
            current_users: row.try_get::<i32, _>("current_users").unwrap_or_default(),
            max_users: row.try_get::<i32, _>("max_users").unwrap_or_default(),
            config_version: row.try_get::<i64, _>("config_version").unwrap_or_default(),
            sing_box_version: row
                .try_get::<Option<String>, _>("sing_box_version")
                .ok()
                .flatten(),
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .unwrap_or_else(|_| Utc::now()),
        }
    }

    /// RegisterNode's persistence half: create on absence, or update
    /// name/host/status=online/last_heartbeat/version on presence. Always
    /// runs before the Registry is touched.
    pub async fn upsert_on_register(
        &self,
        node_id: &str,
        name: &str,
        host: &str,
        port: i32,
        version: Option<&str>,
    ) -> Result<Node> {
        let row = sqlx::query(
            r#"
            INSERT INTO nodes (node_id, name, host, port, status, last_heartbeat, sing_box_version)
            VALUES ($1, $2, $3, $4, 'online', now(), $5)
            ON CONFLICT (node_id) DO UPDATE SET
                name = excluded.name,
                host = excluded.host,
                port = excluded.port,
                status = 'online',
                last_heartbeat = now(),
                sing_box_version = COALESCE(excluded.sing_box_version, nodes.sing_box_version)
            RETURNING *
            "#,
        )
        .bind(node_id)
        .bind(name)
        .bind(host)
        .bind(port)
        .bind(version)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert node on register")?;

        Ok(Self::row_to_node(&row))
    }

    pub async fn get(&self, node_id: &str) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch node")?;
        Ok(row.map(|r| Self::row_to_node(&r)))
    }

    pub async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<Node>, i64)> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY created_at DESC OFFSET $1 LIMIT $2")
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list nodes")?;
        let total: i64 = sqlx::query_scalar("SELECT count(*) FROM nodes")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count nodes")?;
        Ok((rows.iter().map(Self::row_to_node).collect(), total))
    }

    /// Single-statement heartbeat persistence: `last_heartbeat = now()`
    /// and `status = online` together. Called by the lower-cadence ticker,
    /// not on every heartbeat.
    pub async fn persist_heartbeat(&self, node_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE nodes SET last_heartbeat = now(), status = $1 WHERE node_id = $2")
            .bind(status)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .context("Failed to persist heartbeat")?;
        Ok(())
    }

    pub async fn set_status(&self, node_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE nodes SET status = $1 WHERE node_id = $2")
            .bind(status)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .context("Failed to set node status")?;
        Ok(())
    }

    /// Persists the coarse metrics fields reported by ReportMetrics.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_metrics(
        &self,
        node_id: &str,
        cpu_percent: Option<f64>,
        mem_percent: Option<f64>,
        disk_percent: Option<f64>,
        load1: Option<f64>,
        load5: Option<f64>,
        load15: Option<f64>,
        in_bps: Option<f64>,
        out_bps: Option<f64>,
        active_connections: Option<i32>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE nodes SET
                cpu_percent = $1, mem_percent = $2, disk_percent = $3,
                load1 = $4, load5 = $5, load15 = $6,
                in_bps = $7, out_bps = $8, active_connections = $9
            WHERE node_id = $10
            "#,
        )
        .bind(cpu_percent)
        .bind(mem_percent)
        .bind(disk_percent)
        .bind(load1)
        .bind(load5)
        .bind(load15)
        .bind(in_bps)
        .bind(out_bps)
        .bind(active_connections)
        .bind(node_id)
        .execute(&self.pool)
        .await
        .context("Failed to update node metrics")?;
        Ok(result.rows_affected())
    }

    /// Atomic relative update: never read-modify-write in
    /// application code.
    pub async fn add_traffic(&self, node_id: &str, upload_delta: i64, download_delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE nodes SET cumulative_upload = cumulative_upload + $1, cumulative_download = cumulative_download + $2 WHERE node_id = $3",
        )
        .bind(upload_delta)
        .bind(download_delta)
        .bind(node_id)
        .execute(&self.pool)
        .await
        .context("Failed to add node traffic")?;
        Ok(())
    }

    pub async fn set_current_users(&self, node_id: &str, current_users: i32) -> Result<()> {
        sqlx::query("UPDATE nodes SET current_users = $1 WHERE node_id = $2")
            .bind(current_users)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .context("Failed to set node current_users")?;
        Ok(())
    }

    pub async fn update_config(&self, req: &UpdateNodeConfigFields<'_>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nodes SET
                name = COALESCE($1, name),
                host = COALESCE($2, host),
                port = COALESCE($3, port),
                max_users = COALESCE($4, max_users),
                status = COALESCE($5, status)
            WHERE node_id = $6
            "#,
        )
        .bind(req.name)
        .bind(req.host)
        .bind(req.port)
        .bind(req.max_users)
        .bind(req.status)
        .bind(req.node_id)
        .execute(&self.pool)
        .await
        .context("Failed to update node config")?;
        Ok(())
    }

    pub async fn delete(&self, node_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM nodes WHERE node_id = $1")
            .bind(node_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete node")?;
        Ok(result.rows_affected())
    }

    pub async fn count_total(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM nodes")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count nodes")
    }

    pub async fn count_online(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM nodes WHERE status = 'online'")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count online nodes")
    }
}

pub struct UpdateNodeConfigFields<'a> {
    pub node_id: &'a str,
    pub name: Option<&'a str>,
    pub host: Option<&'a str>,
    pub port: Option<i32>,
    pub max_users: Option<i32>,
    pub status: Option<&'a str>,
}
