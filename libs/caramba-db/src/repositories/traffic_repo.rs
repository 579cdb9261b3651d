use crate::models::traffic::{SummaryType, TrafficRecord, TrafficSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct TrafficRepository {
    pool: PgPool,
}

pub struct InsertTrafficRecord<'a> {
    pub user_id: &'a str,
    pub node_id: &'a str,
    pub upload: i64,
    pub download: i64,
    pub connect_time: DateTime<Utc>,
    pub disconnect_time: Option<DateTime<Utc>>,
    pub duration_sec: Option<i64>,
    pub session_id: Option<&'a str>,
    pub record_date: NaiveDate,
    pub record_hour: i16,
}

impl TrafficRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The append-only ledger write.
    pub async fn insert_record(&self, rec: &InsertTrafficRecord<'_>) -> Result<TrafficRecord> {
        sqlx::query_as::<_, TrafficRecord>(
            r#"
            INSERT INTO traffic_records (
                user_id, node_id, upload, download, total, connect_time,
                disconnect_time, duration_sec, session_id, record_date, record_hour
            )
            VALUES ($1, $2, $3, $4, $3 + $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(rec.user_id)
        .bind(rec.node_id)
        .bind(rec.upload)
        .bind(rec.download)
        .bind(rec.connect_time)
        .bind(rec.disconnect_time)
        .bind(rec.duration_sec)
        .bind(rec.session_id)
        .bind(rec.record_date)
        .bind(rec.record_hour)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert traffic record")
    }

    pub async fn query(
        &self,
        user_id: Option<&str>,
        node_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<TrafficRecord>, i64)> {
        let rows = sqlx::query_as::<_, TrafficRecord>(
            r#"
            SELECT * FROM traffic_records
            WHERE ($1::text IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR node_id = $2)
              AND record_date BETWEEN $3 AND $4
            ORDER BY record_date DESC, record_hour DESC
            OFFSET $5 LIMIT $6
            "#,
        )
        .bind(user_id)
        .bind(node_id)
        .bind(from)
        .bind(to)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query traffic records")?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM traffic_records
            WHERE ($1::text IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR node_id = $2)
              AND record_date BETWEEN $3 AND $4
            "#,
        )
        .bind(user_id)
        .bind(node_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count traffic records")?;

        Ok((rows, total))
    }

    /// Daily aggregation upsert: keeps the rolled-up
    /// `(user_id, node_id, summary_date, summary_type)` row in sync with the
    /// ledger for `date` without re-scanning prior days.
    pub async fn upsert_summary(
        &self,
        user_id: &str,
        node_id: &str,
        summary_date: NaiveDate,
        summary_type: SummaryType,
    ) -> Result<TrafficSummary> {
        sqlx::query_as::<_, TrafficSummary>(
            r#"
            INSERT INTO traffic_summaries (
                user_id, node_id, summary_date, summary_type,
                upload, download, total, connection_count, avg_bytes, peak_bytes
            )
            SELECT
                $1, $2, $3, $4,
                COALESCE(sum(upload), 0), COALESCE(sum(download), 0), COALESCE(sum(total), 0),
                count(*), COALESCE(avg(total), 0)::bigint, COALESCE(max(total), 0)
            FROM traffic_records
            WHERE user_id = $1 AND node_id = $2 AND record_date = $3
            ON CONFLICT (user_id, node_id, summary_date, summary_type) DO UPDATE SET
                upload = excluded.upload,
                download = excluded.download,
                total = excluded.total,
                connection_count = excluded.connection_count,
                avg_bytes = excluded.avg_bytes,
                peak_bytes = excluded.peak_bytes
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(node_id)
        .bind(summary_date)
        .bind(summary_type.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert traffic summary")
    }

    /// Monthly aggregation upsert: unlike `upsert_summary`, which
    /// scans a single `record_date`, this rolls up every record in
    /// `[month_start, month_end]` into one `Monthly` summary row.
    pub async fn upsert_monthly_summary(
        &self,
        user_id: &str,
        node_id: &str,
        month_start: NaiveDate,
        month_end: NaiveDate,
    ) -> Result<TrafficSummary> {
        sqlx::query_as::<_, TrafficSummary>(
            r#"
            INSERT INTO traffic_summaries (
                user_id, node_id, summary_date, summary_type,
                upload, download, total, connection_count, avg_bytes, peak_bytes
            )
            SELECT
                $1, $2, $3, 'monthly',
                COALESCE(sum(upload), 0), COALESCE(sum(download), 0), COALESCE(sum(total), 0),
                count(*), COALESCE(avg(total), 0)::bigint, COALESCE(max(total), 0)
            FROM traffic_records
            WHERE user_id = $1 AND node_id = $2 AND record_date BETWEEN $3 AND $4
            ON CONFLICT (user_id, node_id, summary_date, summary_type) DO UPDATE SET
                upload = excluded.upload,
                download = excluded.download,
                total = excluded.total,
                connection_count = excluded.connection_count,
                avg_bytes = excluded.avg_bytes,
                peak_bytes = excluded.peak_bytes
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(node_id)
        .bind(month_start)
        .bind(month_end)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert monthly traffic summary")
    }

    pub async fn distinct_user_node_pairs_for_date(
        &self,
        record_date: NaiveDate,
    ) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT user_id, node_id FROM traffic_records WHERE record_date = $1",
        )
        .bind(record_date)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list distinct user/node pairs for date")?;
        Ok(rows)
    }

    /// Maintenance purge: retention window is caller-supplied so
    /// the background job owns the 30d/90d defaults rather than the repository.
    pub async fn purge_records_older_than(&self, cutoff: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM traffic_records WHERE record_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge old traffic records")?;
        Ok(result.rows_affected())
    }

    pub async fn purge_summaries_older_than(&self, cutoff: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM traffic_summaries WHERE summary_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge old traffic summaries")?;
        Ok(result.rows_affected())
    }

    pub async fn sum_total_between(&self, from: NaiveDate, to: NaiveDate) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            "SELECT sum(total) FROM traffic_records WHERE record_date BETWEEN $1 AND $2",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum traffic total")?;
        Ok(total.unwrap_or(0))
    }
}
