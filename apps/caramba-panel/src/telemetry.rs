//! C5: ReportMetrics / ReportTraffic. Grounded on the host's
//! `telemetry_service.rs::process_heartbeat` for the traffic-delta
//! bookkeeping and atomic counter update shape.

use anyhow::Context;
use caramba_db::db::with_transaction;
use caramba_shared::node_plane::{MetricsSnapshot, UserTrafficEntry};
use chrono::{Timelike, Utc};
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::state::AppState;

/// ReportMetrics: refresh the Registry snapshot, persist the coarse
/// fields onto the Node row. `not_found` if the node was never registered.
pub async fn report_metrics(state: &AppState, node_id: &str, metrics: MetricsSnapshot) -> ControlResult<()> {
    if state.registry.record_metrics(node_id, metrics.clone()).await.is_none() {
        return Err(ControlError::NotFound(format!("node {node_id} not found")));
    }

    state
        .nodes
        .update_metrics(
            node_id,
            metrics.cpu_percent,
            metrics.mem_percent,
            metrics.disk_percent,
            metrics.load1,
            metrics.load5,
            metrics.load15,
            metrics.in_bps,
            metrics.out_bps,
            metrics.active_connections.map(|v| v as i32),
        )
        .await
        .context("report_metrics: failed to persist node metrics")?;

    Ok(())
}

/// ReportTraffic: per-row independent, transactional per entry. One
/// failing row never rolls back accepted rows.
pub async fn report_traffic(
    state: &AppState,
    node_id: &str,
    entries: &[UserTrafficEntry],
) -> ControlResult<Vec<String>> {
    let mut quota_exceeded = Vec::new();
    let now = Utc::now();

    let mut total_upload = 0i64;
    let mut total_download = 0i64;

    for entry in entries {
        let upload = entry.upload_bytes as i64;
        let download = entry.download_bytes as i64;
        let total = upload + download;
        let connect_time = entry.connect_time.unwrap_or(now);
        let disconnect_time = entry.disconnect_time;
        let duration_sec = disconnect_time.map(|d| (d - connect_time).num_seconds());

        let result = with_transaction(&state.pool, |tx| async move {
            sqlx::query(
                r#"
                INSERT INTO traffic_records (
                    user_id, node_id, upload, download, total, connect_time,
                    disconnect_time, duration_sec, session_id, record_date, record_hour
                )
                VALUES ($1, $2, $3, $4, $3 + $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(&entry.user_id)
            .bind(node_id)
            .bind(upload)
            .bind(download)
            .bind(connect_time)
            .bind(disconnect_time)
            .bind(duration_sec)
            .bind(&entry.session_id)
            .bind(now.date_naive())
            .bind(now.hour() as i16)
            .execute(&mut **tx)
            .await
            .context("report_traffic: failed to insert traffic record")?;

            // An absent user is a deliberate policy, not an
            // error — the ledger row is kept, the counter update is skipped.
            let user = sqlx::query_as::<_, (i64, i64)>(
                "SELECT traffic_used, traffic_quota FROM users WHERE user_id = $1 FOR UPDATE",
            )
            .bind(&entry.user_id)
            .fetch_optional(&mut **tx)
            .await
            .context("report_traffic: failed to look up user")?;

            let mut exceeded = false;
            if let Some((used, quota)) = user {
                sqlx::query("UPDATE users SET traffic_used = traffic_used + $1 WHERE user_id = $2")
                    .bind(total)
                    .bind(&entry.user_id)
                    .execute(&mut **tx)
                    .await
                    .context("report_traffic: failed to update user traffic counter")?;

                exceeded = quota > 0 && used + total > quota;
            } else {
                debug!(user_id = %entry.user_id, node_id, "traffic reported for unknown user, keeping record only");
            }

            Ok(exceeded)
        })
        .await;

        // One row's transaction failure never aborts the batch —
        // it is logged and the remaining entries still get their own shot.
        match result {
            Ok(exceeded) => {
                if exceeded {
                    quota_exceeded.push(entry.user_id.clone());
                }
                total_upload += upload;
                total_download += download;
            }
            Err(e) => {
                tracing::error!(node_id, user_id = %entry.user_id, error = %e, "traffic row failed, continuing batch");
            }
        }
    }

    if total_upload > 0 || total_download > 0 {
        state
            .nodes
            .add_traffic(node_id, total_upload, total_download)
            .await
            .context("report_traffic: failed to update node traffic counters")?;
    }

    Ok(quota_exceeded)
}
