use crate::models::traffic::SummaryType;
use crate::repositories::traffic_repo::TrafficRepository;
use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub records_purged: u64,
    pub summaries_purged: u64,
    pub daily_summaries_upserted: u64,
    pub monthly_summaries_upserted: u64,
}

/// Runs the daily housekeeping pass: rolls yesterday's ledger rows into
/// `traffic_summaries`, rolls the prior month up on the 1st, then purges
/// anything past retention. Intended to be driven by a once-a-day ticker in
/// the host binary, not by per-request code. Retention windows are
/// caller-supplied (host config), matching `purge_*_older_than`'s contract.
pub async fn run_daily_maintenance(
    repo: &TrafficRepository,
    today: NaiveDate,
    record_retention_days: i64,
    summary_retention_days: i64,
) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport::default();
    let yesterday = today.pred_opt().unwrap_or(today);

    let pairs = repo.distinct_user_node_pairs_for_date(yesterday).await?;
    for (user_id, node_id) in &pairs {
        repo.upsert_summary(user_id, node_id, yesterday, SummaryType::Daily)
            .await?;
        report.daily_summaries_upserted += 1;
    }

    if today.day() == 1 {
        if let Some(prev_month_end) = today.pred_opt() {
            let month_start = prev_month_end.with_day(1).unwrap_or(prev_month_end);
            let mut cursor = month_start;
            let mut seen = std::collections::HashSet::new();
            while cursor <= prev_month_end {
                for (user_id, node_id) in repo.distinct_user_node_pairs_for_date(cursor).await? {
                    seen.insert((user_id, node_id));
                }
                match cursor.succ_opt() {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            for (user_id, node_id) in seen {
                repo.upsert_monthly_summary(&user_id, &node_id, month_start, prev_month_end)
                    .await?;
                report.monthly_summaries_upserted += 1;
            }
        }
    }

    let record_cutoff = today - chrono::Duration::days(record_retention_days);
    let summary_cutoff = today - chrono::Duration::days(summary_retention_days);

    report.records_purged = repo.purge_records_older_than(record_cutoff).await?;
    report.summaries_purged = repo.purge_summaries_older_than(summary_cutoff).await?;

    if report.records_purged > 0 || report.summaries_purged > 0 {
        info!(
            records_purged = report.records_purged,
            summaries_purged = report.summaries_purged,
            "maintenance purge completed"
        );
    }
    if pairs.is_empty() {
        warn!(date = %yesterday, "no traffic recorded for prior day, nothing to summarize");
    }

    Ok(report)
}
