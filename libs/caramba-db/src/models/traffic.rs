use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Append-only ledger row. Simple enough, and uniform enough in
/// column types, that a derived `FromRow` is a faithful fit (unlike
/// `Node`/`User`, which carry legacy-shaped optional columns elsewhere in
/// the schema's lineage).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrafficRecord {
    pub id: i64,
    pub user_id: String,
    pub node_id: String,
    pub upload: i64,
    pub download: i64,
    pub total: i64,
    pub connect_time: DateTime<Utc>,
    pub disconnect_time: Option<DateTime<Utc>>,
    pub duration_sec: Option<i64>,
    pub session_id: Option<String>,
    pub record_date: NaiveDate,
    pub record_hour: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    Hourly,
    Daily,
    Monthly,
}

impl SummaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryType::Hourly => "hourly",
            SummaryType::Daily => "daily",
            SummaryType::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrafficSummary {
    pub id: i64,
    pub user_id: String,
    pub node_id: String,
    pub summary_date: NaiveDate,
    pub summary_type: String,
    pub upload: i64,
    pub download: i64,
    pub total: i64,
    pub connection_count: i64,
    pub avg_bytes: i64,
    pub peak_bytes: i64,
}
