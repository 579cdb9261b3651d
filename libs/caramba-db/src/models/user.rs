use caramba_shared::management::UserStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable row backing an end user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub status: String,
    pub plan_id: Option<String>,
    pub traffic_quota: i64,
    pub traffic_used: i64,
    pub traffic_reset_at: Option<DateTime<Utc>>,
    pub device_limit: i32,
    pub speed_limit_mbps: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub login_attempts: i32,
    pub subscription_token: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn status(&self) -> UserStatus {
        self.status.parse().unwrap_or(UserStatus::Disabled)
    }

    /// `traffic_quota < 0` means unlimited, `0` means none.
    pub fn quota_exceeded(&self) -> bool {
        self.traffic_quota > 0 && self.traffic_used > self.traffic_quota
    }
}
