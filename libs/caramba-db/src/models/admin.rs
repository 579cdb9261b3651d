use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator account gating the Management Plane. Authentication mechanics
/// (session/JWT issuance) are out of scope; this is just the row and
/// the credential check the out-of-scope auth middleware would consult.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminAccount {
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}
