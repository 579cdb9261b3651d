use serde::{Deserialize, Serialize};

/// Backing row for `UpdateGlobalConfig`/`GetGlobalConfig`. A plain
/// string key/value table, same role as the host's settings service but
/// without the host's decoy/kill-switch-specific keys.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GlobalSetting {
    pub key: String,
    pub value: String,
}
