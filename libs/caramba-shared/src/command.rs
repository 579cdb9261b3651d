use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Command kinds a `PendingCommand` may carry. `RESTART_SERVICE` and
/// `APPLY_CONFIG` are internal — the facade never lets a caller enqueue them
/// directly, only the Session Manager (`RestartSingBox`) and the config-push
/// path do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    AddUser,
    RemoveUser,
    UpdateUser,
    EnableUser,
    DisableUser,
    ResetTraffic,
    RestartService,
    ApplyConfig,
}

/// A single outbound instruction for an agent. The parameter map is opaque
/// to the Command Queue — it only routes on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommand {
    pub command_id: String,
    pub node_id: String,
    pub kind: CommandKind,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl PendingCommand {
    pub fn new(node_id: impl Into<String>, kind: CommandKind, params: HashMap<String, serde_json::Value>) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            kind,
            params,
            created_at: Utc::now(),
        }
    }
}
