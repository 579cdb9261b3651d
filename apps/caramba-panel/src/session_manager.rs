//! C4: RegisterNode / Heartbeat / GetNodeStatus / RestartSingBox, plus the
//! background reaper. Grounded on the host's `api/v2/node.rs` handlers for
//! persistence-then-registry ordering and on `connection_service.rs`'s
//! `tokio::time::interval` periodic-task shape for the reaper loop.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use caramba_shared::command::{CommandKind, PendingCommand};
use caramba_shared::node_plane::{
    ExecuteUserCommandResponse, GetNodeStatusResponse, MetricsSnapshot, NodeStatus, RegisterNodeResponse,
    UpdateConfigResponse,
};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};
use crate::registry::RegistryEnqueueError;
use crate::state::AppState;

/// RegisterNode: persistence write commits before the Registry is
/// touched so a storage failure can never leave a node
/// "online in memory but absent in store".
pub async fn register_node(
    state: &AppState,
    node_id: &str,
    name: &str,
    host: &str,
    port: i32,
    version: Option<&str>,
) -> ControlResult<RegisterNodeResponse> {
    validate_node_id(node_id)?;

    state
        .nodes
        .upsert_on_register(node_id, name, host, port, version)
        .await
        .context("register_node: persistence upsert failed")?;

    state.registry.publish_register(node_id).await;

    Ok(RegisterNodeResponse {
        success: true,
        message: "registered".to_string(),
    })
}

fn validate_node_id(node_id: &str) -> ControlResult<()> {
    if node_id.is_empty() {
        return Err(ControlError::InvalidArgument("node_id must not be empty".into()));
    }
    Ok(())
}

/// Heartbeat: requires a pre-existing Registry entry, updates
/// liveness/status, drains the node's queue. Persistence is only touched
/// when the status actually changed — the low-cadence ticker in
/// [`persist_heartbeats_periodically`] covers the common case.
pub async fn heartbeat(
    state: &AppState,
    node_id: &str,
    status: NodeStatus,
) -> ControlResult<(bool, Vec<PendingCommand>)> {
    if !state.registry.contains(node_id).await {
        return Err(ControlError::NotFound(format!("node {node_id} is not registered")));
    }

    let previous_status = match state.registry.get(node_id).await {
        Some(entry) => Some(entry.read().await.status),
        None => None,
    };

    state.registry.record_heartbeat(node_id, status).await;

    if previous_status != Some(status) {
        state
            .nodes
            .persist_heartbeat(node_id, status.as_str())
            .await
            .context("heartbeat: failed to persist status change")?;
    }

    let commands = state.registry.drain(node_id).await;
    Ok((true, commands))
}

pub async fn get_node_status(state: &AppState, node_id: &str) -> ControlResult<GetNodeStatusResponse> {
    if let Some(entry) = state.registry.get(node_id).await {
        let live = entry.read().await;
        return Ok(GetNodeStatusResponse {
            status: live.status,
            metrics: live.metrics.clone(),
            config_version: live.config_version,
        });
    }

    let node = state
        .nodes
        .get(node_id)
        .await
        .context("get_node_status: persistence fallback failed")?
        .ok_or_else(|| ControlError::NotFound(format!("node {node_id} not found")))?;

    Ok(GetNodeStatusResponse {
        status: node.status(),
        metrics: Some(MetricsSnapshot {
            cpu_percent: node.cpu_percent,
            mem_percent: node.mem_percent,
            disk_percent: node.disk_percent,
            load1: node.load1,
            load5: node.load5,
            load15: node.load15,
            in_bps: node.in_bps,
            out_bps: node.out_bps,
            active_connections: node.active_connections.map(|v| v as u32),
            collected_at: None,
        }),
        config_version: node.config_version,
    })
}

/// RestartSingBox: enqueues an internal `RESTART_SERVICE` command.
pub async fn restart_sing_box(state: &AppState, node_id: &str, reason: Option<&str>) -> ControlResult<bool> {
    let mut params = HashMap::new();
    if let Some(r) = reason {
        params.insert("reason".to_string(), serde_json::Value::String(r.to_string()));
    }
    let cmd = PendingCommand::new(node_id, CommandKind::RestartService, params);
    match state.registry.enqueue(node_id, cmd).await {
        Ok(()) => Ok(true),
        Err(RegistryEnqueueError::NodeUnknown) => Err(ControlError::NotFound(format!("node {node_id} not found"))),
        Err(RegistryEnqueueError::QueueFull) => {
            Err(ControlError::ResourceExhausted(format!("command queue full for node {node_id}")))
        }
    }
}

/// UpdateConfig: the agent's declarative config pull, triggered by an
/// `APPLY_CONFIG` pending command or as a cheap idempotent poll. Content is
/// the full global settings table; the hash lets the agent no-op on a
/// repeated pull when nothing changed.
pub async fn update_config(state: &AppState, node_id: &str) -> ControlResult<UpdateConfigResponse> {
    let entries = state.settings.list().await.context("update_config: failed to load settings")?;
    let content: HashMap<String, String> = entries.into_iter().map(|e| (e.key, e.value)).collect();
    let content = serde_json::to_value(&content).context("update_config: failed to serialize settings")?;

    let mut hasher = Sha256::new();
    hasher.update(content.to_string().as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let config_version = match state.registry.get(node_id).await {
        Some(entry) => entry.read().await.config_version,
        None => state
            .nodes
            .get(node_id)
            .await
            .context("update_config: persistence fallback failed")?
            .ok_or_else(|| ControlError::NotFound(format!("node {node_id} not found")))?
            .config_version,
    };

    Ok(UpdateConfigResponse { config_version, hash, content })
}

/// ExecuteUserCommand: resolves the authoritative full state for a
/// user named in a `PendingCommand`'s parameter map. An absent user is not
/// an error — the executor treats it as an implicit REMOVE_USER.
pub async fn execute_user_command(state: &AppState, user_id: &str) -> ControlResult<ExecuteUserCommandResponse> {
    let user = state
        .users
        .get(user_id)
        .await
        .context("execute_user_command: failed to look up user")?;

    let user = match user {
        Some(u) => Some(serde_json::to_value(&u).context("execute_user_command: failed to serialize user")?),
        None => None,
    };

    Ok(ExecuteUserCommandResponse { success: true, user })
}

/// reaper: periodic scan taking the map read lock, then per-entry
/// write locks — never both at once (mirrored in [`Registry::snapshot`]).
/// Interval is tied to `heartbeat_interval`.
pub async fn run_reaper(state: Arc<AppState>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reap_once(&state).await {
                    tracing::error!(error = %e, "reaper iteration failed");
                }
            }
            _ = shutdown.changed() => {
                info!("reaper received shutdown signal, exiting after current iteration");
                break;
            }
        }
    }
}

async fn reap_once(state: &AppState) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let heartbeat_timeout = chrono::Duration::from_std(state.config.heartbeat_timeout())?;
    let max_offline = chrono::Duration::from_std(state.config.max_offline_time())?;

    for (node_id, last_heartbeat, status) in state.registry.snapshot().await {
        let age = now - last_heartbeat;

        if age > max_offline {
            state.registry.evict(&node_id).await;
            state
                .nodes
                .set_status(&node_id, NodeStatus::Offline.as_str())
                .await
                .context("reaper: failed to persist eviction status")?;
            warn!(node_id, age_secs = age.num_seconds(), "reaper evicted stale node");
            continue;
        }

        if age > heartbeat_timeout && status == NodeStatus::Online {
            state.registry.set_status(&node_id, NodeStatus::Offline).await;
            state
                .nodes
                .set_status(&node_id, NodeStatus::Offline.as_str())
                .await
                .context("reaper: failed to persist offline transition")?;
            info!(node_id, age_secs = age.num_seconds(), "reaper marked node offline");
        }
    }

    Ok(())
}

/// Lower-cadence ticker that persists `last_heartbeat` for every node that
/// is still online in the Registry, bounding write load without
/// requiring every heartbeat to hit Postgres.
pub async fn persist_heartbeats_periodically(state: Arc<AppState>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let period = state.config.heartbeat_interval() * 4;
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (node_id, _, status) in state.registry.snapshot().await {
                    if status == NodeStatus::Online {
                        if let Err(e) = state.nodes.persist_heartbeat(&node_id, status.as_str()).await {
                            tracing::error!(node_id, error = %e, "periodic heartbeat persistence failed");
                        }
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_empty_node_id() {
        // Calls the same `validate_node_id` that `register_node` itself
        // calls first, so a regression there fails this test directly.
        assert!(matches!(
            validate_node_id(""),
            Err(ControlError::InvalidArgument(_))
        ));
        assert!(validate_node_id("node-A").is_ok());
    }
}
