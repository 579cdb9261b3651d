//! C6: Management Facade. Node/User/Plan CRUD, BatchUserOperation,
//! GetSystemOverview, GlobalConfig. Ported from the host's HTML-template
//! admin handlers (`handlers/admin/nodes.rs`, `.../users.rs`) to JSON RPC
//! handlers, since the HTTP gateway/templating layer is out of scope
//! and drives the same repositories underneath.

use std::collections::HashMap;

use anyhow::Context as _;
use caramba_db::repositories::node_repo::UpdateNodeConfigFields;
use caramba_db::repositories::plan_repo::UpsertPlanFields;
use caramba_db::repositories::user_repo::{CreateUserFields, UpdateUserFields};
use caramba_shared::command::{CommandKind, PendingCommand};
use caramba_shared::management::{
    BatchOp, BatchSubResult, BatchUserOperationResponse, NodeView, Page, PageRequest, PlanView, SubResultStatus,
    SystemOverview, TrafficQuery, TrafficRecordView, UpdateNodeConfigRequest, UpdateUserRequest, UserStatus, UserView,
};
use caramba_shared::node_plane::{MetricsSnapshot, NodeStatus};

use crate::error::{ControlError, ControlResult};
use crate::registry::RegistryEnqueueError;
use crate::state::AppState;

fn node_to_view(node: caramba_db::models::Node) -> NodeView {
    NodeView {
        node_id: node.node_id,
        name: node.name,
        host: node.host,
        port: node.port as u16,
        status: node.status(),
        last_heartbeat: node.last_heartbeat,
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
        cumulative_upload: node.cumulative_upload,
        cumulative_download: node.cumulative_download,
        current_users: node.current_users,
        max_users: node.max_users,
        config_version: node.config_version,
        sing_box_version: node.sing_box_version,
    }
}

fn user_to_view(user: caramba_db::models::User) -> UserView {
    UserView {
        user_id: user.user_id,
        username: user.username,
        email: user.email,
        status: user.status(),
        plan_id: user.plan_id,
        traffic_quota: user.traffic_quota,
        traffic_used: user.traffic_used,
        traffic_reset_at: user.traffic_reset_at,
        device_limit: user.device_limit,
        speed_limit_mbps: user.speed_limit_mbps,
        expires_at: user.expires_at,
        locked_until: user.locked_until,
        login_attempts: user.login_attempts,
        subscription_token: user.subscription_token,
    }
}

fn plan_to_view(plan: caramba_db::models::Plan, current_users: i32) -> PlanView {
    PlanView {
        plan_id: plan.plan_id,
        name: plan.name,
        period_days: plan.period_days,
        price_cents: plan.price_cents,
        traffic_quota: plan.traffic_quota,
        device_limit: plan.device_limit,
        speed_limit_mbps: plan.speed_limit_mbps,
        connection_limit: plan.connection_limit,
        enabled: plan.enabled,
        current_users,
        max_users: plan.max_users,
    }
}

// ---------------------------------------------------------------- Nodes ---

pub async fn list_nodes(state: &AppState, page: PageRequest) -> ControlResult<Page<NodeView>> {
    let (page_num, page_size) = page.normalize();
    let (nodes, total) = state
        .nodes
        .list(page.offset(), page_size)
        .await
        .context("list_nodes failed")?;
    Ok(Page {
        items: nodes.into_iter().map(node_to_view).collect(),
        page: page_num,
        page_size,
        total,
    })
}

pub async fn get_node(state: &AppState, node_id: &str) -> ControlResult<NodeView> {
    let node = state
        .nodes
        .get(node_id)
        .await
        .context("get_node failed")?
        .ok_or_else(|| ControlError::NotFound(format!("node {node_id} not found")))?;
    Ok(node_to_view(node))
}

pub async fn remove_node(state: &AppState, node_id: &str) -> ControlResult<()> {
    let affected = state.nodes.delete(node_id).await.context("remove_node failed")?;
    if affected == 0 {
        return Err(ControlError::NotFound(format!("node {node_id} not found")));
    }
    state.registry.evict(node_id).await;
    Ok(())
}

pub async fn update_node_config(state: &AppState, req: UpdateNodeConfigRequest) -> ControlResult<NodeView> {
    let status_str = req.status.map(|s| s.as_str());
    state
        .nodes
        .update_config(&UpdateNodeConfigFields {
            node_id: &req.node_id,
            name: req.name.as_deref(),
            host: req.host.as_deref(),
            port: req.port.map(i32::from),
            max_users: req.max_users,
            status: status_str,
        })
        .await
        .context("update_node_config failed")?;

    if let Some(status) = req.status {
        state.registry.set_status(&req.node_id, status).await;
    }
    state.registry.bump_config_version(&req.node_id).await;

    get_node(state, &req.node_id).await
}

// ---------------------------------------------------------------- Users ---

pub async fn create_user(
    state: &AppState,
    username: &str,
    email: &str,
    password_hash: &str,
    plan_id: Option<&str>,
    traffic_quota: i64,
    device_limit: i32,
    speed_limit_mbps: i32,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
) -> ControlResult<UserView> {
    if state.users.username_taken(username).await.context("username_taken check failed")? {
        return Err(ControlError::AlreadyExists(format!("username {username} already taken")));
    }
    if state.users.email_taken(email).await.context("email_taken check failed")? {
        return Err(ControlError::AlreadyExists(format!("email {email} already in use")));
    }

    let user_id = uuid::Uuid::new_v4().to_string();
    let subscription_token = uuid::Uuid::new_v4().simple().to_string();

    let user = state
        .users
        .create(&CreateUserFields {
            user_id: &user_id,
            username,
            email,
            password_hash,
            plan_id,
            traffic_quota,
            device_limit,
            speed_limit_mbps,
            expires_at,
            subscription_token: &subscription_token,
        })
        .await
        .context("create_user failed")?;

    // A newly created user is agent-visible state too, same as any
    // later update, so every registered node needs the matching command.
    enqueue_for_users_nodes(state, &user_id, CommandKind::AddUser, HashMap::new()).await;

    Ok(user_to_view(user))
}

pub async fn get_user(state: &AppState, user_id: &str) -> ControlResult<UserView> {
    let user = state
        .users
        .get(user_id)
        .await
        .context("get_user failed")?
        .ok_or_else(|| ControlError::NotFound(format!("user {user_id} not found")))?;
    Ok(user_to_view(user))
}

pub async fn list_users(state: &AppState, page: PageRequest) -> ControlResult<Page<UserView>> {
    let (page_num, page_size) = page.normalize();
    let (users, total) = state
        .users
        .list(page.offset(), page_size)
        .await
        .context("list_users failed")?;
    Ok(Page {
        items: users.into_iter().map(user_to_view).collect(),
        page: page_num,
        page_size,
        total,
    })
}

pub async fn update_user(state: &AppState, user_id: &str, req: UpdateUserRequest) -> ControlResult<UserView> {
    let status_str = req.status.map(|s| s.as_str());
    let updated = state
        .users
        .update(&UpdateUserFields {
            user_id,
            username: req.username.as_deref(),
            email: req.email.as_deref(),
            status: status_str,
            plan_id: req.plan_id.as_deref(),
            traffic_quota: req.traffic_quota,
            device_limit: req.device_limit,
            speed_limit_mbps: req.speed_limit_mbps,
            expires_at: req.expires_at,
        })
        .await
        .context("update_user failed")?
        .ok_or_else(|| ControlError::NotFound(format!("user {user_id} not found")))?;

    enqueue_for_users_nodes(state, user_id, CommandKind::UpdateUser, HashMap::new()).await;

    Ok(user_to_view(updated))
}

pub async fn delete_user(state: &AppState, user_id: &str) -> ControlResult<()> {
    let affected = state.users.delete(user_id).await.context("delete_user failed")?;
    if affected == 0 {
        return Err(ControlError::NotFound(format!("user {user_id} not found")));
    }
    enqueue_for_users_nodes(state, user_id, CommandKind::RemoveUser, HashMap::new()).await;
    Ok(())
}

/// Mutations that change agent-visible state also enqueue the
/// matching command on every node bound to the user. This core has no
/// per-user node-binding table in scope, so "every node bound to that
/// user" degrades to "every currently registered node" — the simplest
/// faithful reading that still exercises the enqueue-after-commit rule.
async fn enqueue_for_users_nodes(
    state: &AppState,
    user_id: &str,
    kind: CommandKind,
    mut params: HashMap<String, serde_json::Value>,
) {
    params.insert("user_id".to_string(), serde_json::Value::String(user_id.to_string()));
    let (nodes, _) = match state.nodes.list(0, i64::MAX / 2).await {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "enqueue_for_users_nodes: failed to list nodes");
            return;
        }
    };
    for node in nodes {
        let cmd = PendingCommand::new(&node.node_id, kind, params.clone());
        if let Err(RegistryEnqueueError::QueueFull) = state.registry.enqueue(&node.node_id, cmd).await {
            tracing::warn!(node_id = %node.node_id, user_id, "command queue full, agent will re-converge via resync");
        }
    }
}

// --------------------------------------------------------------- Plans ----

pub async fn upsert_plan(state: &AppState, fields: &UpsertPlanFields<'_>) -> ControlResult<PlanView> {
    let plan = state.plans.upsert(fields).await.context("upsert_plan failed")?;
    Ok(plan_to_view(plan, 0))
}

pub async fn get_plan(state: &AppState, plan_id: &str) -> ControlResult<PlanView> {
    let plan = state
        .plans
        .get(plan_id)
        .await
        .context("get_plan failed")?
        .ok_or_else(|| ControlError::NotFound(format!("plan {plan_id} not found")))?;
    Ok(plan_to_view(plan, 0))
}

pub async fn delete_plan(state: &AppState, plan_id: &str) -> ControlResult<()> {
    let affected = state.plans.delete(plan_id).await.context("delete_plan failed")?;
    if affected == 0 {
        return Err(ControlError::NotFound(format!("plan {plan_id} not found")));
    }
    Ok(())
}

pub async fn list_plans(state: &AppState, page: PageRequest) -> ControlResult<Page<PlanView>> {
    let (page_num, page_size) = page.normalize();
    let (plans, total) = state.plans.list(page.offset(), page_size).await.context("list_plans failed")?;
    Ok(Page {
        items: plans.into_iter().map(|p| plan_to_view(p, 0)).collect(),
        page: page_num,
        page_size,
        total,
    })
}

// --------------------------------------------------------- Batch op (C6) --

/// BatchUserOperation: per-id result; the call succeeds overall if at
/// least one sub-operation succeeded.
pub async fn batch_user_operation(state: &AppState, user_ids: &[String], op: BatchOp) -> BatchUserOperationResponse {
    let mut results = Vec::with_capacity(user_ids.len());

    for user_id in user_ids {
        let result = match op {
            BatchOp::Enable => set_user_status(state, user_id, UserStatus::Active).await,
            BatchOp::Disable => set_user_status(state, user_id, UserStatus::Disabled).await,
            BatchOp::Delete => delete_user(state, user_id).await,
            BatchOp::ResetTraffic => reset_user_traffic(state, user_id).await,
        };

        let sub = match result {
            Ok(()) => BatchSubResult { user_id: user_id.clone(), status: SubResultStatus::Ok, message: None },
            Err(ControlError::NotFound(msg)) => {
                BatchSubResult { user_id: user_id.clone(), status: SubResultStatus::NotFound, message: Some(msg) }
            }
            Err(ControlError::ResourceExhausted(msg)) => {
                BatchSubResult { user_id: user_id.clone(), status: SubResultStatus::QueueFull, message: Some(msg) }
            }
            Err(e) => BatchSubResult { user_id: user_id.clone(), status: SubResultStatus::Error, message: Some(e.to_string()) },
        };
        results.push(sub);
    }

    finish_batch(results)
}

fn finish_batch(results: Vec<BatchSubResult>) -> BatchUserOperationResponse {
    let success = results.iter().any(|r| r.status == SubResultStatus::Ok);
    BatchUserOperationResponse { success, results }
}

async fn set_user_status(state: &AppState, user_id: &str, status: UserStatus) -> ControlResult<()> {
    let affected = state
        .users
        .set_status(user_id, status.as_str())
        .await
        .context("set_user_status failed")?;
    if affected == 0 {
        return Err(ControlError::NotFound(format!("user {user_id} not found")));
    }
    let kind = match status {
        UserStatus::Active => CommandKind::EnableUser,
        _ => CommandKind::DisableUser,
    };
    enqueue_for_users_nodes(state, user_id, kind, HashMap::new()).await;
    Ok(())
}

async fn reset_user_traffic(state: &AppState, user_id: &str) -> ControlResult<()> {
    state.users.reset_traffic(user_id).await.context("reset_user_traffic failed")?;
    enqueue_for_users_nodes(state, user_id, CommandKind::ResetTraffic, HashMap::new()).await;
    Ok(())
}

fn traffic_record_to_view(rec: caramba_db::models::traffic::TrafficRecord) -> TrafficRecordView {
    TrafficRecordView {
        user_id: rec.user_id,
        node_id: rec.node_id,
        upload: rec.upload,
        download: rec.download,
        total: rec.total,
        connect_time: rec.connect_time,
        disconnect_time: rec.disconnect_time,
        session_id: rec.session_id,
    }
}

/// GetNodeMetrics: the same fresh-from-Registry-with-persistence-fallback
/// read `GetNodeStatus` does, narrowed to the metrics snapshot.
pub async fn get_node_metrics(state: &AppState, node_id: &str) -> ControlResult<MetricsSnapshot> {
    if let Some(entry) = state.registry.get(node_id).await {
        if let Some(metrics) = entry.read().await.metrics.clone() {
            return Ok(metrics);
        }
    }

    let node = state
        .nodes
        .get(node_id)
        .await
        .context("get_node_metrics: persistence fallback failed")?
        .ok_or_else(|| ControlError::NotFound(format!("node {node_id} not found")))?;

    Ok(MetricsSnapshot {
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
    })
}

/// GetUserTraffic / GetNodeTraffic: paginated reads over the append-only
/// ledger (`TrafficRecord`), filtered by whichever side is named.
pub async fn get_user_traffic(state: &AppState, user_id: &str, query: TrafficQuery) -> ControlResult<Page<TrafficRecordView>> {
    let (page_num, page_size) = query.page.normalize();
    let from = query.from.map(|d| d.date_naive()).unwrap_or_else(|| chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
    let to = query.to.map(|d| d.date_naive()).unwrap_or_else(|| chrono::Utc::now().date_naive());

    let (records, total) = state
        .traffic
        .query(Some(user_id), None, from, to, query.page.offset(), page_size)
        .await
        .context("get_user_traffic failed")?;

    Ok(Page {
        items: records.into_iter().map(traffic_record_to_view).collect(),
        page: page_num,
        page_size,
        total,
    })
}

pub async fn get_node_traffic(state: &AppState, node_id: &str, query: TrafficQuery) -> ControlResult<Page<TrafficRecordView>> {
    let (page_num, page_size) = query.page.normalize();
    let from = query.from.map(|d| d.date_naive()).unwrap_or_else(|| chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
    let to = query.to.map(|d| d.date_naive()).unwrap_or_else(|| chrono::Utc::now().date_naive());

    let (records, total) = state
        .traffic
        .query(None, Some(node_id), from, to, query.page.offset(), page_size)
        .await
        .context("get_node_traffic failed")?;

    Ok(Page {
        items: records.into_iter().map(traffic_record_to_view).collect(),
        page: page_num,
        page_size,
        total,
    })
}

// --------------------------------------------------------- System/Config --

pub async fn get_system_overview(state: &AppState) -> ControlResult<SystemOverview> {
    let today = chrono::Utc::now().date_naive();
    let total_nodes = state.nodes.count_total().await.context("count_total nodes failed")?;
    let online_nodes = state.nodes.count_online().await.context("count_online nodes failed")?;
    let total_users = state.users.count_total().await.context("count_total users failed")?;
    let active_users = state.users.count_active().await.context("count_active users failed")?;
    let traffic_today_bytes = state
        .traffic
        .sum_total_between(today, today)
        .await
        .context("sum_total_between failed")?;

    Ok(SystemOverview {
        total_nodes,
        online_nodes,
        total_users,
        active_users,
        traffic_today_bytes,
    })
}

pub async fn get_global_config(state: &AppState) -> ControlResult<HashMap<String, String>> {
    let entries = state.settings.list().await.context("get_global_config failed")?;
    Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
}

pub async fn update_global_config(state: &AppState, key: &str, value: &str) -> ControlResult<()> {
    state.settings.set(key, value).await.context("update_global_config failed")?;
    // Config knobs are agent-visible only on next pull; bump every node's
    // config_version so the existing APPLY_CONFIG/config-hash path picks
    // the change up without a second notification mechanism.
    for (node_id, _, _) in state.registry.snapshot().await {
        state.registry.bump_config_version(&node_id).await;
        let cmd = PendingCommand::new(&node_id, CommandKind::ApplyConfig, HashMap::new());
        let _ = state.registry.enqueue(&node_id, cmd).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_succeeds_if_at_least_one_sub_op_ok() {
        let results = vec![
            BatchSubResult { user_id: "1".into(), status: SubResultStatus::Ok, message: None },
            BatchSubResult { user_id: "2".into(), status: SubResultStatus::NotFound, message: None },
        ];
        assert!(finish_batch(results).success);
    }

    #[test]
    fn batch_fails_if_every_sub_op_failed() {
        let results = vec![
            BatchSubResult { user_id: "1".into(), status: SubResultStatus::NotFound, message: None },
            BatchSubResult { user_id: "2".into(), status: SubResultStatus::Error, message: Some("boom".into()) },
        ];
        assert!(!finish_batch(results).success);
    }
}
