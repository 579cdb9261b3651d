//! Agent-Side Controller. One process per managed node: registers
//! with the control plane, then runs three independent-ticker loops
//! (heartbeat, metrics, traffic) plus a single-worker command executor.
//! Grounded on the host's own `caramba-node` main loop for the
//! register-then-loop shape, `sysinfo`-based telemetry collection, and the
//! host panel's `connection_service.rs` for querying the local sing-box
//! clash API (`127.0.0.1:9090`) as the traffic source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use caramba_shared::command::{CommandKind, PendingCommand};
use caramba_shared::node_plane::{
    ExecuteUserCommandRequest, ExecuteUserCommandResponse, HeartbeatRequest, HeartbeatResponse, MetricsSnapshot,
    RegisterNodeRequest, RegisterNodeResponse, ReportMetricsRequest, ReportMetricsResponse, ReportTrafficRequest,
    ReportTrafficResponse, UpdateConfigRequest, UpdateConfigResponse, UserTrafficEntry,
};
use clap::{Parser, Subcommand};
use rand::Rng;
use sysinfo::System;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

mod executor;

use executor::LocalProxySupervisor;

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the crate version and exit.
    Version,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file; missing file is not an error, matching
    /// the control-api's own `--config` contract. Values
    /// are applied as env-var defaults, so an explicitly-set env var or
    /// flag still wins.
    #[arg(short = 'c', long, env = "AGENT_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Control plane base URL (e.g. https://control.example.com). Required
    /// unless running the `version` subcommand.
    #[arg(long, env = "CONTROL_URL")]
    control_url: Option<String>,

    /// Node identity; auto-generated and persisted on first run if omitted.
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    #[arg(long, env = "NODE_NAME", default_value = "node")]
    name: String,

    #[arg(long, env = "NODE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "NODE_PORT", default_value_t = 443)]
    port: u16,

    /// Local sing-box config path, written by the command executor.
    #[arg(long, env = "CONFIG_PATH", default_value = "/etc/sing-box/config.json")]
    config_path: String,

    /// File the generated node_id is persisted to when `--node-id` is absent.
    #[arg(long, env = "NODE_ID_FILE", default_value = "/etc/sing-box/node_id")]
    node_id_file: String,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    heartbeat_interval_secs: u64,

    #[arg(long, env = "SYSTEM_METRICS_INTERVAL_SECS", default_value_t = 30)]
    system_metrics_interval_secs: u64,

    #[arg(long, env = "TRAFFIC_REPORT_INTERVAL_SECS", default_value_t = 300)]
    traffic_report_interval_secs: u64,

    #[arg(long, env = "MAX_OFFLINE_TIME_SECS", default_value_t = 300)]
    max_offline_time_secs: u64,
}

/// Per-user cumulative counters this agent last saw locally, used to derive
/// the deltas the control plane expects on the wire.
type TrafficBaselines = HashMap<String, (u64, u64)>;

/// Bounded local buffer: holds `UserTrafficEntry`s collected
/// while the control plane is unreachable. Oldest entries drop on overflow.
struct TrafficBuffer {
    capacity: usize,
    entries: std::collections::VecDeque<UserTrafficEntry>,
}

impl TrafficBuffer {
    fn new(capacity: usize) -> Self {
        Self { capacity, entries: std::collections::VecDeque::with_capacity(capacity.min(64)) }
    }

    fn push(&mut self, entry: UserTrafficEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            warn!(capacity = self.capacity, "local traffic buffer full, dropping oldest entry");
        }
        self.entries.push_back(entry);
    }

    fn drain(&mut self) -> Vec<UserTrafficEntry> {
        self.entries.drain(..).collect()
    }
}

/// File-backed defaults for the handful of settings an operator is likely
/// to pin per-node rather than pass on every invocation (`--config <path>`,
/// mirroring control-api's own optional-TOML contract).
/// CLI flags and env vars still take precedence when present.
#[derive(Debug, Default, serde::Deserialize)]
struct AgentFileConfig {
    control_url: Option<String>,
    node_id: Option<String>,
}

fn load_agent_config_file(path: &str) -> Result<Option<AgentFileConfig>> {
    if !std::path::Path::new(path).exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read config file {path}"))?;
    let cfg = toml::from_str(&raw).with_context(|| format!("failed to parse config file {path}"))?;
    Ok(Some(cfg))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();

    if matches!(args.command, Some(Command::Version)) {
        println!("caramba-node {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let file_config = args.config.as_deref().map(load_agent_config_file).transpose()?.flatten();

    let control_url = args
        .control_url
        .clone()
        .or_else(|| file_config.as_ref().and_then(|c| c.control_url.clone()))
        .context("control_url must be set via --control-url, CONTROL_URL, or --config")?;
    let control_url = normalize_url(&control_url);

    let node_id_hint = args.node_id.clone().or_else(|| file_config.as_ref().and_then(|c| c.node_id.clone()));
    let node_id = resolve_node_id(node_id_hint, &args.node_id_file).context("failed to resolve node identity")?;

    info!(node_id = %node_id, control_url = %control_url, "caramba-node agent starting");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    register_with_backoff(&client, &control_url, &node_id, &args.name, &args.host, args.port).await?;

    let supervisor = Arc::new(Mutex::new(LocalProxySupervisor::new(PathBuf::from(&args.config_path))));
    let baselines: Arc<Mutex<TrafficBaselines>> = Arc::new(Mutex::new(HashMap::new()));
    let buffer: Arc<Mutex<TrafficBuffer>> = Arc::new(Mutex::new(TrafficBuffer::new(1000)));

    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingCommand>(256);
    tokio::spawn(run_command_executor(cmd_rx, supervisor, client.clone(), control_url.clone(), node_id.clone()));

    let last_contact = Arc::new(Mutex::new(std::time::Instant::now()));
    let max_offline = Duration::from_secs(args.max_offline_time_secs);

    let heartbeat_task = tokio::spawn(run_heartbeat_loop(
        client.clone(),
        control_url.clone(),
        node_id.clone(),
        Duration::from_secs(args.heartbeat_interval_secs),
        cmd_tx,
        last_contact.clone(),
    ));

    let metrics_task = tokio::spawn(run_metrics_loop(
        client.clone(),
        control_url.clone(),
        node_id.clone(),
        Duration::from_secs(args.system_metrics_interval_secs),
    ));

    let traffic_task = tokio::spawn(run_traffic_loop(
        client.clone(),
        control_url.clone(),
        node_id.clone(),
        Duration::from_secs(args.traffic_report_interval_secs),
        baselines,
        buffer,
    ));

    let reconnect_task = tokio::spawn(run_reconnect_monitor(
        client,
        control_url,
        node_id,
        args.name,
        args.host,
        args.port,
        last_contact,
        max_offline,
    ));

    let _ = tokio::join!(heartbeat_task, metrics_task, traffic_task, reconnect_task);

    Ok(())
}

fn normalize_url(raw: &str) -> String {
    let mut url = raw.trim().to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("https://{url}");
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// Resolves the identity this agent registers under. An explicit `--node-id`
/// wins; otherwise a previously persisted id is reused so restarts register
/// idempotently — re-registration under the same id is always safe.
fn resolve_node_id(explicit: Option<String>, node_id_file: &str) -> Result<String> {
    if let Some(id) = explicit {
        return Ok(id);
    }

    let path = PathBuf::from(node_id_file);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let generated = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&path, &generated) {
        warn!(error = %e, path = %path.display(), "failed to persist generated node_id, will re-generate on next restart");
    }
    Ok(generated)
}

/// Exponential-ish backoff starting at 1s, capped at 30s, for
/// a bounded number of attempts before giving up. A little jitter keeps a
/// fleet of nodes that all lost the control plane at once from retrying in
/// lockstep.
fn jittered(delay: Duration) -> Duration {
    let jitter_ms = rand::rng().random_range(0..250);
    delay + Duration::from_millis(jitter_ms)
}

async fn register_with_backoff(
    client: &reqwest::Client,
    control_url: &str,
    node_id: &str,
    name: &str,
    host: &str,
    port: u16,
) -> Result<()> {
    const MAX_ATTEMPTS: u32 = 10;
    let mut delay = Duration::from_secs(1);

    for attempt in 1..=MAX_ATTEMPTS {
        match try_register(client, control_url, node_id, name, host, port).await {
            Ok(resp) if resp.success => {
                info!(attempt, "registered with control plane");
                return Ok(());
            }
            Ok(resp) => {
                warn!(attempt, message = %resp.message, "registration rejected");
            }
            Err(e) => {
                warn!(attempt, error = %e, "registration attempt failed");
            }
        }

        if attempt == MAX_ATTEMPTS {
            anyhow::bail!("exhausted {MAX_ATTEMPTS} registration attempts");
        }

        tokio::time::sleep(jittered(delay)).await;
        delay = (delay * 2).min(Duration::from_secs(30));
    }

    unreachable!()
}

async fn try_register(
    client: &reqwest::Client,
    control_url: &str,
    node_id: &str,
    name: &str,
    host: &str,
    port: u16,
) -> Result<RegisterNodeResponse> {
    let req = RegisterNodeRequest {
        node_id: node_id.to_string(),
        name: name.to_string(),
        host: host.to_string(),
        port,
        capability: None,
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };

    client
        .post(format!("{control_url}/v1/agent/register"))
        .json(&req)
        .send()
        .await
        .context("register request failed")?
        .error_for_status()
        .context("register returned an error status")?
        .json::<RegisterNodeResponse>()
        .await
        .context("failed to parse register response")
}

/// Heartbeat loop: send current status, dispatch every
/// returned `PendingCommand` to the executor.
async fn run_heartbeat_loop(
    client: reqwest::Client,
    control_url: String,
    node_id: String,
    interval: Duration,
    cmd_tx: mpsc::Sender<PendingCommand>,
    last_contact: Arc<Mutex<std::time::Instant>>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let req = HeartbeatRequest { node_id: node_id.clone(), status: caramba_shared::node_plane::NodeStatus::Online };
        match client.post(format!("{control_url}/v1/agent/heartbeat")).json(&req).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<HeartbeatResponse>().await {
                Ok(body) => {
                    *last_contact.lock().await = std::time::Instant::now();
                    for cmd in body.pending_commands {
                        if cmd_tx.send(cmd).await.is_err() {
                            error!("command executor channel closed");
                            break;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to parse heartbeat response"),
            },
            Ok(resp) => warn!(status = %resp.status(), "heartbeat rejected by control plane"),
            Err(e) => warn!(error = %e, "heartbeat request failed, retrying next tick"),
        }
    }
}

/// Metrics loop: cpu/mem/disk/load/net/active_connections.
async fn run_metrics_loop(client: reqwest::Client, control_url: String, node_id: String, interval: Duration) {
    let mut sys = System::new_with_specifics(
        sysinfo::RefreshKind::nothing()
            .with_cpu(sysinfo::CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    sys.refresh_all();

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let total_mem = sys.total_memory();
        let mem_percent = if total_mem > 0 { Some((sys.used_memory() as f64 / total_mem as f64) * 100.0) } else { None };
        let load = System::load_average();

        let metrics = MetricsSnapshot {
            cpu_percent: Some(sys.global_cpu_usage() as f64),
            mem_percent,
            disk_percent: None,
            load1: Some(load.one),
            load5: Some(load.five),
            load15: Some(load.fifteen),
            in_bps: None,
            out_bps: None,
            active_connections: count_active_connections(),
            collected_at: Some(chrono::Utc::now()),
        };

        let req = ReportMetricsRequest { node_id: node_id.clone(), metrics };
        match client.post(format!("{control_url}/v1/agent/metrics")).json(&req).send().await {
            Ok(resp) if resp.status().is_success() => {
                let _ = resp.json::<ReportMetricsResponse>().await;
            }
            Ok(resp) => warn!(status = %resp.status(), "report_metrics rejected"),
            Err(e) => warn!(error = %e, "report_metrics request failed, retrying next tick"),
        }
    }
}

fn count_active_connections() -> Option<u32> {
    let output = std::process::Command::new("ss").args(["-t", "-n", "-p", "state", "established"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Some(stdout.lines().filter(|line| line.contains("sing-box")).count() as u32)
}

/// Traffic loop: pulls per-connection counters from the local
/// sing-box clash API, derives per-user deltas against the last-seen
/// cumulative baseline, and reports them. Buffers on send failure.
async fn run_traffic_loop(
    client: reqwest::Client,
    control_url: String,
    node_id: String,
    interval: Duration,
    baselines: Arc<Mutex<TrafficBaselines>>,
    buffer: Arc<Mutex<TrafficBuffer>>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        match query_local_connections(&client).await {
            Ok(totals) => {
                let mut baselines = baselines.lock().await;
                let mut buffer = buffer.lock().await;
                for (user_id, (cum_upload, cum_download)) in totals {
                    let (prev_upload, prev_download) = baselines.get(&user_id).copied().unwrap_or((0, 0));

                    let upload_delta = cum_upload.checked_sub(prev_upload).unwrap_or_else(|| {
                        warn!(user_id = %user_id, "negative upload delta, proxy counters likely reset");
                        0
                    });
                    let download_delta = cum_download.checked_sub(prev_download).unwrap_or_else(|| {
                        warn!(user_id = %user_id, "negative download delta, proxy counters likely reset");
                        0
                    });

                    baselines.insert(user_id.clone(), (cum_upload, cum_download));

                    if upload_delta == 0 && download_delta == 0 {
                        continue;
                    }

                    buffer.push(UserTrafficEntry {
                        user_id,
                        upload_bytes: upload_delta,
                        download_bytes: download_delta,
                        session_id: None,
                        connect_time: Some(chrono::Utc::now()),
                        disconnect_time: None,
                    });
                }
            }
            Err(e) => debug!(error = %e, "local connection query failed, nothing to report this tick"),
        }

        let pending: Vec<UserTrafficEntry> = buffer.lock().await.drain();
        if pending.is_empty() {
            continue;
        }

        let req = ReportTrafficRequest { node_id: node_id.clone(), entries: pending.clone() };
        match client.post(format!("{control_url}/v1/agent/traffic")).json(&req).send().await {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(body) = resp.json::<ReportTrafficResponse>().await {
                    if !body.quota_exceeded.is_empty() {
                        info!(users = ?body.quota_exceeded, "control plane reported quota-exceeded users");
                    }
                }
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "report_traffic rejected, re-buffering entries");
                let mut buffer = buffer.lock().await;
                for entry in pending {
                    buffer.push(entry);
                }
            }
            Err(e) => {
                warn!(error = %e, "report_traffic request failed, re-buffering entries");
                let mut buffer = buffer.lock().await;
                for entry in pending {
                    buffer.push(entry);
                }
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct ClashConnectionsResponse {
    #[serde(default)]
    connections: Vec<ClashConnection>,
}

#[derive(serde::Deserialize)]
struct ClashConnection {
    metadata: ClashConnectionMetadata,
    upload: u64,
    download: u64,
}

#[derive(serde::Deserialize)]
struct ClashConnectionMetadata {
    #[serde(default)]
    user: Option<String>,
}

/// Queries the node's own sing-box clash API (same port the host panel's
/// `connection_service.rs` queries remotely) for live per-connection
/// cumulative counters, aggregated per user tag.
async fn query_local_connections(client: &reqwest::Client) -> Result<HashMap<String, (u64, u64)>> {
    let resp: ClashConnectionsResponse = client
        .get("http://127.0.0.1:9090/connections")
        .timeout(Duration::from_secs(3))
        .send()
        .await
        .context("clash API request failed")?
        .json()
        .await
        .context("failed to parse clash API response")?;

    let mut totals: HashMap<String, (u64, u64)> = HashMap::new();
    for conn in resp.connections {
        let Some(user_id) = conn.metadata.user else { continue };
        let entry = totals.entry(user_id).or_insert((0, 0));
        entry.0 += conn.upload;
        entry.1 += conn.download;
    }
    Ok(totals)
}

/// Single worker, commands on one node execute serially.
/// Executor failures are logged and dropped — the control plane's next
/// convergence pass is authoritative, never a re-report from here.
///
/// `PendingCommand.params` is intentionally minimal (just a `user_id`) per
/// `ExecuteUserCommandRequest`'s own contract, so AddUser/UpdateUser resolve
/// the full current user record via `ExecuteUserCommand` before applying it
/// locally — an absent user there means it was deleted after the command was
/// enqueued, which this treats as an implicit RemoveUser.
async fn run_command_executor(
    mut rx: mpsc::Receiver<PendingCommand>,
    supervisor: Arc<Mutex<LocalProxySupervisor>>,
    client: reqwest::Client,
    control_url: String,
    node_id: String,
) {
    while let Some(cmd) = rx.recv().await {
        let kind = cmd.kind;
        let result = match kind {
            CommandKind::AddUser | CommandKind::UpdateUser => {
                apply_user_command(&client, &control_url, &node_id, &cmd, &supervisor).await
            }
            CommandKind::RemoveUser => supervisor.lock().await.remove_user(&cmd.params).await,
            CommandKind::EnableUser => supervisor.lock().await.set_user_enabled(&cmd.params, true).await,
            CommandKind::DisableUser => supervisor.lock().await.set_user_enabled(&cmd.params, false).await,
            CommandKind::ResetTraffic => supervisor.lock().await.reset_user_counter(&cmd.params).await,
            CommandKind::RestartService => supervisor.lock().await.restart_service().await,
            CommandKind::ApplyConfig => apply_config_command(&client, &control_url, &node_id, &supervisor).await,
        };

        if let Err(e) = result {
            error!(command_id = %cmd.command_id, kind = ?kind, error = %e, "command execution failed, control plane convergence will retry");
        }
    }
}

async fn apply_user_command(
    client: &reqwest::Client,
    control_url: &str,
    node_id: &str,
    cmd: &PendingCommand,
    supervisor: &Arc<Mutex<LocalProxySupervisor>>,
) -> Result<()> {
    let user_id = cmd
        .params
        .get("user_id")
        .and_then(serde_json::Value::as_str)
        .context("command params missing user_id")?
        .to_string();

    let req = ExecuteUserCommandRequest { node_id: node_id.to_string(), command_id: cmd.command_id.clone(), user_id: user_id.clone() };
    let resp: ExecuteUserCommandResponse = client
        .post(format!("{control_url}/v1/agent/execute-command"))
        .json(&req)
        .send()
        .await
        .context("execute_user_command request failed")?
        .error_for_status()
        .context("execute_user_command returned an error status")?
        .json()
        .await
        .context("failed to parse execute_user_command response")?;

    let mut supervisor = supervisor.lock().await;
    match resp.user {
        Some(user) => {
            let mut params: HashMap<String, serde_json::Value> = user
                .as_object()
                .context("execute_user_command returned a non-object user")?
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            params.entry("user_id".to_string()).or_insert(serde_json::Value::String(user_id));
            supervisor.upsert_user(&params).await
        }
        None => supervisor.remove_user(&cmd.params).await,
    }
}

/// APPLY_CONFIG: pulls the control plane's current settings blob, writes it
/// into the local config, then restarts sing-box so the change takes effect.
async fn apply_config_command(
    client: &reqwest::Client,
    control_url: &str,
    node_id: &str,
    supervisor: &Arc<Mutex<LocalProxySupervisor>>,
) -> Result<()> {
    let req = UpdateConfigRequest { node_id: node_id.to_string() };
    let resp: UpdateConfigResponse = client
        .post(format!("{control_url}/v1/agent/config"))
        .json(&req)
        .send()
        .await
        .context("update_config request failed")?
        .error_for_status()
        .context("update_config returned an error status")?
        .json()
        .await
        .context("failed to parse update_config response")?;

    info!(config_version = resp.config_version, hash = %resp.hash, "applying pulled config");

    let mut supervisor = supervisor.lock().await;
    supervisor.apply_settings(&resp.content).await?;
    supervisor.reload().await
}

/// "Connection loss handling": a separate low-cadence watcher declares
/// a Reconnect once the heartbeat loop has gone quiet for longer than half
/// `max_offline_time`, re-dialing and re-registering (idempotent on the
/// server per its upsert-on-register contract).
async fn run_reconnect_monitor(
    client: reqwest::Client,
    control_url: String,
    node_id: String,
    name: String,
    host: String,
    port: u16,
    last_contact: Arc<Mutex<std::time::Instant>>,
    max_offline: Duration,
) {
    let threshold = max_offline / 2;
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        let elapsed = last_contact.lock().await.elapsed();
        if elapsed > threshold {
            warn!(elapsed_secs = elapsed.as_secs(), "sustained heartbeat failure, reconnecting");
            match register_with_backoff(&client, &control_url, &node_id, &name, &host, port).await {
                Ok(()) => {
                    *last_contact.lock().await = std::time::Instant::now();
                    info!("reconnect succeeded");
                }
                Err(e) => error!(error = %e, "reconnect attempt exhausted backoff"),
            }
        }
    }
}
