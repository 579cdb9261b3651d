//! Local sing-box config mutation, driven by `PendingCommand`s.
//! Grounded on the host agent's `save_config`/`restart_singbox` pair: read
//! the JSON file, patch the `users` array, write it back pretty-printed,
//! `systemctl restart sing-box` when a command needs the change live.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

/// Owns the local sing-box config file and applies user-level mutations to
/// its `users` array in place. One instance per agent process.
pub struct LocalProxySupervisor {
    config_path: PathBuf,
}

impl LocalProxySupervisor {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    async fn load(&self) -> Result<Value> {
        if !self.config_path.exists() {
            return Ok(serde_json::json!({ "users": [] }));
        }
        let raw = tokio::fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("failed to read {}", self.config_path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", self.config_path.display()))
    }

    async fn save(&self, content: &Value) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await.context("failed to create config directory")?;
        }
        let json_str = serde_json::to_string_pretty(content).context("failed to serialize config")?;
        tokio::fs::write(&self.config_path, json_str)
            .await
            .with_context(|| format!("failed to write {}", self.config_path.display()))?;
        info!(path = %self.config_path.display(), "config saved");
        Ok(())
    }

    fn users_array(content: &mut Value) -> &mut Vec<Value> {
        content
            .as_object_mut()
            .expect("config root must be a JSON object")
            .entry("users")
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .expect("users must be a JSON array")
    }

    fn user_id(params: &HashMap<String, Value>) -> Result<String> {
        params
            .get("user_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("command params missing user_id")
    }

    /// ADD_USER / UPDATE_USER: upsert the full user record into `users`.
    pub async fn upsert_user(&mut self, params: &HashMap<String, Value>) -> Result<()> {
        let user_id = Self::user_id(params)?;
        let mut content = self.load().await?;
        let users = Self::users_array(&mut content);

        let mut record = serde_json::Map::new();
        for (k, v) in params {
            record.insert(k.clone(), v.clone());
        }
        let record = Value::Object(record);

        match users.iter_mut().find(|u| u.get("user_id").and_then(Value::as_str) == Some(user_id.as_str())) {
            Some(existing) => *existing = record,
            None => users.push(record),
        }

        self.save(&content).await
    }

    /// REMOVE_USER: drop the user from `users` entirely.
    pub async fn remove_user(&mut self, params: &HashMap<String, Value>) -> Result<()> {
        let user_id = Self::user_id(params)?;
        let mut content = self.load().await?;
        let users = Self::users_array(&mut content);
        users.retain(|u| u.get("user_id").and_then(Value::as_str) != Some(user_id.as_str()));
        self.save(&content).await
    }

    /// ENABLE_USER / DISABLE_USER: flip the `enabled` flag without touching
    /// the rest of the record.
    pub async fn set_user_enabled(&mut self, params: &HashMap<String, Value>, enabled: bool) -> Result<()> {
        let user_id = Self::user_id(params)?;
        let mut content = self.load().await?;
        let users = Self::users_array(&mut content);

        let entry = users
            .iter_mut()
            .find(|u| u.get("user_id").and_then(Value::as_str) == Some(user_id.as_str()))
            .with_context(|| format!("user {user_id} not present locally, cannot toggle enabled"))?;
        entry["enabled"] = Value::Bool(enabled);

        self.save(&content).await
    }

    /// RESET_TRAFFIC: no local state to clear since counters are derived
    /// from sing-box's own cumulative connection stats, not tracked here.
    /// Accepted as a no-op so the executor doesn't log a spurious failure.
    pub async fn reset_user_counter(&mut self, _params: &HashMap<String, Value>) -> Result<()> {
        Ok(())
    }

    /// APPLY_CONFIG: merges the control plane's declarative settings blob
    /// (`UpdateConfigResponse::content`) into the local config under its own
    /// `settings` key, leaving the `users` array untouched.
    pub async fn apply_settings(&mut self, settings: &Value) -> Result<()> {
        let mut content = self.load().await?;
        content
            .as_object_mut()
            .expect("config root must be a JSON object")
            .insert("settings".to_string(), settings.clone());
        self.save(&content).await
    }

    pub async fn restart_service(&mut self) -> Result<()> {
        info!("restarting sing-box service");
        let output = std::process::Command::new("systemctl").args(["restart", "sing-box"]).output().context("failed to invoke systemctl")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("systemctl restart failed: {stderr}");
        }
        Ok(())
    }

    /// Restarts sing-box after a settings change is already on disk
    /// (`apply_settings` having run first).
    pub async fn reload(&mut self) -> Result<()> {
        self.restart_service().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(user_id: &str) -> HashMap<String, Value> {
        let mut p = HashMap::new();
        p.insert("user_id".to_string(), Value::String(user_id.to_string()));
        p
    }

    #[tokio::test]
    async fn upsert_then_remove_round_trips() {
        let dir = std::env::temp_dir().join(format!("caramba-node-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let mut supervisor = LocalProxySupervisor::new(path.clone());

        supervisor.upsert_user(&params("user-1")).await.unwrap();
        let content = supervisor.load().await.unwrap();
        assert_eq!(content["users"].as_array().unwrap().len(), 1);

        supervisor.remove_user(&params("user-1")).await.unwrap();
        let content = supervisor.load().await.unwrap();
        assert_eq!(content["users"].as_array().unwrap().len(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn set_user_enabled_toggles_flag() {
        let dir = std::env::temp_dir().join(format!("caramba-node-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let mut supervisor = LocalProxySupervisor::new(path.clone());

        supervisor.upsert_user(&params("user-2")).await.unwrap();
        supervisor.set_user_enabled(&params("user-2"), false).await.unwrap();

        let content = supervisor.load().await.unwrap();
        let users = content["users"].as_array().unwrap();
        assert_eq!(users[0]["enabled"], Value::Bool(false));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
