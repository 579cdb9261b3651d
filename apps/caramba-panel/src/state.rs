use std::sync::Arc;

use caramba_db::repositories::{
    AdminRepository, NodeRepository, PlanRepository, SettingsRepository, TrafficRepository, UserRepository,
};
use sqlx::PgPool;

use crate::config::Config;
use crate::registry::Registry;

/// Shared handle every handler takes via axum's `State` extractor. Cloning
/// is cheap — every field is itself an `Arc`/pool handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub registry: Registry,
    pub nodes: NodeRepository,
    pub users: UserRepository,
    pub plans: PlanRepository,
    pub traffic: TrafficRepository,
    pub settings: SettingsRepository,
    pub admins: AdminRepository,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool) -> Self {
        let registry = Registry::new(config.command_queue_capacity);
        Self {
            nodes: NodeRepository::new(pool.clone()),
            users: UserRepository::new(pool.clone()),
            plans: PlanRepository::new(pool.clone()),
            traffic: TrafficRepository::new(pool.clone()),
            settings: SettingsRepository::new(pool.clone()),
            admins: AdminRepository::new(pool.clone()),
            config: Arc::new(config),
            pool,
            registry,
        }
    }
}
