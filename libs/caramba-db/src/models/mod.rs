pub mod admin;
pub mod node;
pub mod plan;
pub mod settings;
pub mod traffic;
pub mod user;

pub use admin::AdminAccount;
pub use node::Node;
pub use plan::Plan;
pub use settings::GlobalSetting;
pub use traffic::{SummaryType, TrafficRecord, TrafficSummary};
pub use user::User;
