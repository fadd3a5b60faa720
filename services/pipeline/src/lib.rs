//! Pipeline service: multi-tenant scoped storage plus the change-data
//! pipeline (replication listener, activity dispatch, live stream gateway).

pub mod app;
pub mod config;
pub mod observability;

pub use app::Pipeline;
pub use config::PipelineConfig;
