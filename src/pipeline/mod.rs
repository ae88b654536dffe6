//! Pipeline run orchestration: lock, worker process, log capture and status.

pub mod executor;
pub mod lock;
pub mod log_appender;
pub mod params;
pub mod query;
pub mod runner;
pub mod state;

pub use params::RunRequest;
pub use query::RunQueryService;
pub use runner::{PipelineRunner, RunReport};
