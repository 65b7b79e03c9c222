pub mod api;
pub mod batches;
pub mod compare;
pub mod context;
pub mod error;
pub mod hooks;
pub mod inputs;
pub mod manifest;
pub mod plan;
pub mod runner;
pub mod tuning;
pub mod types;

pub use context::{RunContext, RunContextBuilder};
pub use error::{RunwayError, RunwayResult};
pub use runner::{Job, Runner};
pub use types::{ConfigLayer, ExistingPolicy, PendingPolicy, RunnerKind, TaskStatus};
