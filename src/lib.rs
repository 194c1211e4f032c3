pub mod agent;
pub mod backend;
pub mod compare;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pipeline;
pub mod plan;
pub mod row;
pub mod sql_text;
pub mod stage;
pub mod state;
pub mod testing;

// Re-export main types
pub use agent::{Activation, AgentDescriptor, AgentName, Slot, StageStatus};
pub use backend::AgentBackend;
pub use compare::{ComparisonResult, ResultComparator, SqlSource};
pub use config::PipelineConfig;
pub use db::SqliteSource;
pub use error::{Error, ErrorKind, ErrorReport, QuerySide};
pub use executor::StageExecutor;
pub use pipeline::{Pipeline, RunOutcome, RunRequest};
pub use plan::PipelinePlan;
pub use row::{Row, RowSet};
pub use stage::{SlotMap, Stage};
pub use state::{QueryResult, RunState, RunStatus};

/// Error type for the pipeline library
pub type Result<T> = std::result::Result<T, error::Error>;
