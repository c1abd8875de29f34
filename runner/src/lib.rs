//! Pipeline-parallel training runner.
//!
//! Drives repeated forward/backward/optimizer passes for one pipeline
//! stage: classifies each batch as accumulate-only or weight-update,
//! issues synchronization-event ids so stages never race on shared
//! activation buffers, dispatches executions onto a fixed set of worker
//! slots, and persists progress through a bounded checkpoint registry.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod loss_scale;
pub mod lr;
pub mod metrics;
pub mod pool;
pub mod runner;
pub mod schedule;
pub mod state;

pub use checkpoint::CheckpointRegistry;
pub use config::{
    CheckpointConfig, LossScaleMode, LrConfig, MixedPrecisionConfig, OptimizerOutputs,
    PipelineContext, PipelineSync, RunnerConfig, SyncEventNames,
};
pub use data::{Column, DataLoader, InMemoryDataLoader, Shard};
pub use error::{Result, RunnerErr};
pub use loss_scale::LossScaler;
pub use lr::{LearningRateSchedule, WarmupMode};
pub use metrics::RunnerMetrics;
pub use pool::{RunOutput, WorkItem, WorkerPool};
pub use runner::{StepKind, TrainingRunner};
pub use schedule::{EventRole, EventSchedule, NO_EVENT, Pass};
pub use state::TrainingState;
