use std::{collections::HashSet, num::NonZeroUsize, path::PathBuf};

use crate::error::{Result, RunnerErr};
use crate::lr::WarmupMode;
use crate::schedule::{EventRole, Pass};

/// The eight synchronization-event feed names and four event-completion
/// output names exchanged with the graph-configuration collaborator.
#[derive(Debug, Clone)]
pub struct SyncEventNames {
    pub forward_waited: String,
    pub forward_waited_after_recv: String,
    pub forward_recorded_before_send: String,
    pub forward_recorded: String,
    pub backward_waited: String,
    pub backward_waited_after_recv: String,
    pub backward_recorded_before_send: String,
    pub backward_recorded: String,

    pub forward_wait_output: String,
    pub forward_record_output: String,
    pub backward_wait_output: String,
    pub backward_record_output: String,
}

impl SyncEventNames {
    /// Event feeds in dispatch order, each paired with its schedule role.
    pub(crate) fn feed_roles(&self) -> [(&str, Pass, EventRole); 8] {
        [
            (self.forward_waited.as_str(), Pass::Forward, EventRole::Wait),
            (
                self.forward_waited_after_recv.as_str(),
                Pass::Forward,
                EventRole::WaitAfterRecv,
            ),
            (
                self.forward_recorded_before_send.as_str(),
                Pass::Forward,
                EventRole::RecordBeforeSend,
            ),
            (
                self.forward_recorded.as_str(),
                Pass::Forward,
                EventRole::Record,
            ),
            (
                self.backward_waited.as_str(),
                Pass::Backward,
                EventRole::Wait,
            ),
            (
                self.backward_waited_after_recv.as_str(),
                Pass::Backward,
                EventRole::WaitAfterRecv,
            ),
            (
                self.backward_recorded_before_send.as_str(),
                Pass::Backward,
                EventRole::RecordBeforeSend,
            ),
            (
                self.backward_recorded.as_str(),
                Pass::Backward,
                EventRole::Record,
            ),
        ]
    }

    pub(crate) fn feed_names(&self) -> [&str; 8] {
        let roles = self.feed_roles();
        [
            roles[0].0, roles[1].0, roles[2].0, roles[3].0, roles[4].0, roles[5].0, roles[6].0,
            roles[7].0,
        ]
    }

    pub(crate) fn output_names(&self) -> [&str; 4] {
        [
            self.forward_wait_output.as_str(),
            self.forward_record_output.as_str(),
            self.backward_wait_output.as_str(),
            self.backward_record_output.as_str(),
        ]
    }
}

/// Whether cross-stage event synchronization is wired into the graph.
#[derive(Debug, Clone)]
pub enum PipelineSync {
    Disabled,
    Enabled(SyncEventNames),
}

/// Immutable-per-run pipeline placement of this process.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// 0-indexed stage handled by this process.
    pub stage_id: usize,
    pub num_stages: NonZeroUsize,
    /// Micro-batches per pipeline round (one weight update).
    pub num_micro_batches: NonZeroUsize,
    /// Input names allowed to cross into this stage's subgraph.
    pub feed_names: Vec<String>,
    /// Output names this stage's subgraph can produce.
    pub fetch_names: Vec<String>,
    pub sync: PipelineSync,
}

impl PipelineContext {
    /// Context for a run without pipelining: one stage, no sync events,
    /// no name filtering.
    pub fn single_stage() -> Self {
        Self {
            stage_id: 0,
            num_stages: NonZeroUsize::MIN,
            num_micro_batches: NonZeroUsize::MIN,
            feed_names: Vec::new(),
            fetch_names: Vec::new(),
            sync: PipelineSync::Disabled,
        }
    }

    #[inline]
    pub fn pipelined(&self) -> bool {
        self.num_stages.get() > 1
    }

    /// A feed passes the stage boundary if pipelining is off or the name
    /// is in this stage's allowed set.
    #[inline]
    pub(crate) fn allows_feed(&self, name: &str) -> bool {
        !self.pipelined() || self.feed_names.iter().any(|n| n == name)
    }

    #[inline]
    pub(crate) fn allows_fetch(&self, name: &str) -> bool {
        !self.pipelined() || self.fetch_names.iter().any(|n| n == name)
    }
}

/// Loss-scale behavior under mixed precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossScaleMode {
    /// Fixed scale, never adjusted.
    Static(f32),
    /// Adaptive scale driven by the gradient-finiteness flag.
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct MixedPrecisionConfig {
    /// Graph input receiving the loss scale.
    pub loss_scale_feed_name: String,
    pub mode: LossScaleMode,
}

/// Optimizer-graph outputs exposed to the runner, keyed by purpose.
#[derive(Debug, Clone, Default)]
pub struct OptimizerOutputs {
    /// Output driven on accumulate-only steps.
    pub gradient_accumulation: Option<String>,
    /// All-gradients-finite flag, required under mixed precision.
    pub all_gradients_finite: Option<String>,
    /// Adasum delta-finite flag, required under mixed precision + Adasum.
    pub delta_all_finite: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LrConfig {
    /// Graph input receiving the learning rate.
    pub feed_name: String,
    pub initial_lr: f32,
    /// Fraction of the total steps spent warming up, in `[0, 1)`.
    pub warmup_ratio: f32,
    pub warmup_mode: WarmupMode,
}

impl LrConfig {
    /// Constant learning rate, no warmup.
    pub fn constant(feed_name: impl Into<String>, initial_lr: f32) -> Self {
        Self {
            feed_name: feed_name.into(),
            initial_lr,
            warmup_ratio: 0.0,
            warmup_mode: WarmupMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Directory holding `checkpoint_<step>` snapshot subdirectories.
    pub dir: PathBuf,
    /// Save every this many weight-update steps.
    pub period: NonZeroUsize,
    /// Bound on retained snapshots; the oldest is evicted past it.
    pub max_checkpoints: NonZeroUsize,
    /// Explicit snapshot to restore, overriding the registry's latest.
    pub load_path: Option<PathBuf>,
}

/// Immutable execution bounds for one training run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub num_train_steps: usize,
    pub batch_size: NonZeroUsize,
    pub eval_batch_size: NonZeroUsize,
    pub gradient_accumulation_steps: NonZeroUsize,
    /// Run an evaluation pass every this many global steps.
    pub evaluation_period: NonZeroUsize,
    pub do_eval: bool,
    pub shuffle_data: bool,
    /// Only the coordinating rank persists checkpoints.
    pub is_coordinator: bool,
    pub use_adasum: bool,
    /// User-requested outputs of an update or evaluation step.
    pub fetch_names: Vec<String>,
    pub lr: LrConfig,
    pub mixed_precision: Option<MixedPrecisionConfig>,
    pub optimizer_outputs: OptimizerOutputs,
    pub checkpoint: Option<CheckpointConfig>,
    pub pipeline: PipelineContext,
}

impl RunnerConfig {
    /// Checks every invariant that can be checked before execution.
    ///
    /// # Errors
    /// Returns `RunnerErr::InvalidConfig` on the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.num_train_steps == 0 {
            return Err(RunnerErr::InvalidConfig(
                "num_train_steps must be positive".into(),
            ));
        }
        let accumulation = self.gradient_accumulation_steps.get();
        if self.num_train_steps % accumulation != 0 {
            return Err(RunnerErr::InvalidConfig(format!(
                "num_train_steps ({}) must be a multiple of gradient_accumulation_steps ({})",
                self.num_train_steps, accumulation
            )));
        }
        if accumulation > 1 && self.optimizer_outputs.gradient_accumulation.is_none() {
            return Err(RunnerErr::InvalidConfig(
                "gradient accumulation output is required when accumulation steps > 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.lr.warmup_ratio) {
            return Err(RunnerErr::InvalidConfig(format!(
                "warmup_ratio ({}) must be in [0, 1)",
                self.lr.warmup_ratio
            )));
        }

        let ctx = &self.pipeline;
        if ctx.stage_id >= ctx.num_stages.get() {
            return Err(RunnerErr::InvalidConfig(format!(
                "stage_id ({}) out of range for {} stages",
                ctx.stage_id, ctx.num_stages
            )));
        }
        if let PipelineSync::Enabled(events) = &ctx.sync {
            if !ctx.pipelined() {
                return Err(RunnerErr::InvalidConfig(
                    "sync events require more than one pipeline stage".into(),
                ));
            }
            let mut seen = HashSet::new();
            for name in events.feed_names() {
                if name.is_empty() {
                    return Err(RunnerErr::InvalidConfig(
                        "sync event feed names must not be empty".into(),
                    ));
                }
                if !seen.insert(name) || ctx.feed_names.iter().any(|n| n == name) {
                    return Err(RunnerErr::InvalidConfig(format!(
                        "sync event name `{name}` is not unique among stage feeds"
                    )));
                }
            }
            let mut seen = HashSet::new();
            for name in events.output_names() {
                if name.is_empty() {
                    return Err(RunnerErr::InvalidConfig(
                        "sync event output names must not be empty".into(),
                    ));
                }
                if !seen.insert(name) || ctx.fetch_names.iter().any(|n| n == name) {
                    return Err(RunnerErr::InvalidConfig(format!(
                        "sync event output `{name}` is not unique among stage fetches"
                    )));
                }
            }
        }

        if self.mixed_precision.is_some() && !ctx.pipelined() {
            if self.optimizer_outputs.all_gradients_finite.is_none() {
                return Err(RunnerErr::InvalidConfig(
                    "gradient finiteness output is required under mixed precision".into(),
                ));
            }
            if self.use_adasum && self.optimizer_outputs.delta_all_finite.is_none() {
                return Err(RunnerErr::InvalidConfig(
                    "Adasum delta finiteness output is required under mixed precision".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RunnerConfig {
        RunnerConfig {
            num_train_steps: 8,
            batch_size: NonZeroUsize::new(2).unwrap(),
            eval_batch_size: NonZeroUsize::new(2).unwrap(),
            gradient_accumulation_steps: NonZeroUsize::new(4).unwrap(),
            evaluation_period: NonZeroUsize::new(1).unwrap(),
            do_eval: false,
            shuffle_data: false,
            is_coordinator: true,
            use_adasum: false,
            fetch_names: vec!["loss".into()],
            lr: LrConfig::constant("learning_rate", 0.01),
            mixed_precision: None,
            optimizer_outputs: OptimizerOutputs {
                gradient_accumulation: Some("accumulated_gradients".into()),
                ..OptimizerOutputs::default()
            },
            checkpoint: None,
            pipeline: PipelineContext::single_stage(),
        }
    }

    #[test]
    fn accepts_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_steps_not_divisible_by_accumulation() {
        let mut cfg = base_config();
        cfg.num_train_steps = 9;
        assert!(matches!(
            cfg.validate(),
            Err(RunnerErr::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_missing_accumulation_output() {
        let mut cfg = base_config();
        cfg.optimizer_outputs.gradient_accumulation = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_mixed_precision_without_finiteness_output() {
        let mut cfg = base_config();
        cfg.mixed_precision = Some(MixedPrecisionConfig {
            loss_scale_feed_name: "loss_scale".into(),
            mode: LossScaleMode::Dynamic,
        });
        assert!(cfg.validate().is_err());

        cfg.optimizer_outputs.all_gradients_finite = Some("all_gradients_finite".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_sync_without_pipelining() {
        let mut cfg = base_config();
        cfg.pipeline.sync = PipelineSync::Enabled(SyncEventNames {
            forward_waited: "fw_wait".into(),
            forward_waited_after_recv: "fw_wait_recv".into(),
            forward_recorded_before_send: "fw_record_send".into(),
            forward_recorded: "fw_record".into(),
            backward_waited: "bw_wait".into(),
            backward_waited_after_recv: "bw_wait_recv".into(),
            backward_recorded_before_send: "bw_record_send".into(),
            backward_recorded: "bw_record".into(),
            forward_wait_output: "fw_wait_out".into(),
            forward_record_output: "fw_record_out".into(),
            backward_wait_output: "bw_wait_out".into(),
            backward_record_output: "bw_record_out".into(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_event_name_colliding_with_stage_feed() {
        let mut cfg = base_config();
        cfg.pipeline.num_stages = NonZeroUsize::new(2).unwrap();
        cfg.pipeline.num_micro_batches = cfg.gradient_accumulation_steps;
        cfg.pipeline.feed_names = vec!["features".into(), "fw_wait".into()];
        cfg.pipeline.fetch_names = vec!["loss".into()];
        cfg.pipeline.sync = PipelineSync::Enabled(SyncEventNames {
            forward_waited: "fw_wait".into(),
            forward_waited_after_recv: "fw_wait_recv".into(),
            forward_recorded_before_send: "fw_record_send".into(),
            forward_recorded: "fw_record".into(),
            backward_waited: "bw_wait".into(),
            backward_waited_after_recv: "bw_wait_recv".into(),
            backward_recorded_before_send: "bw_record_send".into(),
            backward_recorded: "bw_record".into(),
            forward_wait_output: "fw_wait_out".into(),
            forward_record_output: "fw_record_out".into(),
            backward_wait_output: "bw_wait_out".into(),
            backward_record_output: "bw_record_out".into(),
        });
        assert!(cfg.validate().is_err());
    }
}
