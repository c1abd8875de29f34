use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use engine::{RunOptions, Session, Value};
use log::{debug, info, warn};

use crate::{
    checkpoint::{self, CheckpointRegistry},
    config::{PipelineSync, RunnerConfig},
    data::DataLoader,
    error::{Result, RunnerErr},
    loss_scale::LossScaler,
    lr::LearningRateSchedule,
    metrics::RunnerMetrics,
    pool::{RunOutput, WorkItem, WorkerPool},
    schedule::{EventSchedule, NO_EVENT},
    state::{TrainingState, property},
};

/// Classification of one engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Forward/backward pass that only accumulates gradients.
    GradientAccumulate,
    /// Pass whose optimizer applies the accumulated update.
    ModelUpdate,
    /// Evaluation pass: scale 1.0, sentinel events, no optimizer.
    Evaluate,
}

/// Top-level driver of the pipeline training loop.
///
/// Owns the per-run state: counters, event schedule, worker slots, loss
/// scaler and checkpoint registry. One runner drives one pipeline stage;
/// adjacent stages run in their own processes and meet only through the
/// engine's wait/record operators.
pub struct TrainingRunner {
    config: RunnerConfig,
    session: Arc<dyn Session>,
    state: TrainingState,
    schedule: EventSchedule,
    pool: WorkerPool,
    loss_scaler: Option<LossScaler>,
    lr_schedule: LearningRateSchedule,
    registry: Option<CheckpointRegistry>,
    metrics: RunnerMetrics,
    eval_batch_cursor: usize,
}

impl TrainingRunner {
    /// Builds a runner and restores the latest checkpoint, if one exists.
    ///
    /// # Args
    /// * `config` - Validated up front; any violated invariant fails here.
    /// * `session` - The execution engine, shared with worker tasks.
    ///
    /// # Errors
    /// Configuration violations, checkpoint-directory I/O failures, and
    /// restore failures (missing or malformed properties) are all fatal.
    pub fn new(config: RunnerConfig, session: Arc<dyn Session>) -> Result<Self> {
        config.validate()?;

        let schedule = EventSchedule::new(
            config.pipeline.num_stages,
            config.pipeline.num_micro_batches,
        );
        let pool = WorkerPool::new(config.pipeline.num_stages);
        let loss_scaler = config.mixed_precision.as_ref().map(|mp| {
            LossScaler::new(mp.loss_scale_feed_name.clone(), mp.mode)
        });
        let lr_schedule = LearningRateSchedule::new(&config.lr, config.num_train_steps);
        let registry = match &config.checkpoint {
            Some(cfg) => Some(CheckpointRegistry::new(cfg.dir.clone(), cfg.max_checkpoints)?),
            None => None,
        };

        let mut runner = Self {
            config,
            session,
            state: TrainingState::default(),
            schedule,
            pool,
            loss_scaler,
            lr_schedule,
            registry,
            metrics: RunnerMetrics::default(),
            eval_batch_cursor: 0,
        };

        let restore_path: Option<PathBuf> = runner
            .config
            .checkpoint
            .as_ref()
            .and_then(|cfg| cfg.load_path.clone())
            .or_else(|| {
                runner
                    .registry
                    .as_ref()
                    .and_then(|r| r.try_get_latest().map(Path::to_path_buf))
            });
        if let Some(path) = restore_path {
            runner.load_checkpoint(&path)?;
        }

        Ok(runner)
    }

    #[inline]
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    #[inline]
    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    #[inline]
    pub fn loss_scaler(&self) -> Option<&LossScaler> {
        self.loss_scaler.as_ref()
    }

    /// Runs training until the step budget is exhausted.
    ///
    /// # Args
    /// * `train` - Training shards; resumed at the restored shard index.
    /// * `test` - Optional evaluation shards, consumed every
    ///   `evaluation_period` steps when `do_eval` is set.
    pub async fn run(
        &mut self,
        train: &mut dyn DataLoader,
        test: Option<&mut dyn DataLoader>,
    ) -> Result<()> {
        self.training_loop(train, test).await?;

        info!(
            round = self.state.round,
            batches = self.metrics.batches,
            accumulate_steps = self.metrics.accumulate_steps,
            update_steps = self.metrics.update_steps,
            mean_batch_ms = self.metrics.mean_batch_time().as_secs_f64() * 1e3;
            "training round finished"
        );

        self.state.round += 1;
        self.state.step = 0;
        Ok(())
    }

    /// Classifies the next training batch.
    fn classify(&self) -> StepKind {
        if (self.state.step + 1) % self.config.gradient_accumulation_steps.get() == 0 {
            StepKind::ModelUpdate
        } else {
            StepKind::GradientAccumulate
        }
    }

    async fn training_loop(
        &mut self,
        train: &mut dyn DataLoader,
        mut test: Option<&mut dyn DataLoader>,
    ) -> Result<()> {
        if let Some(test) = test.as_deref_mut() {
            test.set_shard(0)?;
        }
        train.set_shard(self.state.shard_index)?;

        let num_shards = train.num_shards();
        while self.state.step < self.config.num_train_steps {
            for _ in 0..num_shards {
                self.state.shard_index = train.shard_index();
                if self.config.shuffle_data {
                    debug!(shard = self.state.shard_index; "shuffling training shard");
                    train.shuffle();
                }

                let num_batches = train.num_batches(self.config.batch_size.get());
                let mut batch = 0;
                while batch < num_batches && self.state.step < self.config.num_train_steps {
                    let kind = self.classify();
                    let (feed_names, feeds) = self.prepare_feeds(kind, &*train, batch);
                    let fetch_names = self.prepare_fetches(kind)?;
                    let item = WorkItem {
                        feed_names,
                        feeds,
                        fetch_names,
                        options: RunOptions {
                            only_execute_path_to_fetches: kind != StepKind::ModelUpdate,
                        },
                    };

                    let started = Instant::now();
                    if kind == StepKind::ModelUpdate {
                        self.run_with_update(item).await?;
                    } else {
                        self.run_without_update(item).await?;
                    }
                    self.metrics.add_batch_time(started.elapsed());

                    debug!(
                        stage = self.config.pipeline.stage_id,
                        round = self.state.round,
                        step = self.state.step,
                        shard = self.state.shard_index,
                        batch = batch;
                        "processed batch"
                    );

                    if self.config.do_eval
                        && self.state.step % self.config.evaluation_period.get() == 0
                    {
                        if let Some(test) = test.as_deref_mut() {
                            self.evaluate(test).await?;
                        }
                    }

                    self.save_checkpoint_if_due(kind)?;
                    batch += 1;
                }

                // No cross-shard batch may race the next shard's dispatches.
                self.pool.join_all().await?;
                if self.state.step < self.config.num_train_steps {
                    train.advance_shard();
                }
            }
        }
        Ok(())
    }

    /// Builds the feed name/value lists for one engine invocation.
    fn prepare_feeds(
        &self,
        kind: StepKind,
        loader: &dyn DataLoader,
        batch_index: usize,
    ) -> (Vec<String>, Vec<Value>) {
        let ctx = &self.config.pipeline;
        let mut feed_names = Vec::new();
        let mut feeds = Vec::new();

        let data_values = loader.batch(self.config.batch_size.get(), batch_index);
        for (name, value) in loader.tensor_names().iter().zip(data_values) {
            if ctx.allows_feed(name) {
                feed_names.push(name.clone());
                feeds.push(value);
            }
        }

        if let Some(scaler) = &self.loss_scaler {
            if ctx.allows_feed(scaler.feed_name()) {
                feed_names.push(scaler.feed_name().to_string());
                let scale = if kind == StepKind::Evaluate {
                    1.0
                } else {
                    scaler.loss_scale()
                };
                feeds.push(Value::Scalar(scale));
            }
        }

        if ctx.allows_feed(&self.config.lr.feed_name) {
            feed_names.push(self.config.lr.feed_name.clone());
            // No optimizer path runs during evaluation.
            let lr = if kind == StepKind::Evaluate {
                0.0
            } else {
                self.lr_schedule.learning_rate(self.state.step + 1)
            };
            feeds.push(Value::Scalar(lr));
        }

        if let PipelineSync::Enabled(events) = &ctx.sync {
            let micro_batch = self.state.step % ctx.num_micro_batches.get();
            for (name, pass, role) in events.feed_roles() {
                feed_names.push(name.to_string());
                let id = if kind == StepKind::Evaluate {
                    NO_EVENT
                } else {
                    self.schedule.event_id(ctx.stage_id, micro_batch, pass, role)
                };
                feeds.push(Value::Event(id));
            }
        }

        (feed_names, feeds)
    }

    /// Builds the fetch name list for one engine invocation.
    fn prepare_fetches(&self, kind: StepKind) -> Result<Vec<String>> {
        let ctx = &self.config.pipeline;
        let mut fetch_names = Vec::new();

        match kind {
            StepKind::ModelUpdate | StepKind::Evaluate => {
                for name in &self.config.fetch_names {
                    if ctx.allows_fetch(name) {
                        fetch_names.push(name.clone());
                    }
                }

                if kind == StepKind::ModelUpdate && self.config.mixed_precision.is_some() {
                    let outputs = &self.config.optimizer_outputs;
                    if !ctx.pipelined() {
                        let finite = outputs.all_gradients_finite.as_ref().ok_or_else(|| {
                            RunnerErr::InvalidConfig(
                                "gradient finiteness output is required under mixed precision"
                                    .into(),
                            )
                        })?;
                        fetch_names.push(finite.clone());
                        if self.config.use_adasum {
                            let delta = outputs.delta_all_finite.as_ref().ok_or_else(|| {
                                RunnerErr::InvalidConfig(
                                    "Adasum delta finiteness output is required under mixed \
                                     precision"
                                        .into(),
                                )
                            })?;
                            fetch_names.push(delta.clone());
                        }
                    } else {
                        // Only the stage that owns the optimizer outputs can
                        // fetch them.
                        for name in [&outputs.all_gradients_finite, &outputs.delta_all_finite]
                            .into_iter()
                            .flatten()
                        {
                            if ctx.allows_fetch(name) {
                                fetch_names.push(name.clone());
                            }
                        }
                    }
                }
            }
            StepKind::GradientAccumulate => {
                if self.config.gradient_accumulation_steps.get() > 1 {
                    let name = self
                        .config
                        .optimizer_outputs
                        .gradient_accumulation
                        .as_ref()
                        .ok_or_else(|| {
                            RunnerErr::InvalidConfig(
                                "gradient accumulation output is required when accumulating"
                                    .into(),
                            )
                        })?;
                    fetch_names.push(name.clone());
                }
                // Event outputs are fetched unconditionally: an engine that
                // never runs a record node would block the adjacent stage
                // forever.
                if let PipelineSync::Enabled(events) = &ctx.sync {
                    for name in events.output_names() {
                        fetch_names.push(name.to_string());
                    }
                }
            }
        }

        // The engine requires at least one fetch.
        if fetch_names.is_empty() {
            fetch_names = ctx.fetch_names.clone();
        }
        Ok(fetch_names)
    }

    /// Dispatches a weight-update step and blocks until its results are
    /// consumed: the whole pipeline round joins before control returns.
    async fn run_with_update(&mut self, item: WorkItem) -> Result<()> {
        let slot = self.state.step % self.pool.num_slots();

        // The slot's previous task must be joined before reassignment.
        let _ = self.pool.join(slot).await?;
        self.pool.dispatch(slot, Arc::clone(&self.session), item)?;
        let output = self.pool.join(slot).await?.ok_or_else(|| RunnerErr::Task {
            slot,
            msg: "slot empty immediately after dispatch".into(),
        })?;
        // The update closes a pipeline round; every stage thread must be
        // done before the next round starts.
        self.pool.join_all().await?;

        self.consume_finiteness(&output)?;

        self.state.step += 1;
        self.state.weight_update_step += 1;
        self.metrics.bump_update();
        Ok(())
    }

    /// Dispatches an accumulate step and returns without joining; the
    /// cyclic reuse of the slot enforces the join later.
    async fn run_without_update(&mut self, item: WorkItem) -> Result<()> {
        let slot = self.state.step % self.pool.num_slots();
        let _ = self.pool.join(slot).await?;
        self.pool.dispatch(slot, Arc::clone(&self.session), item)?;

        self.state.step += 1;
        self.metrics.bump_accumulate();
        Ok(())
    }

    fn consume_finiteness(&mut self, output: &RunOutput) -> Result<()> {
        let Some(scaler) = &mut self.loss_scaler else {
            return Ok(());
        };
        let Some(name) = &self.config.optimizer_outputs.all_gradients_finite else {
            return Ok(());
        };
        match output.fetch(name) {
            Some(Value::Flag(finite)) => {
                if !finite {
                    warn!(step = self.state.step; "non-finite gradients, halving loss scale");
                }
                scaler.update(*finite);
            }
            Some(_) => {
                return Err(RunnerErr::InvalidConfig(format!(
                    "output `{name}` is not a finiteness flag"
                )));
            }
            // Not fetched on this stage; the owning stage updates its own
            // scaler.
            None => {}
        }
        Ok(())
    }

    /// Runs one evaluation pass, serialized against training work.
    async fn evaluate(&mut self, test: &mut dyn DataLoader) -> Result<()> {
        // Training slots must be drained before engine resources are
        // reused for evaluation.
        self.pool.join_all().await?;

        let batch_size = self.config.batch_size.get();
        let eval_batch_size = self.config.eval_batch_size.get();
        let num_batches = eval_batch_size.div_ceil(batch_size);
        if eval_batch_size % batch_size != 0 {
            warn!(
                "eval batch size {eval_batch_size} is not a multiple of batch size \
                 {batch_size}, evaluating {} samples",
                num_batches * batch_size
            );
        }

        if self.config.shuffle_data && self.eval_batch_cursor == 0 {
            test.shuffle();
        }

        for _ in 0..num_batches {
            let (feed_names, feeds) =
                self.prepare_feeds(StepKind::Evaluate, &*test, self.eval_batch_cursor);
            let fetch_names = self.prepare_fetches(StepKind::Evaluate)?;
            let item = WorkItem {
                feed_names,
                feeds,
                fetch_names,
                options: RunOptions {
                    only_execute_path_to_fetches: true,
                },
            };

            let output = if self.config.pipeline.pipelined() {
                // Training slots belong to pipeline stages; run inline
                // instead of stealing one.
                let session = Arc::clone(&self.session);
                tokio::task::spawn_blocking(move || {
                    session
                        .run(&item.options, &item.feed_names, &item.feeds, &item.fetch_names)
                        .map(|fetches| RunOutput {
                            fetch_names: item.fetch_names,
                            fetches,
                        })
                })
                .await
                .map_err(|e| RunnerErr::Task {
                    slot: 0,
                    msg: e.to_string(),
                })?
                .map_err(RunnerErr::Engine)?
            } else {
                // Slot 0 is idle after the barrier above.
                self.pool.dispatch(0, Arc::clone(&self.session), item)?;
                self.pool.join(0).await?.ok_or_else(|| RunnerErr::Task {
                    slot: 0,
                    msg: "slot empty immediately after dispatch".into(),
                })?
            };

            debug!(
                step = self.state.step,
                fetches = output.fetches.len();
                "evaluation batch done"
            );

            self.eval_batch_cursor += 1;
            if self.eval_batch_cursor >= test.num_batches(batch_size) {
                test.advance_shard();
                self.eval_batch_cursor = 0;
            }
        }

        self.metrics.bump_eval();
        self.pool.join_all().await
    }

    fn save_checkpoint_if_due(&mut self, kind: StepKind) -> Result<()> {
        let Some(cfg) = &self.config.checkpoint else {
            return Ok(());
        };
        if kind != StepKind::ModelUpdate || !self.config.is_coordinator {
            return Ok(());
        }
        if self.state.weight_update_step % cfg.period.get() != 0 {
            return Ok(());
        }
        let Some(registry) = &mut self.registry else {
            return Ok(());
        };

        let (new_path, evict) = registry.add_checkpoint(self.state.weight_update_step);
        let tensors = self.session.state_tensors().map_err(RunnerErr::Engine)?;
        let mut properties = self.state.to_properties();
        if let Some(scaler) = &self.loss_scaler {
            properties.insert(
                property::LOSS_SCALER_STATE.to_string(),
                scaler.save_to_string()?,
            );
        }
        checkpoint::save_snapshot(&new_path, &tensors, &properties)?;
        info!(
            weight_update_step = self.state.weight_update_step;
            "saved checkpoint to {}", new_path.display()
        );

        // The old snapshot goes only once the new one is on disk.
        if let Some(old) = evict {
            checkpoint::remove_snapshot(&old);
        }
        self.metrics.bump_checkpoint();
        Ok(())
    }

    fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        info!("restoring checkpoint from {}", path.display());
        let (tensors, properties) = checkpoint::load_snapshot(path)?;
        self.session
            .set_state_tensors(&tensors)
            .map_err(RunnerErr::Engine)?;
        self.state = TrainingState::from_properties(&properties)?;

        if let Some(scaler) = &mut self.loss_scaler {
            let raw = properties
                .get(property::LOSS_SCALER_STATE)
                .ok_or(RunnerErr::MissingProperty {
                    name: property::LOSS_SCALER_STATE,
                })?;
            scaler
                .load_from_string(raw)
                .map_err(|_| RunnerErr::InvalidProperty {
                    name: property::LOSS_SCALER_STATE,
                    value: raw.clone(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use engine::Tensor;

    use super::*;
    use crate::config::{
        LossScaleMode, LrConfig, MixedPrecisionConfig, OptimizerOutputs, PipelineContext,
        SyncEventNames,
    };
    use crate::data::{Column, InMemoryDataLoader, Shard};

    struct NoopSession;

    impl Session for NoopSession {
        fn run(
            &self,
            _options: &RunOptions,
            _feed_names: &[String],
            _feeds: &[Value],
            fetch_names: &[String],
        ) -> engine::Result<Vec<Value>> {
            Ok(fetch_names.iter().map(|_| Value::Scalar(0.0)).collect())
        }

        fn state_tensors(&self) -> engine::Result<Vec<(String, Tensor)>> {
            Ok(Vec::new())
        }

        fn set_state_tensors(&self, _tensors: &[(String, Tensor)]) -> engine::Result<()> {
            Ok(())
        }
    }

    fn sync_names() -> SyncEventNames {
        SyncEventNames {
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
        }
    }

    fn pipelined_config() -> RunnerConfig {
        RunnerConfig {
            num_train_steps: 9,
            batch_size: NonZeroUsize::new(1).unwrap(),
            eval_batch_size: NonZeroUsize::new(1).unwrap(),
            gradient_accumulation_steps: NonZeroUsize::new(3).unwrap(),
            evaluation_period: NonZeroUsize::new(100).unwrap(),
            do_eval: false,
            shuffle_data: false,
            is_coordinator: true,
            use_adasum: false,
            fetch_names: vec!["loss".into(), "not_on_this_stage".into()],
            lr: LrConfig::constant("learning_rate", 0.01),
            mixed_precision: Some(MixedPrecisionConfig {
                loss_scale_feed_name: "loss_scale".into(),
                mode: LossScaleMode::Dynamic,
            }),
            optimizer_outputs: OptimizerOutputs {
                gradient_accumulation: Some("accumulated_gradients".into()),
                all_gradients_finite: Some("all_gradients_finite".into()),
                delta_all_finite: None,
            },
            checkpoint: None,
            pipeline: PipelineContext {
                stage_id: 1,
                num_stages: NonZeroUsize::new(3).unwrap(),
                num_micro_batches: NonZeroUsize::new(3).unwrap(),
                feed_names: vec!["features".into(), "loss_scale".into(), "learning_rate".into()],
                fetch_names: vec!["loss".into(), "accumulated_gradients".into()],
                sync: PipelineSync::Enabled(sync_names()),
            },
        }
    }

    fn loader() -> InMemoryDataLoader {
        InMemoryDataLoader::new(
            vec!["features".into(), "labels".into()],
            vec![Shard::new(vec![
                Column::new(2, (0..18).map(|i| i as f32).collect()),
                Column::new(1, (0..9).map(|i| i as f32).collect()),
            ])],
            1,
        )
    }

    fn runner(config: RunnerConfig) -> TrainingRunner {
        TrainingRunner::new(config, Arc::new(NoopSession)).unwrap()
    }

    #[test]
    fn training_feeds_filter_by_stage_and_carry_events() {
        let r = runner(pipelined_config());
        let (names, values) = r.prepare_feeds(StepKind::GradientAccumulate, &loader(), 0);

        // `labels` is not in this stage's allowed set.
        assert!(!names.iter().any(|n| n == "labels"));
        assert!(names.iter().any(|n| n == "features"));

        // All eight event feeds are present; batch 0 waits are sentinels,
        // records are real ids.
        let event = |name: &str| {
            let i = names.iter().position(|n| n == name).unwrap();
            values[i].as_event().unwrap()
        };
        assert_eq!(event("fw_wait"), NO_EVENT);
        assert!(event("fw_record") >= 0);
        assert!(event("bw_wait") >= 0);
    }

    #[test]
    fn evaluation_forces_sentinels_and_unit_scale() {
        let r = runner(pipelined_config());
        let (names, values) = r.prepare_feeds(StepKind::Evaluate, &loader(), 0);

        for (name, value) in names.iter().zip(&values) {
            if let Value::Event(id) = value {
                assert_eq!(*id, NO_EVENT, "event feed {name} not a sentinel");
            }
        }

        let scale_at = names.iter().position(|n| n == "loss_scale").unwrap();
        assert_eq!(values[scale_at].as_scalar(), Some(1.0));
        let lr_at = names.iter().position(|n| n == "learning_rate").unwrap();
        assert_eq!(values[lr_at].as_scalar(), Some(0.0));
    }

    #[test]
    fn accumulate_fetches_event_outputs_unconditionally() {
        let r = runner(pipelined_config());
        let fetches = r.prepare_fetches(StepKind::GradientAccumulate).unwrap();

        assert!(fetches.iter().any(|n| n == "accumulated_gradients"));
        for name in ["fw_wait_out", "fw_record_out", "bw_wait_out", "bw_record_out"] {
            assert!(fetches.iter().any(|n| n == name), "missing {name}");
        }
    }

    #[test]
    fn update_fetches_filter_to_stage_outputs() {
        let r = runner(pipelined_config());
        let fetches = r.prepare_fetches(StepKind::ModelUpdate).unwrap();

        assert!(fetches.iter().any(|n| n == "loss"));
        assert!(!fetches.iter().any(|n| n == "not_on_this_stage"));
        // This stage's allowed set does not carry the finiteness output.
        assert!(!fetches.iter().any(|n| n == "all_gradients_finite"));
    }

    #[test]
    fn update_fetches_require_finiteness_without_pipelining() {
        let mut config = pipelined_config();
        config.num_train_steps = 9;
        config.pipeline = PipelineContext::single_stage();
        let r = runner(config);
        let fetches = r.prepare_fetches(StepKind::ModelUpdate).unwrap();

        assert!(fetches.iter().any(|n| n == "all_gradients_finite"));
        assert!(fetches.iter().any(|n| n == "not_on_this_stage"));
    }

    #[test]
    fn step_classification_matches_accumulation_boundary() {
        let mut r = runner(pipelined_config());
        let kinds: Vec<StepKind> = (0..6)
            .map(|step| {
                r.state.step = step;
                r.classify()
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::GradientAccumulate,
                StepKind::GradientAccumulate,
                StepKind::ModelUpdate,
                StepKind::GradientAccumulate,
                StepKind::GradientAccumulate,
                StepKind::ModelUpdate,
            ]
        );
    }
}
