use std::{env, num::NonZeroUsize, sync::Arc, sync::Mutex};

use engine::{RunOptions, Session, Tensor, Value};
use log::info;

use runner::{
    Column, DataLoader, InMemoryDataLoader, LossScaleMode, LrConfig, MixedPrecisionConfig,
    OptimizerOutputs, PipelineContext, RunnerConfig, Shard, TrainingRunner,
};

/// Stand-in engine for the demo: one state tensor, loss = mean of the
/// first feed tensor, every finiteness flag true.
struct DemoSession {
    weights: Mutex<Vec<f32>>,
}

impl DemoSession {
    fn new(num_params: usize) -> Self {
        Self {
            weights: Mutex::new(vec![0.0; num_params]),
        }
    }
}

impl Session for DemoSession {
    fn run(
        &self,
        _options: &RunOptions,
        _feed_names: &[String],
        feeds: &[Value],
        fetch_names: &[String],
    ) -> engine::Result<Vec<Value>> {
        let loss = feeds
            .iter()
            .find_map(Value::as_tensor)
            .map(|t| t.data().iter().sum::<f32>() / t.len() as f32)
            .unwrap_or(0.0);

        Ok(fetch_names
            .iter()
            .map(|name| {
                if name.contains("finite") {
                    Value::Flag(true)
                } else {
                    Value::Scalar(loss)
                }
            })
            .collect())
    }

    fn state_tensors(&self) -> engine::Result<Vec<(String, Tensor)>> {
        let weights = self
            .weights
            .lock()
            .map_err(|_| engine::EngineErr::Run("weights lock poisoned".into()))?;
        Ok(vec![(
            "weights".to_string(),
            Tensor::new(vec![weights.len()], weights.clone()),
        )])
    }

    fn set_state_tensors(&self, tensors: &[(String, Tensor)]) -> engine::Result<()> {
        let mut weights = self
            .weights
            .lock()
            .map_err(|_| engine::EngineErr::Run("weights lock poisoned".into()))?;
        for (name, tensor) in tensors {
            if name == "weights" {
                *weights = tensor.data().to_vec();
            }
        }
        Ok(())
    }
}

fn demo_loader(num_samples: usize) -> InMemoryDataLoader {
    let features: Vec<f32> = (0..num_samples * 2).map(|i| i as f32 * 0.1).collect();
    let labels: Vec<f32> = (0..num_samples).map(|i| i as f32).collect();
    InMemoryDataLoader::new(
        vec!["features".into(), "labels".into()],
        vec![Shard::new(vec![
            Column::new(2, features),
            Column::new(1, labels),
        ])],
        42,
    )
}

#[tokio::main]
async fn main() -> runner::Result<()> {
    env_logger::init();

    let num_train_steps = env::var("TRAIN_STEPS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(16);

    let config = RunnerConfig {
        num_train_steps,
        batch_size: NonZeroUsize::new(2).unwrap(),
        eval_batch_size: NonZeroUsize::new(2).unwrap(),
        gradient_accumulation_steps: NonZeroUsize::new(4).unwrap(),
        evaluation_period: NonZeroUsize::new(8).unwrap(),
        do_eval: true,
        shuffle_data: true,
        is_coordinator: true,
        use_adasum: false,
        fetch_names: vec!["loss".into()],
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
        pipeline: PipelineContext::single_stage(),
    };

    let session = Arc::new(DemoSession::new(8));
    let mut runner = TrainingRunner::new(config, session)?;

    let mut train = demo_loader(64);
    let mut test = demo_loader(8);
    info!(steps = num_train_steps, shards = train.num_shards(); "starting demo run");

    runner.run(&mut train, Some(&mut test)).await?;

    let metrics = runner.metrics();
    info!(
        batches = metrics.batches,
        update_steps = metrics.update_steps,
        eval_passes = metrics.eval_passes;
        "demo run finished"
    );
    Ok(())
}
