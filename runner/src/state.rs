use std::collections::BTreeMap;

use crate::error::{Result, RunnerErr};

/// Checkpoint property keys.
pub mod property {
    pub const STEP: &str = "step";
    pub const ROUND: &str = "round";
    pub const WEIGHT_UPDATE_STEP: &str = "weight_update_step";
    pub const TRAINING_DATA_SET_INDEX: &str = "training_data_set_index";
    pub const LOSS_SCALER_STATE: &str = "loss_scaler_state";
}

/// Mutable training-progress counters.
///
/// Initialized to zero or restored from a checkpoint; advanced once per
/// processed batch / applied update; persisted at checkpoint boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingState {
    /// Global step within the current round.
    pub step: usize,
    /// Completed passes over all shards.
    pub round: usize,
    /// Applied weight updates.
    pub weight_update_step: usize,
    /// Shard currently being consumed.
    pub shard_index: usize,
}

impl TrainingState {
    /// Encodes the counters into the checkpoint property map.
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert(property::STEP.to_string(), self.step.to_string());
        props.insert(property::ROUND.to_string(), self.round.to_string());
        props.insert(
            property::WEIGHT_UPDATE_STEP.to_string(),
            self.weight_update_step.to_string(),
        );
        props.insert(
            property::TRAINING_DATA_SET_INDEX.to_string(),
            self.shard_index.to_string(),
        );
        props
    }

    /// Decodes the counters from a checkpoint property map.
    ///
    /// # Errors
    /// A missing or malformed property is a hard failure — counters are
    /// never silently defaulted.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            step: parse_property(props, property::STEP)?,
            round: parse_property(props, property::ROUND)?,
            weight_update_step: parse_property(props, property::WEIGHT_UPDATE_STEP)?,
            shard_index: parse_property(props, property::TRAINING_DATA_SET_INDEX)?,
        })
    }
}

fn parse_property(props: &BTreeMap<String, String>, name: &'static str) -> Result<usize> {
    let raw = props
        .get(name)
        .ok_or(RunnerErr::MissingProperty { name })?;
    raw.parse().map_err(|_| RunnerErr::InvalidProperty {
        name,
        value: raw.clone(),
    })
}
