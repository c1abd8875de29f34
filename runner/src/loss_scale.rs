use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::config::LossScaleMode;
use crate::error::Result;

/// Initial scale when dynamic scaling starts fresh.
const DEFAULT_DYNAMIC_SCALE: f32 = 65536.0;
/// Consecutive finite updates before the scale doubles.
const DEFAULT_UP_SCALE_WINDOW: usize = 2000;
const MIN_LOSS_SCALE: f32 = 1.0;
const MAX_LOSS_SCALE: f32 = 16_777_216.0;

/// Adaptive scalar applied to the loss under mixed precision.
///
/// Static mode keeps the configured scale forever. Dynamic mode doubles
/// the scale after a window of consecutive finite-gradient updates and
/// halves it immediately when a non-finite gradient shows up; the
/// optimizer graph is responsible for skipping the update itself, the
/// scaler only tracks the scale.
#[derive(Debug, Clone)]
pub struct LossScaler {
    feed_name: String,
    dynamic: bool,
    initial_scale: f32,
    loss_scale: f32,
    successful_steps: usize,
    up_scale_window: usize,
}

#[derive(Serialize, Deserialize)]
struct SavedState {
    loss_scale: f32,
    successful_steps: usize,
}

impl LossScaler {
    pub fn new(feed_name: String, mode: LossScaleMode) -> Self {
        let (dynamic, scale) = match mode {
            LossScaleMode::Static(scale) => (false, scale),
            LossScaleMode::Dynamic => (true, DEFAULT_DYNAMIC_SCALE),
        };
        Self {
            feed_name,
            dynamic,
            initial_scale: scale,
            loss_scale: scale,
            successful_steps: 0,
            up_scale_window: DEFAULT_UP_SCALE_WINDOW,
        }
    }

    /// Overrides the doubling window.
    pub fn with_up_scale_window(mut self, window: NonZeroUsize) -> Self {
        self.up_scale_window = window.get();
        self
    }

    #[inline]
    pub fn feed_name(&self) -> &str {
        &self.feed_name
    }

    #[inline]
    pub fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    #[inline]
    pub fn successful_steps(&self) -> usize {
        self.successful_steps
    }

    /// Consumes one weight-update step's gradient-finiteness flag.
    pub fn update(&mut self, all_gradients_finite: bool) {
        if !self.dynamic {
            return;
        }
        if all_gradients_finite {
            self.successful_steps += 1;
            if self.successful_steps >= self.up_scale_window {
                self.loss_scale = (self.loss_scale * 2.0).min(MAX_LOSS_SCALE);
                self.successful_steps = 0;
            }
        } else {
            self.loss_scale = (self.loss_scale / 2.0).max(MIN_LOSS_SCALE);
            self.successful_steps = 0;
        }
    }

    /// Forgets all adaptation and returns to the initial scale.
    pub fn reset(&mut self) {
        self.loss_scale = self.initial_scale;
        self.successful_steps = 0;
    }

    /// Serializes scale and counter for the checkpoint property map.
    pub fn save_to_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&SavedState {
            loss_scale: self.loss_scale,
            successful_steps: self.successful_steps,
        })?)
    }

    /// Restores scale and counter from a checkpoint property.
    pub fn load_from_string(&mut self, raw: &str) -> Result<()> {
        let state: SavedState = serde_json::from_str(raw)?;
        self.loss_scale = state.loss_scale;
        self.successful_steps = state.successful_steps;
        Ok(())
    }
}
