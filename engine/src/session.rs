use crate::error::Result;
use crate::value::{Tensor, Value};

/// Per-invocation execution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Restrict execution to the subgraph reachable from the requested
    /// fetches. Used for accumulation and evaluation steps, where the
    /// optimizer path must not run.
    pub only_execute_path_to_fetches: bool,
}

/// One loaded model graph, ready to execute.
///
/// A session is shared read-mostly across worker threads during concurrent
/// dispatch; implementations must be safe for concurrent invocation. The
/// runner adds no locking of its own around `run`, it only serializes
/// access per worker slot.
pub trait Session: Send + Sync {
    /// Executes the graph once.
    ///
    /// # Args
    /// * `options` - Execution options for this invocation.
    /// * `feed_names` - Names of the inputs, parallel to `feeds`.
    /// * `feeds` - Input values, parallel to `feed_names`.
    /// * `fetch_names` - Names of the outputs to produce.
    ///
    /// # Returns
    /// Output values parallel to `fetch_names`.
    ///
    /// # Errors
    /// Returns `EngineErr` on unknown names or execution failure.
    fn run(
        &self,
        options: &RunOptions,
        feed_names: &[String],
        feeds: &[Value],
        fetch_names: &[String],
    ) -> Result<Vec<Value>>;

    /// Snapshot of the trainable state (weights, optimizer moments),
    /// as persisted into checkpoints.
    fn state_tensors(&self) -> Result<Vec<(String, Tensor)>>;

    /// Restores a previously snapshotted state.
    fn set_state_tensors(&self, tensors: &[(String, Tensor)]) -> Result<()>;
}
