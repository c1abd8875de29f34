use std::{num::NonZeroUsize, sync::Arc};

use engine::{RunOptions, Session, Value};
use tokio::task::JoinHandle;

use crate::error::{Result, RunnerErr};

/// One execution's owned inputs and requested outputs.
///
/// Ownership moves into the worker task at dispatch, so a later dispatch
/// into the same slot can never overwrite buffers an in-flight task still
/// reads.
#[derive(Debug)]
pub struct WorkItem {
    pub feed_names: Vec<String>,
    pub feeds: Vec<Value>,
    pub fetch_names: Vec<String>,
    pub options: RunOptions,
}

/// Outputs collected from one joined execution.
#[derive(Debug)]
pub struct RunOutput {
    pub fetch_names: Vec<String>,
    pub fetches: Vec<Value>,
}

impl RunOutput {
    /// Looks up a fetched value by name.
    pub fn fetch(&self, name: &str) -> Option<&Value> {
        self.fetch_names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.fetches.get(i))
    }
}

/// Fixed set of execution slots, one per pipeline stage.
///
/// Each slot holds at most one in-flight task. Work runs on the runtime's
/// long-lived blocking pool; a slot must be joined before it is reused,
/// and execution failures surface at join time, never concurrently.
pub struct WorkerPool {
    slots: Vec<Option<JoinHandle<engine::Result<RunOutput>>>>,
}

impl WorkerPool {
    pub fn new(num_slots: NonZeroUsize) -> Self {
        let mut slots = Vec::with_capacity(num_slots.get());
        slots.resize_with(num_slots.get(), || None);
        Self { slots }
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_idle(&self, slot: usize) -> bool {
        self.slots[slot].is_none()
    }

    /// Begins an asynchronous execution on `slot`.
    ///
    /// # Errors
    /// Returns `SlotBusy` if the slot still holds an unjoined task.
    pub fn dispatch(
        &mut self,
        slot: usize,
        session: Arc<dyn Session>,
        item: WorkItem,
    ) -> Result<()> {
        if self.slots[slot].is_some() {
            return Err(RunnerErr::SlotBusy { slot });
        }
        let handle = tokio::task::spawn_blocking(move || {
            let fetches =
                session.run(&item.options, &item.feed_names, &item.feeds, &item.fetch_names)?;
            Ok(RunOutput {
                fetch_names: item.fetch_names,
                fetches,
            })
        });
        self.slots[slot] = Some(handle);
        Ok(())
    }

    /// Waits for the task in `slot` and returns its outputs.
    ///
    /// # Returns
    /// `None` when the slot was already idle (joining an idle slot is a
    /// no-op).
    ///
    /// # Errors
    /// Surfaces engine failures and worker-task panics.
    pub async fn join(&mut self, slot: usize) -> Result<Option<RunOutput>> {
        let Some(handle) = self.slots[slot].take() else {
            return Ok(None);
        };
        let output = handle
            .await
            .map_err(|e| RunnerErr::Task {
                slot,
                msg: e.to_string(),
            })?
            .map_err(RunnerErr::Engine)?;
        Ok(Some(output))
    }

    /// Waits until every slot is idle.
    ///
    /// Outputs still in flight are discarded. If any task failed, the
    /// first failure is returned — after all slots have been drained, so
    /// the barrier holds even on the error path.
    pub async fn join_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for slot in 0..self.slots.len() {
            if let Err(e) = self.join(slot).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
