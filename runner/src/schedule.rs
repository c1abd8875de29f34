use std::num::NonZeroUsize;

/// Sentinel id meaning "do not wait / do not record".
pub const NO_EVENT: i64 = -1;

/// Direction of the pass a synchronization event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Forward,
    Backward,
}

/// Position of an event around one compute slot.
///
/// A slot executes as Wait -> Recv -> WaitAfterRecv -> compute ->
/// RecordBeforeSend -> Send -> Record; the two waits pair with the two
/// records of the slot scheduled just before it on the same stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    Wait,
    WaitAfterRecv,
    RecordBeforeSend,
    Record,
}

/// Deterministic mapping of (stage, micro-batch, pass, role) to event ids.
///
/// Per stage the round is a timeline of `2 * round_size` slots: forward
/// micro-batch `b` at position `b`, backward micro-batch `b` at position
/// `round_size + b`. Every slot owns two record ids; the waits of a slot
/// resolve to the records of its predecessor, so consecutive micro-batches
/// on one stage cannot overwrite each other's activation buffers. The
/// first slot of a stage has nothing to wait for and yields [`NO_EVENT`].
#[derive(Debug, Clone)]
pub struct EventSchedule {
    num_stages: usize,
    round_size: usize,
}

impl EventSchedule {
    pub fn new(num_stages: NonZeroUsize, round_size: NonZeroUsize) -> Self {
        Self {
            num_stages: num_stages.get(),
            round_size: round_size.get(),
        }
    }

    #[inline]
    pub fn round_size(&self) -> usize {
        self.round_size
    }

    /// Returns the event id for one (stage, micro-batch, pass, role) tuple.
    ///
    /// Pure and total: the micro-batch index is reduced modulo the round
    /// size, and identical inputs always yield identical ids. Ids are
    /// namespaced per stage so two stages sharing a process never alias.
    pub fn event_id(&self, stage: usize, micro_batch: usize, pass: Pass, role: EventRole) -> i64 {
        debug_assert!(stage < self.num_stages, "stage {stage} out of range");

        let b = micro_batch % self.round_size;
        let t = match pass {
            Pass::Forward => b,
            Pass::Backward => self.round_size + b,
        };
        let base = (stage * 4 * self.round_size) as i64;

        match role {
            EventRole::RecordBeforeSend => base + (2 * t) as i64,
            EventRole::Record => base + (2 * t + 1) as i64,
            EventRole::Wait if t == 0 => NO_EVENT,
            EventRole::Wait => base + (2 * (t - 1)) as i64,
            EventRole::WaitAfterRecv if t == 0 => NO_EVENT,
            EventRole::WaitAfterRecv => base + (2 * (t - 1) + 1) as i64,
        }
    }
}
