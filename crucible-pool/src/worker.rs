use tokio::time::Instant;

use crucible_core::ChatId;

/// Pool-side lifecycle state of a tracked worker.
///
/// Transitions are monotonic toward removal:
///
/// ```text
/// Provisioning --ready-->  Ready --acquire--> Assigned --release--> Terminating
///      \                     \                    \                      |
///       --------failure--------------failure------------observed gone---+--> (entry dropped)
/// ```
///
/// There is no explicit `Gone` record; a gone worker is an absent entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created (or adopted), waiting for the orchestrator to report running.
    Provisioning,
    /// Running and idle in the ready queue.
    Ready,
    /// Bound to one in-flight request.
    Assigned,
    /// Deletion requested; waiting for the orchestrator to confirm.
    Terminating,
}

/// Bookkeeping for one worker the pool knows about.
#[derive(Debug)]
pub struct TrackedWorker {
    pub state: WorkerState,
    /// When the worker entered its current state. Drives the stuck-state
    /// timers: no state other than the (absent) terminal one may be held
    /// without a bound.
    pub since: Instant,
    /// Session binding, set while `Assigned`.
    pub chat_id: Option<ChatId>,
}

impl TrackedWorker {
    pub fn new(state: WorkerState) -> Self {
        Self {
            state,
            since: Instant::now(),
            chat_id: None,
        }
    }

    /// Move to `state` and restart the state timer.
    pub fn transition(&mut self, state: WorkerState) {
        self.state = state;
        self.since = Instant::now();
        if state != WorkerState::Assigned {
            self.chat_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_resets_binding() {
        let mut w = TrackedWorker::new(WorkerState::Ready);
        w.transition(WorkerState::Assigned);
        w.chat_id = Some(ChatId::from("chat-1"));

        w.transition(WorkerState::Terminating);
        assert_eq!(w.chat_id, None);
        assert_eq!(w.state, WorkerState::Terminating);
    }
}
