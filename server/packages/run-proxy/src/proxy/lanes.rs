//! Arrival-order slots for Run commands.
//!
//! `acp_open` and `prompt_send` resolve their Run asynchronously before they
//! reach the Run queue, so the queue alone cannot see the order in which the
//! link delivered them. A slot is reserved synchronously at dispatch and
//! each slot's turn starts once every earlier slot of the same run id is
//! done. Closing a lane refuses every slot reserved before the close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use run_proxy_error::RuntimeError;
use tokio::sync::oneshot;

type Turn = Shared<BoxFuture<'static, ()>>;

struct Lane {
    tail: Turn,
    last_slot: u64,
    epoch: u64,
}

#[derive(Default)]
struct LanesInner {
    lanes: HashMap<String, Lane>,
    next_slot: u64,
}

#[derive(Clone, Default)]
pub struct RunLanes {
    inner: Arc<StdMutex<LanesInner>>,
}

impl std::fmt::Debug for RunLanes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLanes")
            .field("active", &lock(&self.inner).lanes.len())
            .finish()
    }
}

fn lock(inner: &StdMutex<LanesInner>) -> MutexGuard<'_, LanesInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next slot for `run_id`. Never blocks.
    pub fn reserve(&self, run_id: &str) -> LaneSlot {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let mut inner = lock(&self.inner);
        inner.next_slot += 1;
        let id = inner.next_slot;
        let lane = inner.lanes.entry(run_id.to_string()).or_insert_with(|| Lane {
            tail: futures::future::ready(()).boxed().shared(),
            last_slot: 0,
            epoch: 0,
        });
        let turn = lane.tail.clone();
        let prev = turn.clone();
        lane.tail = async move {
            prev.await;
            let _ = done_rx.await;
        }
        .boxed()
        .shared();
        lane.last_slot = id;
        LaneSlot {
            lanes: self.inner.clone(),
            run_id: run_id.to_string(),
            id,
            epoch: lane.epoch,
            turn,
            _done: done_tx,
        }
    }

    /// Refuses every slot already reserved for `run_id`. Later slots are
    /// unaffected.
    pub fn close(&self, run_id: &str) {
        if let Some(lane) = lock(&self.inner).lanes.get_mut(run_id) {
            lane.epoch += 1;
        }
    }

    /// `true` while some slot for `run_id` is waiting or running.
    pub fn is_active(&self, run_id: &str) -> bool {
        lock(&self.inner).lanes.contains_key(run_id)
    }
}

/// One reserved position in a lane. Dropping the slot hands the turn to the
/// next one.
pub struct LaneSlot {
    lanes: Arc<StdMutex<LanesInner>>,
    run_id: String,
    id: u64,
    epoch: u64,
    turn: Turn,
    _done: oneshot::Sender<()>,
}

impl std::fmt::Debug for LaneSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneSlot")
            .field("run_id", &self.run_id)
            .field("id", &self.id)
            .finish()
    }
}

impl LaneSlot {
    /// Waits for every earlier slot, then fails if the lane was closed after
    /// this slot was reserved.
    pub async fn wait_turn(&self) -> Result<(), RuntimeError> {
        self.turn.clone().await;
        self.check_current()
    }

    /// Fails once the lane has been closed after this slot was reserved.
    pub fn check_current(&self) -> Result<(), RuntimeError> {
        let closed = lock(&self.lanes)
            .lanes
            .get(&self.run_id)
            .is_some_and(|lane| lane.epoch != self.epoch);
        if closed {
            return Err(RuntimeError::RunClosed {
                run_id: self.run_id.clone(),
            });
        }
        Ok(())
    }
}

impl Drop for LaneSlot {
    fn drop(&mut self) {
        // A slot dropped before its turn still orders the ones behind it.
        if self.turn.peek().is_none() {
            return;
        }
        let mut inner = lock(&self.lanes);
        let last = inner
            .lanes
            .get(&self.run_id)
            .is_some_and(|lane| lane.last_slot == self.id);
        if last {
            inner.lanes.remove(&self.run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[tokio::test]
    async fn reservation_order_wins_over_arrival_at_the_lane() {
        let lanes = RunLanes::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let first = lanes.reserve("r1");
        let second = lanes.reserve("r1");

        // The second task reaches its turn first; it must still run last.
        let late = {
            let order = order.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                first.wait_turn().await.expect("first turn");
                order.lock().expect("order").push("first");
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(first);
            })
        };
        let early = {
            let order = order.clone();
            tokio::spawn(async move {
                second.wait_turn().await.expect("second turn");
                order.lock().expect("order").push("second");
            })
        };
        late.await.expect("join");
        early.await.expect("join");

        assert_eq!(*order.lock().expect("order"), vec!["first", "second"]);
        assert!(!lanes.is_active("r1"));
    }

    #[tokio::test]
    async fn lanes_are_independent_per_run() {
        let lanes = RunLanes::new();
        let busy = lanes.reserve("r1");
        let other = lanes.reserve("r2");
        tokio::time::timeout(Duration::from_secs(1), other.wait_turn())
            .await
            .expect("r2 does not wait on r1")
            .expect("turn");
        busy.wait_turn().await.expect("turn");
    }

    #[tokio::test]
    async fn close_refuses_earlier_slots_only() {
        let lanes = RunLanes::new();
        let running = lanes.reserve("r1");
        let queued = lanes.reserve("r1");
        running.wait_turn().await.expect("turn");

        lanes.close("r1");
        let after_close = lanes.reserve("r1");
        drop(running);

        let refused = queued.wait_turn().await.expect_err("reserved before close");
        assert!(matches!(refused, RuntimeError::RunClosed { .. }));
        drop(queued);
        after_close.wait_turn().await.expect("reserved after close");
    }

    #[tokio::test]
    async fn abandoned_slot_keeps_later_ones_waiting() {
        let lanes = RunLanes::new();
        let running = lanes.reserve("r1");
        let abandoned = lanes.reserve("r1");
        let last = lanes.reserve("r1");
        running.wait_turn().await.expect("turn");
        drop(abandoned);

        let early = tokio::time::timeout(Duration::from_millis(50), last.wait_turn()).await;
        assert!(early.is_err(), "must wait for the running slot");
        drop(running);
        last.wait_turn().await.expect("turn after running");
    }
}
