//! Manual scheduler
//!
//! Remembers armed timers; tests decide when they fire by calling the engine's
//! `on_timer` themselves.

use mote_core::effects::SchedulerEffects;
use mote_core::{MoteError, Result, TimerId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct SchedulerState {
    armed: BTreeMap<TimerId, u32>,
    requests: Vec<(TimerId, u32)>,
    cancels: Vec<TimerId>,
    fail_requests: bool,
}

/// Manually driven scheduler; clones share state
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl ManualScheduler {
    /// Scheduler with nothing armed
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval of an armed timer
    pub fn armed_interval(&self, id: TimerId) -> Option<u32> {
        self.state.lock().armed.get(&id).copied()
    }

    /// Ids of every armed timer
    pub fn armed(&self) -> Vec<TimerId> {
        self.state.lock().armed.keys().copied().collect()
    }

    /// Every request made, in order
    pub fn requests(&self) -> Vec<(TimerId, u32)> {
        self.state.lock().requests.clone()
    }

    /// Every cancellation made, in order
    pub fn cancels(&self) -> Vec<TimerId> {
        self.state.lock().cancels.clone()
    }

    /// Disarm a timer as the host does right before delivering it
    pub fn take(&self, id: TimerId) -> Option<u32> {
        self.state.lock().armed.remove(&id)
    }

    /// Make subsequent requests fail
    pub fn fail_requests(&self, fail: bool) {
        self.state.lock().fail_requests = fail;
    }
}

impl SchedulerEffects for ManualScheduler {
    fn request_timer(&mut self, id: TimerId, interval_ms: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_requests {
            return Err(MoteError::resource_exhausted("mock scheduler full"));
        }
        state.armed.insert(id, interval_ms);
        state.requests.push((id, interval_ms));
        Ok(())
    }

    fn cancel_timer(&mut self, id: TimerId) {
        let mut state = self.state.lock();
        state.armed.remove(&id);
        state.cancels.push(id);
    }
}
