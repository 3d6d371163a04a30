//! Tasklet host
//!
//! Drives an [`Endpoint`] from a single-threaded tokio runtime: the periodic
//! `exec` tick, transport polling, and delivery of handshake timers armed
//! through [`HostScheduler`]. The endpoint never runs concurrently with itself;
//! every callback happens on the task that owns it.
//!
//! # Blocking Lock Usage
//!
//! `HostScheduler` shares its deadline table through `parking_lot::Mutex`.
//! The lock is never held across `.await` points and guards only map updates.

use mote_coap::Endpoint;
use mote_core::effects::SchedulerEffects;
use mote_core::{MoteError, Result, Tick, TimerId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Default interval between transport polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One-shot timers backed by wall-clock deadlines
///
/// Clones share the same table, so the copy handed to the endpoint and the
/// one kept by the host observe the same timers.
#[derive(Debug, Clone, Default)]
pub struct HostScheduler {
    deadlines: Arc<Mutex<BTreeMap<TimerId, Instant>>>,
}

impl HostScheduler {
    /// Scheduler with no armed timers
    pub fn new() -> Self {
        Self::default()
    }

    /// Disarm and return every timer due at `now`
    pub fn take_due(&self, now: Instant) -> Vec<TimerId> {
        let mut deadlines = self.deadlines.lock();
        let due: Vec<TimerId> = deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            deadlines.remove(id);
        }
        due
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.lock().values().min().copied()
    }

    /// Number of armed timers
    pub fn armed(&self) -> usize {
        self.deadlines.lock().len()
    }
}

impl SchedulerEffects for HostScheduler {
    fn request_timer(&mut self, id: TimerId, interval_ms: u32) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(interval_ms));
        self.deadlines.lock().insert(id, deadline);
        Ok(())
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.deadlines.lock().remove(&id);
    }
}

/// Owns an endpoint and runs its tasklet loop
pub struct TaskletHost {
    endpoint: Endpoint,
    scheduler: HostScheduler,
    exec_interval: Duration,
    poll_interval: Duration,
    started: Instant,
}

impl std::fmt::Debug for TaskletHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskletHost")
            .field("exec_interval", &self.exec_interval)
            .field("poll_interval", &self.poll_interval)
            .field("armed_timers", &self.scheduler.armed())
            .finish_non_exhaustive()
    }
}

impl TaskletHost {
    /// Host for `endpoint`; `scheduler` must be a clone of the one it was built with
    pub fn new(endpoint: Endpoint, scheduler: HostScheduler) -> Self {
        let exec_interval = Duration::from_millis(endpoint.config().exec_interval_ms);
        Self {
            endpoint,
            scheduler,
            exec_interval,
            poll_interval: DEFAULT_POLL_INTERVAL,
            started: Instant::now(),
        }
    }

    /// Override the transport poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The hosted endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Mutable access for registering services and sending requests
    pub fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    /// Whole seconds since the host was created
    pub fn ticks(&self) -> Tick {
        self.started.elapsed().as_secs()
    }

    /// Poll the transport and deliver expired timers
    pub fn service_io(&mut self) {
        self.endpoint.poll_transport();
        for id in self.scheduler.take_due(Instant::now()) {
            debug!(timer = %id, "Delivering handshake timer");
            self.endpoint.on_timer(id);
        }
    }

    /// Run one periodic tick
    pub fn exec(&mut self) {
        let now = self.ticks();
        self.endpoint.exec(now);
    }

    /// Run until `shutdown` reports `true` or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Endpoint {
        let mut exec = tokio::time::interval(self.exec_interval);
        exec.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            exec_ms = self.exec_interval.as_millis(),
            poll_ms = self.poll_interval.as_millis(),
            "Tasklet host started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = exec.tick() => self.exec(),
                _ = poll.tick() => self.service_io(),
            }
        }

        info!(ticks = self.ticks(), "Tasklet host stopped");
        self.endpoint
    }

    /// Run on a dedicated current-thread runtime, blocking the caller
    pub fn run_blocking(self, shutdown: watch::Receiver<bool>) -> Result<Endpoint> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|error| MoteError::fatal(format!("cannot start host runtime: {error}")))?;
        Ok(runtime.block_on(self.run(shutdown)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mote_coap::{InboundRequest, RequestDisposition, Response};
    use mote_core::{CoapMessage, Code, EngineConfig, MessageType, MethodMask, ServiceOptions, Token};
    use mote_testkit::{init_test_tracing, local_addr, peer, MockCodec, MockEffects};

    fn hosted(effects: &MockEffects) -> TaskletHost {
        let scheduler = HostScheduler::new();
        let mut handlers = effects.handlers();
        handlers.scheduler = Box::new(scheduler.clone());
        let endpoint = Endpoint::new(EngineConfig::testing(), handlers).unwrap();
        TaskletHost::new(endpoint, scheduler).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_due_timers_are_taken_once() {
        let mut scheduler = HostScheduler::new();
        let soon = TimerId::new(1).unwrap();
        let later = TimerId::new(2).unwrap();
        scheduler.request_timer(soon, 0).unwrap();
        scheduler.request_timer(later, 60_000).unwrap();

        let now = Instant::now();
        assert_eq!(scheduler.take_due(now), vec![soon]);
        assert!(scheduler.take_due(now).is_empty());
        assert_eq!(scheduler.armed(), 1);

        scheduler.cancel_timer(later);
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn test_clones_share_deadlines() {
        let scheduler = HostScheduler::new();
        let mut handle = scheduler.clone();
        handle.request_timer(TimerId::new(9).unwrap(), 5).unwrap();
        assert_eq!(scheduler.armed(), 1);
    }

    #[tokio::test]
    async fn test_host_answers_request_then_stops() {
        init_test_tracing();
        let effects = MockEffects::new(3);
        let mut host = hosted(&effects);
        let id = host
            .endpoint_mut()
            .initialize(0, 5683, ServiceOptions::empty(), None)
            .unwrap();
        host.endpoint_mut()
            .register_uri(id, "ping", MethodMask::GET, |_: &InboundRequest| {
                RequestDisposition::Respond(Response::new(Code::CONTENT))
            })
            .unwrap();

        let request = CoapMessage::request(MessageType::Confirmable, Code::GET, "ping")
            .with_msg_id(77)
            .with_token(Token::from_slice(&[1, 2]).unwrap());
        effects
            .transport
            .inject(5683, peer(4, 40000), Some(local_addr()), MockCodec::encode(&request));

        let (stop, shutdown) = watch::channel(false);
        let (endpoint, _) = tokio::join!(host.run(shutdown), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.send(true).unwrap();
        });

        let sent = effects.transport.take_sent();
        assert_eq!(sent.len(), 1);
        let reply = MockCodec::decode(&sent[0].payload).unwrap();
        assert_eq!(reply.msg_type, MessageType::Acknowledgement);
        assert_eq!(reply.msg_id, 77);
        assert_eq!(reply.code, Code::CONTENT);
        assert_eq!(endpoint.transaction_count(), 0);
    }

    #[test]
    fn test_run_blocking_returns_on_dropped_sender() {
        let effects = MockEffects::new(4);
        let host = hosted(&effects);
        let (stop, shutdown) = watch::channel(false);
        drop(stop);
        let endpoint = host.run_blocking(shutdown).unwrap();
        assert_eq!(endpoint.transaction_count(), 0);
    }
}
