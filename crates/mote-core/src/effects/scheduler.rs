//! Scheduler effect trait definitions
//!
//! The host owns the only timer service. The engine requests one-shot timers
//! by id and the host later reports expiry through `Endpoint::on_timer`.

use crate::errors::Result;
use crate::identifiers::TimerId;

/// Host timer collaborator
pub trait SchedulerEffects: Send {
    /// Arm (or re-arm) a one-shot timer firing after `interval_ms`
    fn request_timer(&mut self, id: TimerId, interval_ms: u32) -> Result<()>;

    /// Disarm a timer; unknown ids are ignored
    fn cancel_timer(&mut self, id: TimerId);
}
