use crate::multiplexer::SocketCallbacks;
use crate::socket::Socket;
use crate::timer::{HandshakeTimer, TimerCommand};
use mote_core::effects::{
    HandshakeIo, SchedulerEffects, SendMeta, TimerStatus, TransportEffects,
};
use mote_core::{MoteError, Result, TimerId};
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Handshake engine view of one session: its socket, peer and timer
pub(crate) struct SessionIo<'a> {
    pub(crate) transport: &'a mut dyn TransportEffects,
    pub(crate) scheduler: &'a mut dyn SchedulerEffects,
    pub(crate) callbacks: &'a mut dyn SocketCallbacks,
    pub(crate) socket: &'a mut Socket,
    pub(crate) timer: &'a mut HandshakeTimer,
    pub(crate) timer_id: TimerId,
    pub(crate) peer: SocketAddr,
    pub(crate) local: Option<IpAddr>,
}

impl HandshakeIo for SessionIo<'_> {
    fn send(&mut self, datagram: &[u8]) -> Result<usize> {
        if !self.socket.real {
            self.callbacks
                .virtual_send(self.socket.owner, self.peer, datagram)?;
            return Ok(datagram.len());
        }

        let handle = self.socket.handle.ok_or_else(|| {
            MoteError::internal(format!("socket {} has no transport handle", self.socket.id))
        })?;
        let meta = SendMeta {
            source: self.local,
            ..SendMeta::default()
        };
        self.transport.send_to(handle, self.peer, &meta, datagram)
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.socket.pending.take()
    }

    fn set_timer(&mut self, intermediate_ms: u32, final_ms: u32) {
        match self.timer.arm(intermediate_ms, final_ms) {
            TimerCommand::Start(interval_ms) => {
                if let Err(error) = self.scheduler.request_timer(self.timer_id, interval_ms) {
                    warn!(
                        timer_id = %self.timer_id,
                        peer = %self.peer,
                        error = %error,
                        "Failed to arm handshake timer"
                    );
                    self.timer.cancel();
                }
            }
            TimerCommand::Cancel => self.scheduler.cancel_timer(self.timer_id),
        }
    }

    fn timer_status(&self) -> TimerStatus {
        self.timer.status()
    }
}
