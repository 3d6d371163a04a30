//! Mock collaborator bundle

use crate::{ManualScheduler, MockCodec, MockHandshakeEngine, MockTransport, SeededRandom};
use mote_core::effects::{EffectHandlers, RandomEffects};

/// Every mock collaborator with shared inspection handles
#[derive(Debug, Clone, Default)]
pub struct MockEffects {
    /// Codec handle
    pub codec: MockCodec,
    /// Handshake engine handle
    pub handshake: MockHandshakeEngine,
    /// Transport handle
    pub transport: MockTransport,
    /// Scheduler handle
    pub scheduler: ManualScheduler,
    /// Seed for the random source
    pub seed: u64,
}

impl MockEffects {
    /// Fresh mocks with a seeded random source
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Boxed handlers sharing state with `self`
    pub fn handlers(&self) -> EffectHandlers {
        self.handlers_with_random(Box::new(SeededRandom::new(self.seed)))
    }

    /// Boxed handlers using a caller-supplied random source
    pub fn handlers_with_random(&self, random: Box<dyn RandomEffects>) -> EffectHandlers {
        EffectHandlers {
            codec: Box::new(self.codec.clone()),
            handshake: Box::new(self.handshake.clone()),
            transport: Box::new(self.transport.clone()),
            scheduler: Box::new(self.scheduler.clone()),
            random,
        }
    }
}
