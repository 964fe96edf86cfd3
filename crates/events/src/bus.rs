//! Broadcast pub/sub for booking events.
//!
//! Delivery is at-least-once with no ordering across publishers and no
//! persistence. Reconciliation treats a failed publish as a warning.

use std::sync::mpsc::{Receiver, TryRecvError};

/// Receiving end of a bus subscription. Sees every message published after
/// it was created.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Everything buffered so far, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Shared between concurrently running webhook handlers.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}
