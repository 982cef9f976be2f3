//! One-shot relative timers.
//!
//! Each timer is bound to one instance queue and one timer message type; on
//! expiry it posts that type onto the queue. Arming and disarming both cancel
//! any outstanding expiry *and* drain already-delivered messages of the
//! timer's type, so a stale expiry can never be observed after a reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::queue::{Message, MessageQueue};

/// The protocol timers, each with its own message type above the PDU codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Sender: wait for the initial acknowledgement.
    AckWait,
    /// Sender: inter-acknowledgement gap; expiry triggers Go-Back-N.
    Retransmit,
    /// Sender: overall progress bound; expiry aborts the connection.
    Abort,
    /// Receiver: idle bound; expiry aborts the connection.
    Idle,
}

impl TimerKind {
    pub const fn type_code(self) -> u32 {
        match self {
            TimerKind::AckWait => 12,
            TimerKind::Retransmit => 13,
            TimerKind::Abort => 14,
            TimerKind::Idle => 15,
        }
    }
}

/// A one-shot timer owned by a protocol instance.
///
/// Created at instance start, dropped (and thereby disarmed) at instance end.
#[derive(Debug)]
pub struct Timer {
    kind: TimerKind,
    queue: Arc<MessageQueue>,
    // bumped on every set/reset; an expiry whose generation is stale lost a
    // race against a reset and must not deliver
    generation: Arc<AtomicU64>,
}

impl Timer {
    pub fn new(kind: TimerKind, queue: Arc<MessageQueue>) -> Self {
        Self {
            kind,
            queue,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// (Re-)arms the timer. Pending expiries of this timer are cancelled and
    /// drained first.
    pub fn set(&self, timeout: Duration) {
        let armed = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.queue.drain(self.kind.type_code());

        let kind = self.kind;
        let queue = self.queue.clone();
        let generation = self.generation.clone();
        thread::spawn(move || {
            thread::sleep(timeout);
            // checked under the queue lock, so a concurrent reset either
            // invalidates the generation before this runs or drains after
            queue.write_if(Message::Timer(kind), || {
                generation.load(Ordering::SeqCst) == armed
            });
        });
    }

    /// Disarms the timer and drains pending expiries of its type.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.queue.drain(self.kind.type_code());
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.reset();
    }
}
