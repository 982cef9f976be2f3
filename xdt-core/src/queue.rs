//! The message queue between the dispatcher and one protocol instance.
//!
//! Every message carries a type code; SDU, PDU and timer codes are disjoint
//! ranges. A blocking read delivers messages of any type in arrival order; a
//! read for one exact type is non-blocking and keeps FIFO order within that
//! type, like the System-V queues this replaces. Writers are the dispatcher
//! and timer expiries, the single reader is the instance's state machine.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use log::debug;

use crate::pdu::Pdu;
use crate::sdu::Sdu;
use crate::timer::TimerKind;

/// One entry in an instance's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sdu(Sdu),
    Pdu(Pdu),
    Timer(TimerKind),
    /// Interruption sentinel (type 0). State machines treat it as a no-op.
    Nudge,
}

impl Message {
    pub fn type_code(&self) -> u32 {
        match self {
            Message::Nudge => 0,
            Message::Sdu(sdu) => sdu.code() as u32,
            Message::Pdu(pdu) => pdu.code() as u32,
            Message::Timer(kind) => kind.type_code(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Message>,
    closed: bool,
}

/// Multi-producer single-consumer queue with per-type filtered reads.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<Inner>,
    readable: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Writes to a closed queue are discarded.
    pub fn write(&self, msg: Message) {
        self.write_if(msg, || true);
    }

    /// Appends a message if `cond` still holds under the queue lock. Timer
    /// expiries use this to lose the race against a concurrent reset.
    pub(crate) fn write_if(&self, msg: Message, cond: impl FnOnce() -> bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            debug!("message for a closed queue discarded");
            return;
        }
        if !cond() {
            return;
        }
        inner.items.push_back(msg);
        self.readable.notify_one();
    }

    /// Blocking read of the next message of any type, in arrival order.
    /// Returns `None` once the queue has been closed: the termination signal.
    pub fn read_any(&self) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(msg) = inner.items.pop_front() {
                return Some(msg);
            }
            inner = self.readable.wait(inner).unwrap();
        }
    }

    /// Non-blocking read of the first pending message with exactly this type
    /// code.
    pub fn try_read(&self, type_code: u32) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        let at = inner
            .items
            .iter()
            .position(|msg| msg.type_code() == type_code)?;
        inner.items.remove(at)
    }

    /// Removes every pending message with this type code.
    pub fn drain(&self, type_code: u32) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.items.len();
        inner.items.retain(|msg| msg.type_code() != type_code);
        before - inner.items.len()
    }

    /// Wakes a blocked reader with the no-op sentinel.
    pub fn interrupt(&self) {
        self.write(Message::Nudge);
    }

    /// Closes the queue; blocked and future reads return `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.items.clear();
        self.readable.notify_all();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::pdu::Abo;

    fn abort_pdu(conn: u32) -> Message {
        Message::Pdu(Pdu::Abo(Abo { conn }))
    }

    fn confirm(sequ: u32) -> Message {
        Message::Sdu(Sdu::DataConfirm { conn: 1, sequ })
    }

    #[test]
    fn any_read_preserves_arrival_order_across_types() {
        let queue = MessageQueue::new();
        queue.write(confirm(1));
        queue.write(abort_pdu(5));
        queue.write(confirm(2));
        assert_eq!(queue.read_any(), Some(confirm(1)));
        assert_eq!(queue.read_any(), Some(abort_pdu(5)));
        assert_eq!(queue.read_any(), Some(confirm(2)));
    }

    #[test]
    fn typed_read_is_fifo_within_type_and_nonblocking() {
        let queue = MessageQueue::new();
        queue.write(confirm(1));
        queue.write(abort_pdu(5));
        queue.write(confirm(2));

        let code = abort_pdu(5).type_code();
        assert_eq!(queue.try_read(code), Some(abort_pdu(5)));
        assert_eq!(queue.try_read(code), None);
        // the surrounding messages are untouched and still ordered
        assert_eq!(queue.read_any(), Some(confirm(1)));
        assert_eq!(queue.read_any(), Some(confirm(2)));
    }

    #[test]
    fn drain_removes_only_the_given_type() {
        let queue = MessageQueue::new();
        queue.write(confirm(1));
        queue.write(abort_pdu(5));
        queue.write(confirm(2));
        assert_eq!(queue.drain(confirm(0).type_code()), 2);
        assert_eq!(queue.read_any(), Some(abort_pdu(5)));
    }

    #[test]
    fn close_releases_a_blocked_reader() {
        let queue = Arc::new(MessageQueue::new());
        let reader = {
            let queue = queue.clone();
            thread::spawn(move || queue.read_any())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(reader.join().unwrap(), None);
        // closed for good: later writes are discarded
        queue.write(confirm(1));
        assert_eq!(queue.read_any(), None);
    }

    #[test]
    fn interrupt_surfaces_as_nudge() {
        let queue = MessageQueue::new();
        queue.interrupt();
        assert_eq!(queue.read_any(), Some(Message::Nudge));
    }
}
