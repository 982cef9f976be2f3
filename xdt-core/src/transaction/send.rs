//! The sender state machine.
//!
//! Connect, acknowledged data transfer with a fixed send window, Go-Back-N
//! recovery, flow-control break, disconnect on the final acknowledgement,
//! abort on timeout or peer request.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};

use crate::daemon::TimerConfig;
use crate::pdu::{Dt, DtLink, Pdu};
use crate::queue::{Message, MessageQueue};
use crate::sdu::{DataRequest, Sdu};
use crate::timer::{Timer, TimerKind};
use crate::transaction::UserLink;
use crate::transport::PduSocket;

/// Size of the send window: buffered, unacknowledged DTs.
pub(crate) const WINDOW: usize = 5;

/// The retransmission buffer: unacknowledged DTs in send order. Its contents
/// are always a contiguous run of the stream; acknowledgements remove the
/// matching entry and close the gap.
#[derive(Debug, Default)]
struct SendWindow {
    slots: VecDeque<Dt>,
}

impl SendWindow {
    fn new() -> Self {
        Self {
            slots: VecDeque::with_capacity(WINDOW),
        }
    }

    fn push(&mut self, dt: Dt) {
        debug_assert!(self.slots.len() < WINDOW);
        self.slots.push_back(dt);
    }

    /// Removes the first entry with this sequence number. Returns whether
    /// one was found.
    fn remove(&mut self, sequ: u32) -> bool {
        match self.slots.iter().position(|dt| dt.sequ == sequ) {
            Some(at) => {
                self.slots.remove(at);
                true
            }
            None => false,
        }
    }

    fn is_full(&self) -> bool {
        self.slots.len() == WINDOW
    }

    fn iter(&self) -> impl Iterator<Item = &Dt> {
        self.slots.iter()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitAck,
    Connected,
    Break,
    Done,
}

pub(crate) struct Sender {
    pub queue: Arc<MessageQueue>,
    pub peer: PduSocket,
    pub user: UserLink,
    pub timers: TimerConfig,
}

/// Runs the sender to completion. Returns when a terminal state is reached
/// or the dispatcher closes the queue.
pub(crate) fn run(ctx: Sender) {
    Machine::new(ctx).run();
}

struct Machine {
    queue: Arc<MessageQueue>,
    peer: PduSocket,
    user: UserLink,
    timers: TimerConfig,
    ack_wait: Timer,
    retransmit: Timer,
    abort: Timer,
    window: SendWindow,
    /// Real connection number, learnt from the initial ACK.
    conn: u32,
    /// Sequence of the end-of-message DT; its ACK closes the stream.
    last_sequ: Option<u32>,
    /// Confirmation withheld while the window is full.
    withheld: Option<u32>,
    /// Data requests deferred while connecting or in break.
    pending: VecDeque<DataRequest>,
}

impl Machine {
    fn new(ctx: Sender) -> Self {
        let Sender {
            queue,
            peer,
            user,
            timers,
        } = ctx;
        Self {
            ack_wait: Timer::new(TimerKind::AckWait, queue.clone()),
            retransmit: Timer::new(TimerKind::Retransmit, queue.clone()),
            abort: Timer::new(TimerKind::Abort, queue.clone()),
            queue,
            peer,
            user,
            timers,
            window: SendWindow::new(),
            conn: 0,
            last_sequ: None,
            withheld: None,
            pending: VecDeque::new(),
        }
    }

    fn run(mut self) {
        let mut state = State::Idle;
        loop {
            let Some(msg) = self.queue.read_any() else {
                debug!("sender queue closed; terminating");
                return;
            };
            state = match state {
                State::Idle => self.on_idle(msg),
                State::AwaitAck => self.on_await_ack(msg),
                State::Connected => self.on_connected(msg),
                State::Break => self.on_break(msg),
                State::Done => State::Done,
            };
            // requests deferred during connect or break are picked up as
            // soon as the window has room again
            while state == State::Connected {
                let Some(requ) = self.pending.pop_front() else {
                    break;
                };
                state = self.accept_request(requ);
            }
            if state == State::Done {
                return;
            }
        }
    }

    fn on_idle(&mut self, msg: Message) -> State {
        match msg {
            Message::Sdu(Sdu::DataRequest(requ)) => {
                let (Some(endpoints), 1) = (requ.endpoints, requ.sequ) else {
                    warn!("malformed opening data request; still idle");
                    return State::Idle;
                };
                if requ.eom {
                    self.last_sequ = Some(requ.sequ);
                }
                self.send_pdu(&Pdu::Dt(Dt {
                    sequ: requ.sequ,
                    link: DtLink::Endpoints(endpoints),
                    eom: requ.eom,
                    data: requ.data,
                }));
                self.ack_wait.set(self.timers.ack_wait);
                State::AwaitAck
            }
            Message::Nudge => State::Idle,
            other => {
                warn!("sender ignores {other:?} while idle");
                State::Idle
            }
        }
    }

    fn on_await_ack(&mut self, msg: Message) -> State {
        match msg {
            Message::Pdu(Pdu::Ack(ack)) if ack.sequ == 1 => {
                self.conn = ack.conn;
                self.ack_wait.reset();
                self.user.deliver(Sdu::DataConfirm {
                    conn: self.conn,
                    sequ: 1,
                });
                if self.last_sequ == Some(1) {
                    // single-DT stream: the opening DT was also the last
                    return self.disconnect();
                }
                self.retransmit.set(self.timers.retransmit);
                self.abort.set(self.timers.abort);
                State::Connected
            }
            Message::Timer(TimerKind::AckWait) => self.abort_connection(),
            Message::Pdu(Pdu::Abo(_)) => self.abort_connection(),
            Message::Sdu(Sdu::DataRequest(requ)) => {
                self.pending.push_back(requ);
                State::AwaitAck
            }
            Message::Nudge => State::AwaitAck,
            other => {
                warn!("sender ignores {other:?} while awaiting the initial ACK");
                State::AwaitAck
            }
        }
    }

    fn on_connected(&mut self, msg: Message) -> State {
        match msg {
            Message::Sdu(Sdu::DataRequest(requ)) => self.accept_request(requ),
            Message::Pdu(Pdu::Ack(ack)) => {
                self.retransmit.set(self.timers.retransmit);
                if !self.window.remove(ack.sequ) {
                    debug!("ACK {} matches no buffered DT", ack.sequ);
                }
                if self.last_sequ == Some(ack.sequ) {
                    return self.disconnect();
                }
                State::Connected
            }
            Message::Pdu(Pdu::Abo(_)) => self.abort_connection(),
            Message::Timer(TimerKind::Retransmit) => {
                self.go_back_n();
                State::Connected
            }
            Message::Timer(TimerKind::Abort) => self.abort_connection(),
            Message::Nudge => State::Connected,
            other => {
                warn!("sender ignores {other:?} while connected");
                State::Connected
            }
        }
    }

    fn on_break(&mut self, msg: Message) -> State {
        match msg {
            Message::Pdu(Pdu::Ack(ack)) => {
                self.retransmit.set(self.timers.retransmit);
                self.abort.set(self.timers.abort);
                if !self.window.remove(ack.sequ) {
                    debug!("ACK {} matches no buffered DT", ack.sequ);
                    return State::Break;
                }
                // the window has room again: release the confirmation that
                // was withheld when it filled
                if let Some(sequ) = self.withheld.take() {
                    self.user.deliver(Sdu::DataConfirm {
                        conn: self.conn,
                        sequ,
                    });
                }
                if self.last_sequ == Some(ack.sequ) {
                    return self.disconnect();
                }
                State::Connected
            }
            Message::Timer(TimerKind::Retransmit) => {
                self.go_back_n();
                State::Break
            }
            Message::Timer(TimerKind::Abort) => self.abort_connection(),
            Message::Pdu(Pdu::Abo(_)) => self.abort_connection(),
            Message::Sdu(Sdu::DataRequest(requ)) => {
                self.pending.push_back(requ);
                State::Break
            }
            Message::Nudge => State::Break,
            other => {
                warn!("sender ignores {other:?} during break");
                State::Break
            }
        }
    }

    /// Sends the DT for an accepted data request and decides between staying
    /// connected and entering break.
    fn accept_request(&mut self, requ: DataRequest) -> State {
        let sequ = requ.sequ;
        self.send_pdu(&Pdu::Dt(Dt {
            sequ,
            link: DtLink::Conn(self.conn),
            eom: requ.eom,
            data: requ.data.clone(),
        }));
        self.window.push(Dt {
            sequ,
            link: DtLink::Conn(self.conn),
            eom: requ.eom,
            data: requ.data,
        });
        self.abort.set(self.timers.abort);
        if requ.eom {
            self.last_sequ = Some(sequ);
        }
        if self.window.is_full() {
            self.retransmit.set(self.timers.retransmit);
            self.user.deliver(Sdu::BreakIndication { conn: self.conn });
            self.withheld = Some(sequ);
            State::Break
        } else {
            self.user.deliver(Sdu::DataConfirm {
                conn: self.conn,
                sequ,
            });
            State::Connected
        }
    }

    /// Resends every buffered DT in send order, then restarts the
    /// retransmission timer.
    fn go_back_n(&mut self) {
        for dt in self.window.iter() {
            if self.peer.send(&Pdu::Dt(dt.clone())).is_err() {
                warn!("retransmission of DT {} failed", dt.sequ);
            }
        }
        self.retransmit.set(self.timers.retransmit);
    }

    fn disconnect(&mut self) -> State {
        self.user
            .deliver(Sdu::DisconnectIndication { conn: self.conn });
        State::Done
    }

    fn abort_connection(&mut self) -> State {
        self.user.deliver(Sdu::AbortIndication { conn: self.conn });
        State::Done
    }

    fn send_pdu(&self, pdu: &Pdu) {
        if let Err(e) = self.peer.send(pdu) {
            warn!("PDU transmission failed: {e}");
        }
    }
}
