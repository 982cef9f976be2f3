//! The receiver state machine.
//!
//! Accepts the opening DT, delivers payloads in sequence order, acknowledges
//! each accepted DT, and silently drops out-of-order arrivals so the sender's
//! retransmission timer drives Go-Back-N. A 10-second idle bound aborts a
//! connection that stops making progress.

use std::sync::Arc;

use log::{debug, warn};

use crate::daemon::TimerConfig;
use crate::pdu::{Abo, Ack, Dt, Pdu};
use crate::queue::{Message, MessageQueue};
use crate::sdu::{DataIndication, Sdu};
use crate::timer::{Timer, TimerKind};
use crate::transaction::UserLink;
use crate::transport::PduSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connected,
    AwaitCorrectDt,
    Done,
}

pub(crate) struct Receiver {
    pub queue: Arc<MessageQueue>,
    pub peer: PduSocket,
    pub user: UserLink,
    pub timers: TimerConfig,
    /// Connection number assigned by the dispatcher, announced to the peer
    /// in every acknowledgement.
    pub conn: u32,
}

/// Runs the receiver to completion. Returns when a terminal state is reached
/// or the dispatcher closes the queue.
pub(crate) fn run(ctx: Receiver) {
    Machine::new(ctx).run();
}

struct Machine {
    queue: Arc<MessageQueue>,
    peer: PduSocket,
    user: UserLink,
    timers: TimerConfig,
    idle: Timer,
    conn: u32,
    /// Highest sequence delivered in order.
    expected: u32,
}

impl Machine {
    fn new(ctx: Receiver) -> Self {
        let Receiver {
            queue,
            peer,
            user,
            timers,
            conn,
        } = ctx;
        Self {
            idle: Timer::new(TimerKind::Idle, queue.clone()),
            queue,
            peer,
            user,
            timers,
            conn,
            expected: 0,
        }
    }

    fn run(mut self) {
        let mut state = State::Idle;
        while state != State::Done {
            let Some(msg) = self.queue.read_any() else {
                debug!("receiver queue closed; terminating");
                return;
            };
            state = match state {
                State::Idle => self.on_idle(msg),
                State::Connected => self.on_transfer(msg, State::Connected),
                State::AwaitCorrectDt => self.on_transfer(msg, State::AwaitCorrectDt),
                State::Done => State::Done,
            };
        }
    }

    fn on_idle(&mut self, msg: Message) -> State {
        match msg {
            Message::Pdu(Pdu::Dt(dt)) if dt.sequ == 1 => {
                self.expected = 1;
                let eom = dt.eom;
                let ack = self.ack_for(&dt);
                self.user.deliver(Sdu::DataIndication(DataIndication {
                    conn: self.conn,
                    sequ: dt.sequ,
                    eom,
                    data: dt.data,
                }));
                self.send_pdu(&Pdu::Ack(ack));
                if eom {
                    return self.disconnect();
                }
                self.idle.set(self.timers.idle);
                State::Connected
            }
            other => {
                debug!("receiver ignores {other:?} while idle");
                State::Idle
            }
        }
    }

    /// CONNECTED and AWAIT_CORRECT_DT share everything but the reaction to a
    /// gap, which only matters for the state reported back.
    fn on_transfer(&mut self, msg: Message, current: State) -> State {
        match msg {
            Message::Pdu(Pdu::Dt(dt)) => {
                self.idle.set(self.timers.idle);
                if let Some(conn) = dt.conn() {
                    self.conn = conn;
                }
                if dt.eom {
                    // final frame: acknowledge, deliver, close the stream
                    let ack = self.ack_for(&dt);
                    self.send_pdu(&Pdu::Ack(ack));
                    self.user.deliver(Sdu::DataIndication(DataIndication {
                        conn: self.conn,
                        sequ: dt.sequ,
                        eom: true,
                        data: dt.data,
                    }));
                    return self.disconnect();
                }
                if dt.sequ == self.expected + 1 {
                    self.expected = dt.sequ;
                    let ack = self.ack_for(&dt);
                    self.user.deliver(Sdu::DataIndication(DataIndication {
                        conn: self.conn,
                        sequ: dt.sequ,
                        eom: false,
                        data: dt.data,
                    }));
                    self.send_pdu(&Pdu::Ack(ack));
                    return State::Connected;
                }
                // a gap: drop without acknowledgement, the missing DT will
                // come back with the sender's Go-Back-N round
                debug!(
                    "DT {} out of order (expected {}), dropped",
                    dt.sequ,
                    self.expected + 1
                );
                State::AwaitCorrectDt
            }
            Message::Timer(TimerKind::Idle) => {
                self.send_pdu(&Pdu::Abo(Abo { conn: self.conn }));
                self.user.deliver(Sdu::AbortIndication { conn: self.conn });
                State::Done
            }
            Message::Nudge => current,
            other => {
                warn!("receiver ignores {other:?} during transfer");
                current
            }
        }
    }

    /// The acknowledgement answering a DT: same sequence, endpoint addresses
    /// swapped when the DT carried them, and this connection's number.
    fn ack_for(&self, dt: &Dt) -> Ack {
        Ack {
            sequ: dt.sequ,
            endpoints: dt.endpoints().map(|endpoints| endpoints.swapped()),
            conn: self.conn,
        }
    }

    fn disconnect(&mut self) -> State {
        self.user
            .deliver(Sdu::DisconnectIndication { conn: self.conn });
        State::Done
    }

    fn send_pdu(&self, pdu: &Pdu) {
        if let Err(e) = self.peer.send(pdu) {
            warn!("PDU transmission failed: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use super::*;
    use crate::fault::{ErrorCase, FaultInjector};
    use crate::pdu::{DtLink, Endpoints};

    struct Harness {
        queue: Arc<MessageQueue>,
        peer: PduSocket,
        user: UnixDatagram,
        machine: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn start(timers: TimerConfig) -> Self {
            let fault = Arc::new(FaultInjector::new(ErrorCase::None));
            let peer = PduSocket::bind("127.0.0.1:0".parse().unwrap(), fault.clone()).unwrap();
            peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let instance_sock =
                PduSocket::connected(peer.local_addr().unwrap(), fault).unwrap();

            let (user, user_far) = UnixDatagram::pair().unwrap();
            user.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

            let queue = Arc::new(MessageQueue::new());
            let ctx = Receiver {
                queue: queue.clone(),
                peer: instance_sock,
                user: UserLink::new(user_far, None),
                timers,
                conn: 42,
            };
            let machine = std::thread::spawn(move || run(ctx));
            Self {
                queue,
                peer,
                user,
                machine: Some(machine),
            }
        }

        fn dt(&self, sequ: u32, eom: bool) {
            let link = if sequ == 1 {
                DtLink::Endpoints(endpoints())
            } else {
                DtLink::Conn(42)
            };
            self.queue.write(Message::Pdu(Pdu::Dt(Dt {
                sequ,
                link,
                eom,
                data: vec![sequ as u8],
            })));
        }

        fn wire_pdu(&self) -> Pdu {
            self.peer.recv_from().expect("expected a PDU on the wire").0
        }

        fn no_wire_pdu(&self) {
            self.peer
                .set_read_timeout(Some(Duration::from_millis(80)))
                .unwrap();
            assert!(self.peer.recv_from().is_err(), "unexpected PDU on the wire");
            self.peer
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
        }

        fn user_sdu(&self) -> Sdu {
            let mut buf = [0u8; 1024];
            let len = self.user.recv(&mut buf).expect("expected an SDU");
            Sdu::decode(&buf[..len]).unwrap()
        }

        fn finish(mut self) {
            self.queue.close();
            self.machine.take().unwrap().join().unwrap();
        }
    }

    fn endpoints() -> Endpoints {
        Endpoints {
            source: "127.0.0.1:50001.1".parse().unwrap(),
            dest: "127.0.0.1:50002.2".parse().unwrap(),
        }
    }

    fn relaxed() -> TimerConfig {
        TimerConfig {
            ack_wait: Duration::from_secs(5),
            retransmit: Duration::from_secs(5),
            abort: Duration::from_secs(10),
            idle: Duration::from_secs(10),
        }
    }

    #[test]
    fn single_dt_stream_delivers_acks_and_disconnects() {
        let h = Harness::start(relaxed());
        h.dt(1, true);

        let Sdu::DataIndication(ind) = h.user_sdu() else {
            panic!("expected the delivery")
        };
        assert_eq!((ind.conn, ind.sequ, ind.eom), (42, 1, true));

        let Pdu::Ack(ack) = h.wire_pdu() else {
            panic!("expected the opening ACK")
        };
        assert_eq!((ack.sequ, ack.conn), (1, 42));
        // the answering ACK swaps the endpoint addresses
        assert_eq!(ack.endpoints, Some(endpoints().swapped()));

        assert_eq!(h.user_sdu(), Sdu::DisconnectIndication { conn: 42 });
        h.finish();
    }

    #[test]
    fn in_order_dts_are_delivered_and_acked_one_by_one() {
        let h = Harness::start(relaxed());
        h.dt(1, false);
        let _ = h.user_sdu();
        let _ = h.wire_pdu();

        for sequ in 2..=4 {
            h.dt(sequ, false);
            let Sdu::DataIndication(ind) = h.user_sdu() else {
                panic!("expected delivery of {sequ}")
            };
            assert_eq!(ind.sequ, sequ);
            let Pdu::Ack(ack) = h.wire_pdu() else {
                panic!("expected ACK {sequ}")
            };
            assert_eq!(ack.sequ, sequ);
            assert_eq!(ack.endpoints, None);
        }
        h.finish();
    }

    #[test]
    fn a_gap_is_dropped_silently_until_the_missing_dt_arrives() {
        let h = Harness::start(relaxed());
        h.dt(1, false);
        let _ = h.user_sdu();
        let _ = h.wire_pdu();

        // 3 arrives before 2: no delivery, no ACK
        h.dt(3, false);
        h.no_wire_pdu();

        // Go-Back-N replays 2 and 3; both are now accepted in order
        h.dt(2, false);
        h.dt(3, false);
        for sequ in 2..=3 {
            let Sdu::DataIndication(ind) = h.user_sdu() else {
                panic!("expected delivery of {sequ}")
            };
            assert_eq!(ind.sequ, sequ);
            let Pdu::Ack(ack) = h.wire_pdu() else {
                panic!("expected ACK {sequ}")
            };
            assert_eq!(ack.sequ, sequ);
        }
        h.finish();
    }

    #[test]
    fn idle_timeout_aborts_towards_both_sides() {
        let mut timers = relaxed();
        timers.idle = Duration::from_millis(60);
        let h = Harness::start(timers);
        h.dt(1, false);
        let _ = h.user_sdu();
        let _ = h.wire_pdu();

        let Pdu::Abo(abo) = h.wire_pdu() else {
            panic!("expected the abort PDU")
        };
        assert_eq!(abo.conn, 42);
        assert_eq!(h.user_sdu(), Sdu::AbortIndication { conn: 42 });
        h.finish();
    }
}
