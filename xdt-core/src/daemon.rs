//! The dispatcher.
//!
//! One dispatcher per service process. It owns the two listening sockets
//! (UDP towards peer services, a local-domain datagram socket towards
//! users), classifies everything that arrives, spawns sender and receiver
//! instances
//! for opening messages and routes the rest into the right instance queue.
//!
//! Connection numbers live in two domains. Receivers assign the real number
//! and use it on both sides. Senders present a locally mapped number to
//! their user until (and after) the real one is learnt from the initial ACK;
//! the dispatcher rewrites request SDUs mapped→real on the way in, and each
//! sender instance rewrites real→mapped on every SDU it delivers.

use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8PathBuf;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use thiserror::Error;

use crate::address::XdtAddress;
use crate::fault::{ErrorCase, FaultInjector};
use crate::pdu::{Dt, Endpoints, Pdu};
use crate::queue::{Message, MessageQueue};
use crate::sdu::{DataRequest, Sdu};
use crate::transaction::{recv, send, UserLink};
use crate::transport::{PduSocket, TransportError};

/// Number of simultaneously served connections.
pub const MAX_CONNECTIONS: usize = 5;

/// How often blocked loops look at the quit flag.
const POLL: Duration = Duration::from_millis(200);

/// Protocol timer durations. The defaults are the protocol constants; tests
/// shrink them to keep recovery scenarios fast.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// Sender: bound on the wait for the initial ACK.
    pub ack_wait: Duration,
    /// Sender: inter-ACK gap after which the window is retransmitted.
    pub retransmit: Duration,
    /// Sender: overall progress bound; expiry aborts.
    pub abort: Duration,
    /// Receiver: idle bound; expiry aborts.
    pub idle: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(5),
            retransmit: Duration::from_secs(5),
            abort: Duration::from_secs(10),
            idle: Duration::from_secs(10),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address; the slot part is ignored.
    pub listen: XdtAddress,
    /// Simulated loss applied to every outgoing PDU of this process.
    pub error_case: ErrorCase,
    /// Directory holding the access-point sockets.
    pub socket_dir: Utf8PathBuf,
    pub timers: TimerConfig,
}

impl Config {
    pub fn new(listen: XdtAddress) -> Self {
        Self {
            listen,
            error_case: ErrorCase::None,
            socket_dir: Utf8PathBuf::from("/tmp"),
            timers: TimerConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("unable to bind the UDP listener on {addr} (another service may be using this access point): {source}")]
    BindPeer { addr: SocketAddr, source: IoError },

    #[error("unable to bind the local listener at {path} (another service running, or a stale socket from an unclean exit; remove the path): {source}")]
    BindUser {
        path: Utf8PathBuf,
        source: IoError,
    },

    #[error(transparent)]
    Io(#[from] IoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sender,
    Receiver,
}

/// Everything the dispatcher keeps per running instance.
#[derive(Debug)]
struct Instance {
    role: Role,
    /// Connection number assigned by the receiving side; 0 for a sender
    /// until the initial ACK arrives.
    real_conn: u32,
    /// Sender-local alias presented to the user; equals `real_conn` for
    /// receivers.
    mapped_conn: u32,
    /// Producer and consumer addresses; senders only.
    endpoints: Option<Endpoints>,
    /// Sending socket address of the receiving peer, learnt from the
    /// initial ACK; senders only.
    peer_endpoint: Option<SocketAddr>,
    queue: Arc<MessageQueue>,
    handle: JoinHandle<()>,
}

/// What the listener threads hand to the dispatcher loop.
enum Arrival {
    Peer(Pdu, SocketAddr),
    User(Sdu),
    Finished(usize),
}

pub struct Daemon {
    config: Config,
    peer_listener: Arc<PduSocket>,
    user_listener: Arc<UnixDatagram>,
    sap_path: Utf8PathBuf,
    fault: Arc<FaultInjector>,
    slots: Vec<Option<Instance>>,
    last_conn: u32,
}

impl Daemon {
    /// Binds both listening sockets. Fails fast on conflicts so the caller
    /// can report a usage error before any instance exists.
    pub fn bind(config: Config) -> Result<Self, DaemonError> {
        let fault = Arc::new(FaultInjector::new(config.error_case));

        let addr = config.listen.service_endpoint();
        let peer_listener = PduSocket::bind(addr, fault.clone())
            .map_err(|source| DaemonError::BindPeer { addr, source })?;
        peer_listener.set_read_timeout(Some(POLL))?;

        let sap_path = config.listen.sap_name(&config.socket_dir);
        let user_listener =
            UnixDatagram::bind(&sap_path).map_err(|source| DaemonError::BindUser {
                path: sap_path.clone(),
                source,
            })?;
        user_listener.set_read_timeout(Some(POLL))?;

        Ok(Self {
            config,
            peer_listener: Arc::new(peer_listener),
            user_listener: Arc::new(user_listener),
            sap_path,
            fault,
            slots: (0..MAX_CONNECTIONS).map(|_| None).collect(),
            // connection numbers start at a random point per process run
            last_conn: rand::random(),
        })
    }

    /// Dispatches until the quit flag is raised, then winds everything down:
    /// instance queues are closed (the polite termination request), threads
    /// joined, the local socket path unlinked.
    pub fn run(mut self, signal: Arc<AtomicBool>) -> Result<(), DaemonError> {
        info!(
            "dispatching for {}:{} started",
            self.config.listen.host, self.config.listen.port
        );

        let (tx, rx) = unbounded();
        let peer_thread = {
            let socket = self.peer_listener.clone();
            let tx = tx.clone();
            let signal = signal.clone();
            thread::spawn(move || peer_listener_loop(socket, tx, signal))
        };
        let user_thread = {
            let socket = self.user_listener.clone();
            let tx = tx.clone();
            let signal = signal.clone();
            thread::spawn(move || user_listener_loop(socket, tx, signal))
        };

        while !signal.load(Ordering::SeqCst) {
            match rx.recv_timeout(POLL) {
                Ok(arrival) => self.handle(arrival, &tx),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("dispatching finished, informing running instances");
        for instance in self.slots.iter().flatten() {
            instance.queue.close();
        }
        for slot in &mut self.slots {
            if let Some(instance) = slot.take() {
                let _ = instance.handle.join();
            }
        }
        let _ = peer_thread.join();
        let _ = user_thread.join();
        let _ = std::fs::remove_file(&self.sap_path);
        Ok(())
    }

    fn handle(&mut self, arrival: Arrival, tx: &Sender<Arrival>) {
        match arrival {
            Arrival::Finished(slot) => self.reap(slot),
            Arrival::Peer(pdu, src) => self.handle_pdu(pdu, src, tx),
            Arrival::User(sdu) => self.handle_sdu(sdu, tx),
        }
    }

    fn reap(&mut self, slot: usize) {
        if let Some(instance) = self.slots[slot].take() {
            let _ = instance.handle.join();
            debug!(
                "reaped {:?} instance, mapped connection {}",
                instance.role, instance.mapped_conn
            );
        }
    }

    fn handle_pdu(&mut self, pdu: Pdu, src: SocketAddr, tx: &Sender<Arrival>) {
        match pdu {
            Pdu::Dt(dt) if dt.sequ == 1 => self.spawn_receiver(dt, tx),
            Pdu::Dt(dt) => {
                let conn = dt.conn().unwrap_or_default();
                match self.find(|i| i.role == Role::Receiver && i.real_conn == conn) {
                    Some(instance) => instance.queue.write(Message::Pdu(Pdu::Dt(dt))),
                    None => warn!("no receiver instance for DT with connection {conn}"),
                }
            }
            Pdu::Ack(ack) if ack.sequ == 1 => {
                // the sender is identified by its address pair: its producer
                // is the ACK's destination, its consumer the ACK's source
                let Some(endpoints) = ack.endpoints else {
                    warn!("initial ACK without endpoint addresses dropped");
                    return;
                };
                let wanted = endpoints.swapped();
                match self
                    .find_mut(|i| i.role == Role::Sender && i.endpoints == Some(wanted))
                {
                    Some(instance) => {
                        instance.real_conn = ack.conn;
                        instance.peer_endpoint = Some(src);
                        instance.queue.write(Message::Pdu(Pdu::Ack(ack)));
                    }
                    None => warn!("no sender instance for the initial ACK"),
                }
            }
            Pdu::Ack(ack) => {
                match self.find(|i| {
                    i.role == Role::Sender
                        && i.real_conn == ack.conn
                        && i.peer_endpoint == Some(src)
                }) {
                    Some(instance) => instance.queue.write(Message::Pdu(Pdu::Ack(ack))),
                    None => warn!("no sender instance for ACK with connection {}", ack.conn),
                }
            }
            Pdu::Abo(abo) => {
                match self.find(|i| {
                    i.role == Role::Sender
                        && i.real_conn == abo.conn
                        && i.peer_endpoint == Some(src)
                }) {
                    Some(instance) => instance.queue.write(Message::Pdu(Pdu::Abo(abo))),
                    None => warn!("no sender instance for ABO with connection {}", abo.conn),
                }
            }
        }
    }

    fn handle_sdu(&mut self, sdu: Sdu, tx: &Sender<Arrival>) {
        match sdu {
            Sdu::DataRequest(requ) if requ.sequ == 1 => self.spawn_sender(requ, tx),
            Sdu::DataRequest(mut requ) => {
                match self.find(|i| i.role == Role::Sender && i.mapped_conn == requ.conn) {
                    Some(instance) => {
                        // enter the real connection-number domain
                        requ.conn = instance.real_conn;
                        instance
                            .queue
                            .write(Message::Sdu(Sdu::DataRequest(requ)));
                    }
                    None => warn!(
                        "no sender instance for data request with connection {}",
                        requ.conn
                    ),
                }
            }
            other => warn!("unexpected SDU {:?} from the user layer", other.code()),
        }
    }

    fn spawn_receiver(&mut self, dt: Dt, tx: &Sender<Arrival>) {
        let Some(&endpoints) = dt.endpoints() else {
            warn!("opening DT without endpoint addresses dropped");
            return;
        };
        let Some(slot) = self.free_slot() else {
            warn!("connection limit reached, new transfer refused");
            return;
        };

        // the ACK path goes to the listening endpoint of the sending
        // service, not to the datagram's source port
        let peer = match PduSocket::connected(
            endpoints.source.service_endpoint(),
            self.fault.clone(),
        ) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("receiver setup failed, no peer socket: {e}");
                return;
            }
        };
        let user_sock = match connect_user(&endpoints.dest, &self.config.socket_dir) {
            Ok(sock) => sock,
            Err(e) => {
                warn!("receiver setup failed, consumer unreachable: {e}");
                return;
            }
        };

        let conn = self.next_conn();
        let queue = Arc::new(MessageQueue::new());
        queue.write(Message::Pdu(Pdu::Dt(dt)));

        let ctx = recv::Receiver {
            queue: queue.clone(),
            peer,
            user: UserLink::new(user_sock, None),
            timers: self.config.timers,
            conn,
        };
        let tx = tx.clone();
        let handle = thread::spawn(move || {
            recv::run(ctx);
            let _ = tx.send(Arrival::Finished(slot));
        });

        info!("receiver instance started, connection {conn}");
        self.slots[slot] = Some(Instance {
            role: Role::Receiver,
            real_conn: conn,
            mapped_conn: conn,
            endpoints: None,
            peer_endpoint: None,
            queue,
            handle,
        });
    }

    fn spawn_sender(&mut self, requ: DataRequest, tx: &Sender<Arrival>) {
        let Some(endpoints) = requ.endpoints else {
            warn!("opening data request without endpoint addresses dropped");
            return;
        };
        let Some(slot) = self.free_slot() else {
            warn!("connection limit reached, new transfer refused");
            return;
        };

        let peer = match PduSocket::connected(
            endpoints.dest.service_endpoint(),
            self.fault.clone(),
        ) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("sender setup failed, no peer socket: {e}");
                return;
            }
        };
        let user_sock = match connect_user(&endpoints.source, &self.config.socket_dir) {
            Ok(sock) => sock,
            Err(e) => {
                warn!("sender setup failed, producer unreachable: {e}");
                return;
            }
        };

        let mapped = self.next_conn();
        let queue = Arc::new(MessageQueue::new());
        queue.write(Message::Sdu(Sdu::DataRequest(requ)));

        let ctx = send::Sender {
            queue: queue.clone(),
            peer,
            user: UserLink::new(user_sock, Some(mapped)),
            timers: self.config.timers,
        };
        let tx = tx.clone();
        let handle = thread::spawn(move || {
            send::run(ctx);
            let _ = tx.send(Arrival::Finished(slot));
        });

        info!("sender instance started, mapped connection {mapped}");
        self.slots[slot] = Some(Instance {
            role: Role::Sender,
            real_conn: 0,
            mapped_conn: mapped,
            endpoints: Some(endpoints),
            peer_endpoint: None,
            queue,
            handle,
        });
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn next_conn(&mut self) -> u32 {
        self.last_conn = self.last_conn.wrapping_add(1);
        self.last_conn
    }

    fn find(&self, pred: impl Fn(&Instance) -> bool) -> Option<&Instance> {
        self.slots.iter().flatten().find(|i| pred(i))
    }

    fn find_mut(&mut self, pred: impl Fn(&Instance) -> bool) -> Option<&mut Instance> {
        self.slots.iter_mut().flatten().find(|i| pred(i))
    }
}

/// An unbound local socket connected to one user's access point.
fn connect_user(user: &XdtAddress, dir: &Utf8PathBuf) -> Result<UnixDatagram, IoError> {
    let sock = UnixDatagram::unbound()?;
    sock.connect(user.uap_name(dir))?;
    Ok(sock)
}

fn peer_listener_loop(
    socket: Arc<PduSocket>,
    tx: Sender<Arrival>,
    signal: Arc<AtomicBool>,
) {
    while !signal.load(Ordering::SeqCst) {
        match socket.recv_from() {
            Ok((pdu, src)) => {
                if tx.send(Arrival::Peer(pdu, src)).is_err() {
                    return;
                }
            }
            Err(TransportError::Pdu(e)) => warn!("malformed datagram dropped: {e}"),
            Err(TransportError::Io(e)) if retryable(&e) => continue,
            Err(TransportError::Io(e)) => {
                warn!("peer listener failed: {e}");
                signal.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

fn user_listener_loop(
    socket: Arc<UnixDatagram>,
    tx: Sender<Arrival>,
    signal: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 2048];
    while !signal.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(len) => match Sdu::decode(&buf[..len]) {
                Ok(sdu) => {
                    if tx.send(Arrival::User(sdu)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("malformed SDU dropped: {e}"),
            },
            Err(e) if retryable(&e) => continue,
            Err(e) => {
                warn!("user listener failed: {e}");
                signal.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

fn retryable(e: &IoError) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
