//! Shared scaffolding for the end-to-end scenarios: two services on
//! loopback UDP, users attached through a per-test socket directory, and
//! millisecond protocol timers so recovery rounds stay fast.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tempfile::TempDir;

use xdt_core::address::XdtAddress;
use xdt_core::daemon::{Config, Daemon, TimerConfig};
use xdt_core::fault::ErrorCase;
use xdt_core::pdu::Endpoints;
use xdt_core::sdu::{DataRequest, Sdu};
use xdt_core::user::User;

/// How long a scenario waits for an expected SDU before failing.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Scaled-down protocol timers: retransmission fires well before the abort
/// bounds, like the full-size constants.
pub fn fast_timers() -> TimerConfig {
    TimerConfig {
        ack_wait: Duration::from_millis(300),
        retransmit: Duration::from_millis(300),
        abort: Duration::from_millis(900),
        idle: Duration::from_millis(900),
    }
}

/// One running service; stopped and joined on drop.
pub struct Service {
    signal: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Service {
    pub fn start(dir: &Utf8PathBuf, listen: XdtAddress, error_case: ErrorCase) -> Self {
        let mut config = Config::new(listen);
        config.socket_dir = dir.clone();
        config.error_case = error_case;
        config.timers = fast_timers();
        let daemon = Daemon::bind(config).expect("unable to bind a test service");
        let signal = Arc::new(AtomicBool::new(false));
        let handle = {
            let signal = signal.clone();
            std::thread::spawn(move || daemon.run(signal).expect("service failed"))
        };
        Self {
            signal,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("service panicked");
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A sending-side and a receiving-side service sharing one socket
/// directory.
pub struct Net {
    pub dir: Utf8PathBuf,
    pub sending: Service,
    pub receiving: Service,
    pub producer_addr: XdtAddress,
    pub consumer_addr: XdtAddress,
    _tempdir: TempDir,
}

/// Starts the two services. `sender_case` shapes the wire seen by outgoing
/// DTs, `receiver_case` the one seen by outgoing ACKs and ABOs.
pub fn create_services(
    sender_port: u16,
    receiver_port: u16,
    sender_case: ErrorCase,
    receiver_case: ErrorCase,
) -> Net {
    let tempdir = tempfile::tempdir().expect("no tempdir");
    let dir = Utf8PathBuf::from(tempdir.path().to_str().expect("tempdir path not UTF-8"));

    let sender_sap: XdtAddress = format!("127.0.0.1:{sender_port}").parse().unwrap();
    let receiver_sap: XdtAddress = format!("127.0.0.1:{receiver_port}").parse().unwrap();
    let sending = Service::start(&dir, sender_sap, sender_case);
    let receiving = Service::start(&dir, receiver_sap, receiver_case);

    Net {
        producer_addr: XdtAddress { slot: 1, ..sender_sap },
        consumer_addr: XdtAddress { slot: 1, ..receiver_sap },
        dir,
        sending,
        receiving,
        _tempdir: tempdir,
    }
}

impl Net {
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            source: self.producer_addr,
            dest: self.consumer_addr,
        }
    }

    /// A producer attached to the sending service. The consumer must be
    /// bound first: the receiving service connects to its access point.
    pub fn producer(&self) -> User {
        User::connect(self.producer_addr, &self.dir).expect("producer cannot attach")
    }

    pub fn consumer(&self) -> User {
        User::bind(self.consumer_addr, &self.dir).expect("consumer cannot bind")
    }
}

pub fn opening_request(endpoints: Endpoints, eom: bool, data: &[u8]) -> Sdu {
    Sdu::DataRequest(DataRequest {
        conn: 0,
        sequ: 1,
        endpoints: Some(endpoints),
        eom,
        data: data.to_vec(),
    })
}

pub fn data_request(conn: u32, sequ: u32, eom: bool, data: &[u8]) -> Sdu {
    Sdu::DataRequest(DataRequest {
        conn,
        sequ,
        endpoints: None,
        eom,
        data: data.to_vec(),
    })
}

/// Receives SDUs until one matches, failing after the patience window.
/// Non-matching SDUs are discarded.
pub fn await_sdu(user: &User, what: &str, pred: impl Fn(&Sdu) -> bool) -> Sdu {
    let deadline = Instant::now() + PATIENCE;
    loop {
        let left = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for {what}"));
        match user.recv_timeout(left).expect("receive failed") {
            Some(sdu) if pred(&sdu) => return sdu,
            Some(_) => continue,
            None => panic!("timed out waiting for {what}"),
        }
    }
}

/// Asserts that nothing arrives at this user within `quiet`.
pub fn assert_silent(user: &User, quiet: Duration) {
    if let Some(sdu) = user.recv_timeout(quiet).expect("receive failed") {
        panic!("expected silence, got {sdu:?}");
    }
}
