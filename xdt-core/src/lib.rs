//! A connection-oriented, reliable byte-stream transfer layer over UDP.
//!
//! The service accepts payload chunks from local producers over local-domain
//! datagram sockets, carries them to the peer service in acknowledged,
//! sequence-numbered DT PDUs with Go-Back-N recovery and a fixed send
//! window, and delivers them in order to the consumer on the far side.
//!
//! A process hosts one [`daemon::Daemon`], the dispatcher owning the two
//! listening sockets, and up to [`daemon::MAX_CONNECTIONS`] concurrent
//! sender/receiver instances, each an isolated state machine on its own
//! thread, fed through a typed [`queue::MessageQueue`]. Simulated packet
//! loss for protocol exercises is configured through [`fault::ErrorCase`].

pub mod address;
pub mod daemon;
pub mod fault;
pub mod pdu;
pub mod queue;
pub mod sdu;
pub mod timer;
mod transaction;
pub mod transport;
pub mod user;
