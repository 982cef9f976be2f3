//! Protocol instances.
//!
//! One instance runs per connection, each on its own thread, fed exclusively
//! through its message queue. The sender and receiver machines live in the
//! submodules; this module holds what both share.

pub(crate) mod recv;
pub(crate) mod send;

use std::os::unix::net::UnixDatagram;

use log::{debug, warn};

use crate::sdu::Sdu;

/// Connected local-domain socket to one user.
///
/// For sender instances every outgoing SDU has its connection number
/// rewritten from the real to the mapped domain here, at the user boundary;
/// receiver instances use one number for both sides.
#[derive(Debug)]
pub(crate) struct UserLink {
    sock: UnixDatagram,
    mapped_conn: Option<u32>,
}

impl UserLink {
    pub(crate) fn new(sock: UnixDatagram, mapped_conn: Option<u32>) -> Self {
        Self { sock, mapped_conn }
    }

    /// Delivers one SDU to the user. Delivery failures are logged and
    /// swallowed: a vanished user must not take the state machine down.
    pub(crate) fn deliver(&self, mut sdu: Sdu) {
        if let Some(mapped) = self.mapped_conn {
            sdu.set_conn(mapped);
        }
        debug!("to deliver: {sdu:?}");
        match sdu.encode() {
            Ok(stream) => {
                if let Err(e) = self.sock.send(&stream) {
                    warn!("SDU delivery failed: {e}");
                }
            }
            Err(e) => warn!("SDU not encodable: {e}"),
        }
    }
}
