//! UDP endpoints speaking PDUs.
//!
//! The dispatcher owns one unconnected listening socket; every instance owns
//! one randomly bound socket connected to its peer service. All outgoing
//! PDUs pass through the process-wide fault injector before transmission.

use std::io::{Error as IoError, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::fault::FaultInjector;
use crate::pdu::{Pdu, PduError, STREAM_MAX};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Pdu(#[from] PduError),
}

/// A UDP socket carrying one PDU per datagram.
#[derive(Debug)]
pub struct PduSocket {
    socket: UdpSocket,
    fault: Arc<FaultInjector>,
}

impl PduSocket {
    /// Binds the listening socket of a service.
    pub fn bind(addr: SocketAddr, fault: Arc<FaultInjector>) -> Result<Self, IoError> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self { socket, fault })
    }

    /// Creates the randomly bound socket of one instance, connected to the
    /// listening endpoint of its peer service.
    pub fn connected(peer: SocketAddr, fault: Arc<FaultInjector>) -> Result<Self, IoError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(peer)?;
        Ok(Self { socket, fault })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IoError> {
        self.socket.local_addr()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), IoError> {
        self.socket.set_read_timeout(timeout)
    }

    /// Sends a PDU to the connected peer, unless the fault injector absorbs
    /// it. ICMP-reported refusals are ignored like any other lost datagram.
    pub fn send(&self, pdu: &Pdu) -> Result<(), TransportError> {
        if self.fault.absorbs(pdu) {
            debug!("fault injector absorbed {pdu:?}");
            return Ok(());
        }
        debug!("to send: {pdu:?}");
        match self.socket.send(&pdu.encode()?) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                debug!("peer endpoint refused a datagram; treating as lost");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receives and decodes one PDU on the listening socket. I/O errors
    /// (including read timeouts) and malformed datagrams surface separately
    /// so the caller can drop the latter without killing its loop.
    pub fn recv_from(&self) -> Result<(Pdu, SocketAddr), TransportError> {
        let mut buf = [0u8; STREAM_MAX];
        let (len, src) = self.socket.recv_from(&mut buf)?;
        let pdu = Pdu::decode(&buf[..len])?;
        debug!("received from {src}: {pdu:?}");
        Ok((pdu, src))
    }
}
