//! The user side of the service boundary.
//!
//! A user owns two local-domain datagram sockets, like the reference user
//! layer: one bound to its user access point for indications coming back
//! from the service, and (for producers) one connected to the service
//! access point for requests going in.

use std::io::{Error as IoError, ErrorKind};
use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::address::XdtAddress;
use crate::pdu::PduError;
use crate::sdu::Sdu;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("unable to bind the user access point at {path} (another user running, or a stale socket from an unclean exit; remove the path): {source}")]
    Bind {
        path: Utf8PathBuf,
        source: IoError,
    },

    #[error("unable to reach the service access point at {path} (is the service running?): {source}")]
    Connect {
        path: Utf8PathBuf,
        source: IoError,
    },

    #[error("this user is receive-only and cannot send requests")]
    ReceiveOnly,

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Codec(#[from] PduError),
}

/// One user attached to its access point.
pub struct User {
    address: XdtAddress,
    recv_sock: UnixDatagram,
    send_sock: Option<UnixDatagram>,
    uap_path: Utf8PathBuf,
}

impl User {
    /// Binds a receive-only user (a consumer) at its access point.
    pub fn bind(address: XdtAddress, dir: impl AsRef<Utf8Path>) -> Result<Self, UserError> {
        let uap_path = address.uap_name(dir.as_ref());
        let recv_sock = UnixDatagram::bind(&uap_path).map_err(|source| UserError::Bind {
            path: uap_path.clone(),
            source,
        })?;
        Ok(Self {
            address,
            recv_sock,
            send_sock: None,
            uap_path,
        })
    }

    /// Binds a producer: the access point plus a connection to the service.
    pub fn connect(address: XdtAddress, dir: impl AsRef<Utf8Path>) -> Result<Self, UserError> {
        let mut user = Self::bind(address, dir.as_ref())?;
        let sap_path = address.sap_name(dir.as_ref());
        let send_sock = UnixDatagram::unbound()?;
        send_sock
            .connect(&sap_path)
            .map_err(|source| UserError::Connect {
                path: sap_path,
                source,
            })?;
        user.send_sock = Some(send_sock);
        Ok(user)
    }

    pub fn address(&self) -> XdtAddress {
        self.address
    }

    /// Hands one SDU to the service.
    pub fn send(&self, sdu: &Sdu) -> Result<(), UserError> {
        let sock = self.send_sock.as_ref().ok_or(UserError::ReceiveOnly)?;
        sock.send(&sdu.encode()?)?;
        Ok(())
    }

    /// Blocks for the next SDU from the service.
    pub fn recv(&self) -> Result<Sdu, UserError> {
        self.recv_sock.set_read_timeout(None)?;
        let mut buf = [0u8; 2048];
        let len = self.recv_sock.recv(&mut buf)?;
        Ok(Sdu::decode(&buf[..len])?)
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Sdu>, UserError> {
        self.recv_sock.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 2048];
        match self.recv_sock.recv(&mut buf) {
            Ok(len) => Ok(Some(Sdu::decode(&buf[..len])?)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for User {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.uap_path);
    }
}
