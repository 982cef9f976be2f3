use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Smallest port number usable by a service (start of the dynamic/private range).
pub const PORT_MIN: u16 = 49152;

/// Socket paths of both access points start with this prefix so stale ones are
/// easy to find and remove.
pub const SAP_NAME_PREFIX: &str = "xdt-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address {0:?} does not match host:port[.slot]")]
    Malformed(String),

    #[error("unable to resolve {0:?} to an IPv4 address")]
    Resolve(String),

    #[error("port {0} outside the usable range [{PORT_MIN}, {}]", u16::MAX)]
    PortRange(u32),

    #[error("slot {0:?} is not a valid slot number")]
    Slot(String),
}

/// Address of one user of the transfer service.
///
/// The `(host, port)` pair identifies a service instance; the `slot`
/// distinguishes users sharing that service. Two addresses are equal only if
/// all three members are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XdtAddress {
    /// IPv4 address the service listens on.
    pub host: Ipv4Addr,
    /// UDP port of the service, within `[PORT_MIN, 65535]`.
    pub port: u16,
    /// User slot, distinguishing users behind the same service.
    pub slot: u32,
}

impl XdtAddress {
    pub fn new(host: Ipv4Addr, port: u16, slot: u32) -> Self {
        Self { host, port, slot }
    }

    /// The UDP endpoint of the service serving this address.
    pub fn service_endpoint(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }

    /// Path of the local-domain socket the service listens on,
    /// e.g. `/tmp/xdt-141.43.3.123:58312`.
    pub fn sap_name(&self, dir: &Utf8Path) -> Utf8PathBuf {
        dir.join(format!("{SAP_NAME_PREFIX}{}:{}", self.host, self.port))
    }

    /// Path of the local-domain socket the user listens on,
    /// e.g. `/tmp/xdt-141.43.3.123:58312.5`.
    pub fn uap_name(&self, dir: &Utf8Path) -> Utf8PathBuf {
        dir.join(format!(
            "{SAP_NAME_PREFIX}{}:{}.{}",
            self.host, self.port, self.slot
        ))
    }
}

impl fmt::Display for XdtAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.host, self.port, self.slot)
    }
}

/// Parses `host:port[.slot]`.
///
/// `host` is a dotted quad or a hostname, resolved once here. The slot
/// defaults to 0 when absent.
impl FromStr for XdtAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressError::Malformed(s.to_owned());

        let (host, rest) = s.split_once(':').ok_or_else(malformed)?;
        if host.is_empty() || rest.is_empty() {
            return Err(malformed());
        }

        let (port, slot) = match rest.split_once('.') {
            Some((port, slot)) => {
                let slot = slot
                    .parse::<u32>()
                    .map_err(|_| AddressError::Slot(slot.to_owned()))?;
                (port, slot)
            }
            None => (rest, 0),
        };
        let port = port.parse::<u32>().map_err(|_| malformed())?;
        if port < u32::from(PORT_MIN) || port > u32::from(u16::MAX) {
            return Err(AddressError::PortRange(port));
        }
        let port = port as u16;

        let host = resolve_host(host, port)?;
        Ok(Self { host, port, slot })
    }
}

/// Resolves a host string to an IPv4 address, once.
fn resolve_host(host: &str, port: u16) -> Result<Ipv4Addr, AddressError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|_| AddressError::Resolve(host.to_owned()))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| AddressError::Resolve(host.to_owned()))
}
