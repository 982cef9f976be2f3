//! Protocol data units and their wire format.
//!
//! PDUs travel between peer services, one per UDP datagram, in an XDR-like
//! encoding: every integer is a 32-bit big-endian word, opaque byte arrays
//! carry a 32-bit length and are padded to a 4-byte boundary. The first word
//! of every PDU is its code.

use std::io::{Cursor, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use thiserror::Error;

use crate::address::XdtAddress;

/// Maximum payload of one DT PDU (and of one data SDU).
pub const DATA_MAX: usize = 255;

/// Receive-buffer bound: an initial DT with a full payload encodes to
/// 320 bytes, rounded up generously.
pub const STREAM_MAX: usize = 512;

/// Size of the encoded host field: a dotted quad plus terminator,
/// NUL-padded. Already a multiple of the 4-byte alignment.
const HOST_LEN: usize = 16;

/// PDU codes on the wire. The numbering continues the SDU codes so SDU,
/// PDU and timer message types stay disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum PduCode {
    Dt = 8,
    Ack = 9,
    Abo = 10,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PduError {
    #[error("datagram truncated")]
    Truncated,

    #[error("unknown PDU code {0}")]
    UnknownCode(i32),

    #[error("payload length {0} exceeds {DATA_MAX}")]
    PayloadTooLong(usize),

    #[error("host field does not hold a dotted-quad IPv4 address")]
    BadHost,

    #[error("sequence {0} inconsistent with carried addressing")]
    BadLink(u32),
}

impl From<std::io::Error> for PduError {
    fn from(_: std::io::Error) -> Self {
        // reads and writes go to in-memory buffers; the only failure is
        // running off the end of a short datagram
        PduError::Truncated
    }
}

/// Source and destination user addresses, carried only by initial PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub source: XdtAddress,
    pub dest: XdtAddress,
}

impl Endpoints {
    /// Addressing of the ACK answering a DT: source and destination trade
    /// places.
    pub fn swapped(&self) -> Self {
        Self {
            source: self.dest,
            dest: self.source,
        }
    }
}

/// Connection identification of a DT: the initial DT (sequence 1) carries
/// the endpoint addresses, every later one the connection number assigned
/// by the receiving service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtLink {
    Endpoints(Endpoints),
    Conn(u32),
}

/// Data transfer PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dt {
    pub sequ: u32,
    pub link: DtLink,
    pub eom: bool,
    pub data: Vec<u8>,
}

impl Dt {
    pub fn conn(&self) -> Option<u32> {
        match self.link {
            DtLink::Conn(conn) => Some(conn),
            DtLink::Endpoints(_) => None,
        }
    }

    pub fn endpoints(&self) -> Option<&Endpoints> {
        match &self.link {
            DtLink::Endpoints(endpoints) => Some(endpoints),
            DtLink::Conn(_) => None,
        }
    }
}

/// Acknowledgement PDU. The initial ACK additionally carries the endpoint
/// addresses so the sending service can find the right instance before a
/// connection number is known on its side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub sequ: u32,
    pub endpoints: Option<Endpoints>,
    pub conn: u32,
}

/// Abort PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abo {
    pub conn: u32,
}

/// One protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Dt(Dt),
    Ack(Ack),
    Abo(Abo),
}

impl Pdu {
    pub fn code(&self) -> PduCode {
        match self {
            Pdu::Dt(_) => PduCode::Dt,
            Pdu::Ack(_) => PduCode::Ack,
            Pdu::Abo(_) => PduCode::Abo,
        }
    }

    /// Sequence number, where the variant has one.
    pub fn sequ(&self) -> Option<u32> {
        match self {
            Pdu::Dt(dt) => Some(dt.sequ),
            Pdu::Ack(ack) => Some(ack.sequ),
            Pdu::Abo(_) => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PduError> {
        let mut buf = Vec::with_capacity(STREAM_MAX);
        buf.write_i32::<BigEndian>(self.code() as i32)?;
        match self {
            Pdu::Dt(dt) => {
                if dt.data.len() > DATA_MAX {
                    return Err(PduError::PayloadTooLong(dt.data.len()));
                }
                buf.write_u32::<BigEndian>(dt.sequ)?;
                match (&dt.link, dt.sequ) {
                    (DtLink::Endpoints(endpoints), 1) => {
                        write_address(&mut buf, &endpoints.source)?;
                        write_address(&mut buf, &endpoints.dest)?;
                    }
                    (DtLink::Conn(conn), sequ) if sequ != 1 => {
                        buf.write_u32::<BigEndian>(*conn)?;
                    }
                    _ => return Err(PduError::BadLink(dt.sequ)),
                }
                buf.write_u32::<BigEndian>(dt.eom.into())?;
                write_opaque(&mut buf, &dt.data)?;
            }
            Pdu::Ack(ack) => {
                buf.write_u32::<BigEndian>(ack.sequ)?;
                match (&ack.endpoints, ack.sequ) {
                    (Some(endpoints), 1) => {
                        write_address(&mut buf, &endpoints.source)?;
                        write_address(&mut buf, &endpoints.dest)?;
                    }
                    (None, sequ) if sequ != 1 => {}
                    _ => return Err(PduError::BadLink(ack.sequ)),
                }
                buf.write_u32::<BigEndian>(ack.conn)?;
            }
            Pdu::Abo(abo) => {
                buf.write_u32::<BigEndian>(abo.conn)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(stream: &[u8]) -> Result<Pdu, PduError> {
        let mut rd = Cursor::new(stream);
        let code = rd.read_i32::<BigEndian>()?;
        match PduCode::from_i32(code).ok_or(PduError::UnknownCode(code))? {
            PduCode::Dt => {
                let sequ = rd.read_u32::<BigEndian>()?;
                let link = if sequ == 1 {
                    DtLink::Endpoints(Endpoints {
                        source: read_address(&mut rd)?,
                        dest: read_address(&mut rd)?,
                    })
                } else {
                    DtLink::Conn(rd.read_u32::<BigEndian>()?)
                };
                let eom = rd.read_u32::<BigEndian>()? != 0;
                let data = read_opaque(&mut rd)?;
                Ok(Pdu::Dt(Dt {
                    sequ,
                    link,
                    eom,
                    data,
                }))
            }
            PduCode::Ack => {
                let sequ = rd.read_u32::<BigEndian>()?;
                let endpoints = if sequ == 1 {
                    Some(Endpoints {
                        source: read_address(&mut rd)?,
                        dest: read_address(&mut rd)?,
                    })
                } else {
                    None
                };
                let conn = rd.read_u32::<BigEndian>()?;
                Ok(Pdu::Ack(Ack {
                    sequ,
                    endpoints,
                    conn,
                }))
            }
            PduCode::Abo => Ok(Pdu::Abo(Abo {
                conn: rd.read_u32::<BigEndian>()?,
            })),
        }
    }
}

pub(crate) fn write_address(buf: &mut Vec<u8>, addr: &XdtAddress) -> Result<(), PduError> {
    let host = addr.host.to_string();
    let mut field = [0u8; HOST_LEN];
    field[..host.len()].copy_from_slice(host.as_bytes());
    buf.write_all(&field)?;
    buf.write_i32::<BigEndian>(addr.port.into())?;
    buf.write_u32::<BigEndian>(addr.slot)?;
    Ok(())
}

pub(crate) fn read_address(rd: &mut Cursor<&[u8]>) -> Result<XdtAddress, PduError> {
    let mut field = [0u8; HOST_LEN];
    rd.read_exact(&mut field)?;
    let end = field.iter().position(|&b| b == 0).unwrap_or(HOST_LEN);
    let host = std::str::from_utf8(&field[..end])
        .map_err(|_| PduError::BadHost)?
        .parse::<Ipv4Addr>()
        .map_err(|_| PduError::BadHost)?;
    let port = rd.read_i32::<BigEndian>()?;
    let port = u16::try_from(port).map_err(|_| PduError::BadHost)?;
    let slot = rd.read_u32::<BigEndian>()?;
    Ok(XdtAddress { host, port, slot })
}

pub(crate) fn write_opaque(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), PduError> {
    buf.write_u32::<BigEndian>(data.len() as u32)?;
    buf.write_all(data)?;
    let pad = data.len().wrapping_neg() % 4;
    buf.write_all(&[0u8; 3][..pad])?;
    Ok(())
}

pub(crate) fn read_opaque(rd: &mut Cursor<&[u8]>) -> Result<Vec<u8>, PduError> {
    let length = rd.read_u32::<BigEndian>()? as usize;
    if length > DATA_MAX {
        return Err(PduError::PayloadTooLong(length));
    }
    let mut data = vec![0u8; length];
    rd.read_exact(&mut data)?;
    let mut pad = [0u8; 3];
    rd.read_exact(&mut pad[..length.wrapping_neg() % 4])?;
    Ok(data)
}
