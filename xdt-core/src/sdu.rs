//! Service data units exchanged with the user layer.
//!
//! One SDU per local-domain datagram. Both the service and the user layer
//! link this crate, so the encoding below *is* the shared-layout contract of
//! the user interface. SDU codes sit below the PDU codes, which in turn sit
//! below the timer message types.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::pdu::{
    read_address, read_opaque, write_address, write_opaque, Endpoints, PduError, DATA_MAX,
};

/// SDU codes on the local wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SduCode {
    DataRequest = 1,
    DataIndication = 2,
    DataConfirm = 3,
    BreakIndication = 4,
    AbortIndication = 5,
    DisconnectIndication = 6,
}

/// XDATrequ: a producer hands one payload chunk to the service. The initial
/// request (sequence 1) carries the endpoint addresses and opens the
/// connection; later ones carry the connection number instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub conn: u32,
    pub sequ: u32,
    pub endpoints: Option<Endpoints>,
    pub eom: bool,
    pub data: Vec<u8>,
}

/// XDATind: one in-order payload chunk delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataIndication {
    pub conn: u32,
    pub sequ: u32,
    pub eom: bool,
    pub data: Vec<u8>,
}

/// One service data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sdu {
    DataRequest(DataRequest),
    DataIndication(DataIndication),
    /// XDATconf: the chunk with this sequence number is acknowledged.
    DataConfirm { conn: u32, sequ: u32 },
    /// XBREAKind: the send window is full; the producer must pause.
    BreakIndication { conn: u32 },
    /// XABORTind: the connection is gone. Terminal.
    AbortIndication { conn: u32 },
    /// XDISind: graceful disconnect after the final chunk. Terminal.
    DisconnectIndication { conn: u32 },
}

impl Sdu {
    pub fn code(&self) -> SduCode {
        match self {
            Sdu::DataRequest(_) => SduCode::DataRequest,
            Sdu::DataIndication(_) => SduCode::DataIndication,
            Sdu::DataConfirm { .. } => SduCode::DataConfirm,
            Sdu::BreakIndication { .. } => SduCode::BreakIndication,
            Sdu::AbortIndication { .. } => SduCode::AbortIndication,
            Sdu::DisconnectIndication { .. } => SduCode::DisconnectIndication,
        }
    }

    /// The connection number carried by this SDU. The dispatcher rewrites it
    /// between the mapped and real domains at the user boundary.
    pub fn conn(&self) -> u32 {
        match self {
            Sdu::DataRequest(requ) => requ.conn,
            Sdu::DataIndication(ind) => ind.conn,
            Sdu::DataConfirm { conn, .. }
            | Sdu::BreakIndication { conn }
            | Sdu::AbortIndication { conn }
            | Sdu::DisconnectIndication { conn } => *conn,
        }
    }

    pub fn set_conn(&mut self, new: u32) {
        match self {
            Sdu::DataRequest(requ) => requ.conn = new,
            Sdu::DataIndication(ind) => ind.conn = new,
            Sdu::DataConfirm { conn, .. }
            | Sdu::BreakIndication { conn }
            | Sdu::AbortIndication { conn }
            | Sdu::DisconnectIndication { conn } => *conn = new,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PduError> {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(self.code() as i32)?;
        match self {
            Sdu::DataRequest(requ) => {
                if requ.data.len() > DATA_MAX {
                    return Err(PduError::PayloadTooLong(requ.data.len()));
                }
                buf.write_u32::<BigEndian>(requ.conn)?;
                buf.write_u32::<BigEndian>(requ.sequ)?;
                match (&requ.endpoints, requ.sequ) {
                    (Some(endpoints), 1) => {
                        write_address(&mut buf, &endpoints.source)?;
                        write_address(&mut buf, &endpoints.dest)?;
                    }
                    (None, sequ) if sequ != 1 => {}
                    _ => return Err(PduError::BadLink(requ.sequ)),
                }
                buf.write_u32::<BigEndian>(requ.eom.into())?;
                write_opaque(&mut buf, &requ.data)?;
            }
            Sdu::DataIndication(ind) => {
                if ind.data.len() > DATA_MAX {
                    return Err(PduError::PayloadTooLong(ind.data.len()));
                }
                buf.write_u32::<BigEndian>(ind.conn)?;
                buf.write_u32::<BigEndian>(ind.sequ)?;
                buf.write_u32::<BigEndian>(ind.eom.into())?;
                write_opaque(&mut buf, &ind.data)?;
            }
            Sdu::DataConfirm { conn, sequ } => {
                buf.write_u32::<BigEndian>(*conn)?;
                buf.write_u32::<BigEndian>(*sequ)?;
            }
            Sdu::BreakIndication { conn }
            | Sdu::AbortIndication { conn }
            | Sdu::DisconnectIndication { conn } => {
                buf.write_u32::<BigEndian>(*conn)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(stream: &[u8]) -> Result<Sdu, PduError> {
        let mut rd = Cursor::new(stream);
        let code = rd.read_i32::<BigEndian>()?;
        match SduCode::from_i32(code).ok_or(PduError::UnknownCode(code))? {
            SduCode::DataRequest => {
                let conn = rd.read_u32::<BigEndian>()?;
                let sequ = rd.read_u32::<BigEndian>()?;
                let endpoints = if sequ == 1 {
                    Some(Endpoints {
                        source: read_address(&mut rd)?,
                        dest: read_address(&mut rd)?,
                    })
                } else {
                    None
                };
                let eom = rd.read_u32::<BigEndian>()? != 0;
                let data = read_opaque(&mut rd)?;
                Ok(Sdu::DataRequest(DataRequest {
                    conn,
                    sequ,
                    endpoints,
                    eom,
                    data,
                }))
            }
            SduCode::DataIndication => {
                let conn = rd.read_u32::<BigEndian>()?;
                let sequ = rd.read_u32::<BigEndian>()?;
                let eom = rd.read_u32::<BigEndian>()? != 0;
                let data = read_opaque(&mut rd)?;
                Ok(Sdu::DataIndication(DataIndication {
                    conn,
                    sequ,
                    eom,
                    data,
                }))
            }
            SduCode::DataConfirm => Ok(Sdu::DataConfirm {
                conn: rd.read_u32::<BigEndian>()?,
                sequ: rd.read_u32::<BigEndian>()?,
            }),
            SduCode::BreakIndication => Ok(Sdu::BreakIndication {
                conn: rd.read_u32::<BigEndian>()?,
            }),
            SduCode::AbortIndication => Ok(Sdu::AbortIndication {
                conn: rd.read_u32::<BigEndian>()?,
            }),
            SduCode::DisconnectIndication => Ok(Sdu::DisconnectIndication {
                conn: rd.read_u32::<BigEndian>()?,
            }),
        }
    }
}
