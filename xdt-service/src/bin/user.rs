//! Reference user layer.
//!
//! Invoked with one address it is a consumer: payloads delivered by the
//! service are written to standard output until the stream disconnects.
//! Invoked with two addresses it is a producer: standard input is chunked
//! into data requests of at most 255 bytes, flow-controlled by the
//! confirmation dialogue; a short final chunk carries the end-of-message
//! flag.

use std::io::{self, Read, Write};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use xdt_core::address::XdtAddress;
use xdt_core::pdu::{Endpoints, DATA_MAX};
use xdt_core::sdu::{DataRequest, Sdu};
use xdt_core::user::{User, UserError};

/// Directory of the access-point sockets, shared with the service.
const SOCKET_DIR: &str = "/tmp";

#[derive(Parser)]
#[command(
    name = "xdt-user",
    about = "Producer/consumer exercising the transfer service",
    after_help = "\
<local address>, <remote address> = host:port[.slot]\n\
  host = hostname or IPv4 address in standard dot notation\n\
  port = IP port number in range [49152, 65535]\n\
  slot = user slot number (default is 0)\n\n\
With only a local address the program consumes to stdout; with a remote\n\
address it produces from stdin."
)]
struct Args {
    /// Local address this user is reachable under.
    local: String,

    /// Remote consumer address; producing mode.
    remote: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let local: XdtAddress = match args.local.parse() {
        Ok(local) => local,
        Err(e) => {
            eprintln!("error in <local address>: {e}");
            return ExitCode::from(2);
        }
    };

    let outcome = match args.remote {
        Some(remote) => match remote.parse::<XdtAddress>() {
            Ok(remote) => produce(local, remote),
            Err(e) => {
                eprintln!("error in <remote address>: {e}");
                return ExitCode::from(2);
            }
        },
        None => consume(local),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Reads the next payload chunk from stdin, at most 255 bytes. A short read
/// means the input is exhausted.
fn read_chunk(stdin: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; DATA_MAX];
    let mut filled = 0;
    while filled < DATA_MAX {
        let n = stdin.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn produce(local: XdtAddress, remote: XdtAddress) -> Result<ExitCode, UserError> {
    let user = User::connect(local, SOCKET_DIR)?;
    let mut stdin = io::stdin().lock();

    // the opening request carries the addresses; whether it is also the last
    // chunk is decided by the follow-up read, so eom stays clear here
    user.send(&Sdu::DataRequest(DataRequest {
        conn: 0,
        sequ: 1,
        endpoints: Some(Endpoints {
            source: local,
            dest: remote,
        }),
        eom: false,
        data: read_chunk(&mut stdin)?,
    }))?;

    let conn = loop {
        match user.recv()? {
            Sdu::DataConfirm { conn, sequ: 1 } => break conn,
            Sdu::AbortIndication { .. } => {
                eprintln!("transfer aborted");
                return Ok(ExitCode::FAILURE);
            }
            other => warn!("unexpected {:?} while connecting", other.code()),
        }
    };
    info!("connected, connection {conn}");

    let mut sequ = 1u32;
    loop {
        let data = read_chunk(&mut stdin)?;
        let eom = data.len() < DATA_MAX;
        sequ += 1;
        user.send(&Sdu::DataRequest(DataRequest {
            conn,
            sequ,
            endpoints: None,
            eom,
            data,
        }))?;

        // wait until this chunk is confirmed; a break only defers the
        // confirmation until the window has room again
        loop {
            match user.recv()? {
                Sdu::DataConfirm { conn: c, sequ: s } if c == conn && s == sequ => break,
                Sdu::BreakIndication { conn: c } if c == conn => {
                    info!("send window full, waiting")
                }
                Sdu::DisconnectIndication { conn: c } if c == conn => {
                    return Ok(ExitCode::SUCCESS)
                }
                Sdu::AbortIndication { conn: c } if c == conn => {
                    eprintln!("transfer aborted");
                    return Ok(ExitCode::FAILURE);
                }
                other => warn!("unexpected {:?} during transfer", other.code()),
            }
        }

        if eom {
            break;
        }
    }

    // the disconnect for the final chunk closes the stream
    loop {
        match user.recv()? {
            Sdu::DisconnectIndication { conn: c } if c == conn => {
                return Ok(ExitCode::SUCCESS)
            }
            Sdu::AbortIndication { conn: c } if c == conn => {
                eprintln!("transfer aborted");
                return Ok(ExitCode::FAILURE);
            }
            other => warn!("unexpected {:?} at end of stream", other.code()),
        }
    }
}

fn consume(local: XdtAddress) -> Result<ExitCode, UserError> {
    let user = User::bind(local, SOCKET_DIR)?;
    let mut stdout = io::stdout().lock();
    loop {
        match user.recv()? {
            Sdu::DataIndication(ind) => {
                stdout.write_all(&ind.data)?;
                stdout.flush()?;
            }
            Sdu::DisconnectIndication { .. } => return Ok(ExitCode::SUCCESS),
            Sdu::AbortIndication { .. } => {
                eprintln!("transfer aborted");
                return Ok(ExitCode::FAILURE);
            }
            other => warn!("unexpected {:?}", other.code()),
        }
    }
}
