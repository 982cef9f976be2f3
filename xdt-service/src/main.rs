//! The transfer service process: one dispatcher, up to five concurrent
//! sender/receiver instances.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, warn};

use xdt_core::address::XdtAddress;
use xdt_core::daemon::{Config, Daemon};
use xdt_core::fault::ErrorCase;

#[derive(Parser)]
#[command(
    name = "xdt-service",
    about = "Reliable transfer service over UDP",
    after_help = "\
<listen address> = host:port\n\
  host = hostname or IPv4 address in standard dot notation\n\
  port = IP port number in range [49152, 65535]\n\n\
<error case> = 0 (none) to 8, selecting which outgoing PDUs are\n\
dropped to simulate a lossy wire; see the service documentation."
)]
struct Args {
    /// Error case to simulate, 0 (none) to 8.
    #[arg(short = 'e', long = "error-case", default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=8))]
    error_case: u8,

    /// Listen address, host:port.
    listen: String,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let listen: XdtAddress = match args.listen.parse() {
        Ok(listen) => listen,
        Err(e) => {
            eprintln!("error in <listen address>: {e}");
            return ExitCode::from(2);
        }
    };

    let mut config = Config::new(listen);
    // range enforced by the argument parser
    config.error_case = ErrorCase::from_number(args.error_case).unwrap_or_default();

    let daemon = match Daemon::bind(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = quit.clone();
        if let Err(e) = ctrlc::set_handler(move || quit.store(true, Ordering::SeqCst)) {
            warn!("no signal handler, interrupt will not shut down cleanly: {e}");
        }
    }

    match daemon.run(quit) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
