use clap::Parser;
use log::{error, info, LevelFilter};
use pixels_ble::cli::args::Args;
use pixels_ble::error::{AppRunError, ConfigError};
use pixels_ble::{init_logging, run};

fn main() -> Result<(), AppRunError> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    if let Err(err) = init_logging(level) {
        eprintln!("Failed to initialize logging: {}", err);
    }
    info!(concat!("pixels-ble ", env!("CARGO_PKG_VERSION")));

    match run(args) {
        Err(err @ AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another instance of pixels-ble is already using the bluetooth adapter");
            Err(err)
        },
        Err(err) => {
            error!("{}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
