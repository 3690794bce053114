use std::env;
use crate::cli::args::Args;
use crate::cli::commands::run_command;
use crate::error::AppRunError;

pub mod ble;
pub mod cli;
pub mod config;
pub mod error;
pub mod guarded_list;
pub mod pixels;

pub fn init_logging(level: log::LevelFilter) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(fern::log_file(log_file)?);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn run(args: Args) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::RuntimeError { source })?;

    runtime.block_on(run_command(args))
}
