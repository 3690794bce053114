use std::path::PathBuf;
use std::time::Duration;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Scans for, connects to and talks with Pixels dice over Bluetooth LE", long_about = None)]
pub struct Args {
    /// Also log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Read settings from this file instead of the default location
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Scan for Pixels and print every advertisement received
    Scan {
        /// How long to scan, for example "30s". Defaults to the configured scan duration
        #[arg(short, long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Also print devices that look like a Pixel but could not be decoded
        #[arg(long)]
        show_unknown: bool,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Connect to a Pixel, query it, blink it and print the messages it sends
    Connect {
        /// Pixel id in hexadecimal, as printed by `scan`. Defaults to the first Pixel found
        #[arg(value_parser = parse_pixel_id)]
        pixel_id: Option<u32>,

        /// How long to print messages before disconnecting
        #[arg(short, long, value_parser = humantime::parse_duration, default_value = "10s")]
        listen: Duration,

        /// Do not blink the die after connecting
        #[arg(long)]
        no_blink: bool,
    },

    /// Print the location of the config file and the settings in effect
    Config {
        /// Overwrite the config file with the default settings
        #[arg(long)]
        reset: bool,
    },
}

fn parse_pixel_id(value: &str) -> Result<u32, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|err| format!("invalid pixel id {:?}: {}", value, err))
}
