use std::sync::Arc;
use std::time::SystemTime;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use crate::ble::adapter::BleAdapter;
use crate::ble::btleplug_adapter::BtleplugAdapter;
use crate::ble::central::Central;
use crate::cli::args::{Args, Command};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::error::{AppRunError, BleError};
use crate::pixels::info::{PixelInfo, ScannedPixel};
use crate::pixels::pixel::{MessageEvent, PixelDelegate};
use crate::pixels::scanner::PixelScanEvent;
use crate::pixels::types::{PixelRollState, PixelStatus};

pub async fn run_command(args: Args) -> Result<(), AppRunError> {
    let config_io = match &args.config_file {
        Some(path) => ConfigIO::open(path.clone())?,
        None => ConfigIO::new_sync()?,
    };

    if let Command::Config { reset } = args.command {
        return config_command(&config_io, reset).await;
    }

    let config = config_io.read().await?;
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;

    let adapter = BtleplugAdapter::new().await?;
    let central = Central::with_config(adapter, config.peripheral_config());

    match args.command {
        Command::Scan { duration, show_unknown, json } => {
            let duration = duration.unwrap_or_else(|| config.scan_duration());
            scan_command(&central, &config, duration, show_unknown, json).await
        },
        Command::Connect { pixel_id, listen, no_blink } => {
            connect_command(&central, &config, pixel_id, listen, !no_blink).await
        },
        Command::Config { .. } => Ok(()),
    }
}

async fn config_command(config_io: &ConfigIO, reset: bool) -> Result<(), AppRunError> {
    let config = if reset {
        let config = Config::default();
        config_io.save(&config).await?;
        config
    } else {
        config_io.read().await?
    };

    println!("{}", config_io.path().to_string_lossy());
    println!("{}", serde_json::to_string_pretty(&config).map_err(crate::error::ConfigError::from)?);
    Ok(())
}

fn name_matches(config: &Config, pixel: &dyn PixelInfo) -> bool {
    match &config.name_prefix {
        Some(prefix) => pixel.name().starts_with(prefix.as_str()),
        None => true,
    }
}

fn print_pixel(pixel: &ScannedPixel, json: bool) {
    if json {
        match serde_json::to_string(pixel.as_data()) {
            Ok(line) => println!("{}", line),
            Err(err) => warn!("Could not encode scan result: {}", err),
        }
        return;
    }

    println!(
        "{:08x} {:<16} {:>4} {:<16} face {:>2} {:?} battery {:>3}%{} rssi {}",
        pixel.pixel_id(),
        pixel.name(),
        pixel.die_type(),
        format!("{:?}", pixel.design_and_color()),
        pixel.current_face(),
        pixel.roll_state(),
        pixel.battery_level(),
        if pixel.is_charging() { " (charging)" } else { "" },
        pixel.rssi(),
    );
}

pub async fn scan_command<A: BleAdapter>(
    central: &Central<A>,
    config: &Config,
    duration: Duration,
    show_unknown: bool,
    json: bool,
) -> Result<(), AppRunError> {
    let scanner = central.pixel_scanner();
    let filter_config = config.clone();
    scanner.on_scanned(move |event| match event {
        PixelScanEvent::Scanned(pixel) => {
            if name_matches(&filter_config, pixel) {
                print_pixel(pixel, json);
            }
        },
        PixelScanEvent::UnknownDevice { peripheral, error } => {
            if show_unknown {
                println!("{} {:?}: {}", peripheral.id, peripheral.name().unwrap_or("?"), error);
            }
        },
    });

    scanner.start_scan().await?;
    sleep(duration).await;
    scanner.stop_scan().await?;

    let found = scanner
        .scanned_pixels()
        .iter()
        .filter(|pixel| name_matches(config, *pixel))
        .count();
    info!("Found {} Pixel(s)", found);
    Ok(())
}

/// Scans until a Pixel with `pixel_id` (or any Pixel) shows up, for at most the scan duration.
async fn find_pixel<A: BleAdapter>(
    central: &Central<A>,
    config: &Config,
    pixel_id: Option<u32>,
) -> Result<ScannedPixel, AppRunError> {
    let scanner = central.pixel_scanner();
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let filter_config = config.clone();
    scanner.on_scanned(move |event| {
        if let PixelScanEvent::Scanned(pixel) = event {
            let wanted = pixel_id.map_or(true, |id| id == pixel.pixel_id());
            if wanted && name_matches(&filter_config, pixel) {
                let _ = sender.send(pixel.clone());
            }
        }
    });

    scanner.start_scan().await?;
    let found = timeout(config.scan_duration(), receiver.recv()).await;
    scanner.stop_scan().await?;

    match found {
        Ok(Some(pixel)) => Ok(pixel),
        _ => Err(AppRunError::NoPixelFound),
    }
}

struct PrintingDelegate;

impl PixelDelegate for PrintingDelegate {
    fn on_status_changed(&self, pixel: &dyn PixelInfo, status: PixelStatus) {
        info!("{} is now {:?}", pixel.name(), status);
    }

    fn on_battery_level_changed(&self, pixel: &dyn PixelInfo, level: u8) {
        println!("{} battery {}%", pixel.name(), level);
    }

    fn on_roll_state_changed(&self, pixel: &dyn PixelInfo, state: PixelRollState, face: u8) {
        if state != PixelRollState::OnFace {
            println!("{} {:?}", pixel.name(), state);
        } else {
            println!("{} on face {}", pixel.name(), face);
        }
    }

    fn on_rolled(&self, pixel: &dyn PixelInfo, face: u8) {
        println!("{} rolled {}", pixel.name(), face);
    }
}

pub async fn connect_command<A: BleAdapter>(
    central: &Central<A>,
    config: &Config,
    pixel_id: Option<u32>,
    listen: Duration,
    blink: bool,
) -> Result<(), AppRunError> {
    let scanned = find_pixel(central, config, pixel_id).await?;
    let pixel = central.pixel_with(&scanned, config.pixel_config(), Some(Arc::new(PrintingDelegate)));

    pixel.on_message(|event| match event {
        MessageEvent::Message(message) => info!("Received {:?}", message),
        MessageEvent::Malformed { payload, error } => warn!("Received malformed {:02x?}: {}", payload, error),
    });

    pixel.connect(config.connect_timeout()).await?;

    let firmware: SystemTime = pixel.firmware_date();
    println!(
        "Connected to {} ({:08x}): {} {:?}, firmware {}",
        pixel.name(),
        pixel.pixel_id(),
        pixel.die_type(),
        pixel.design_and_color(),
        humantime::format_rfc3339_seconds(firmware),
    );

    let session = async {
        let rssi = pixel.request_rssi(config.request_timeout()).await?;
        println!("RSSI {} dBm", rssi);

        let battery = pixel.request_battery_level(config.request_timeout()).await?;
        println!("Battery {}% ({:?})", battery.level_percent, battery.state);

        if blink {
            pixel.blink(&config.blink_params(), config.request_timeout()).await?;
        }

        sleep(listen).await;
        Ok::<(), BleError>(())
    }
    .await;

    pixel.disconnect().await;
    session?;
    Ok(())
}
