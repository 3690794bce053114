use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::ble::constants::{CONNECT_TIMEOUT, OPERATION_TIMEOUT};
use crate::ble::peripheral::PeripheralConfig;
use crate::pixels::constants::{IDENTIFY_TIMEOUT, REQUEST_TIMEOUT};
use crate::pixels::pixel::{BlinkParams, PixelConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlinkConfig {
    /// 0x00RRGGBB
    pub color: u32,
    pub count: u8,
    pub duration_ms: u64,
    /// 0 to 100
    pub fade_percent: u8,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        BlinkConfig {
            color: 0x0000_FF00,
            count: 3,
            duration_ms: 1000,
            fade_percent: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub identify_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub scan_duration_ms: u64,
    /// Only list dice whose name starts with this.
    pub name_prefix: Option<String>,
    pub blink: BlinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connect_timeout_ms: CONNECT_TIMEOUT,
            operation_timeout_ms: OPERATION_TIMEOUT,
            identify_timeout_ms: IDENTIFY_TIMEOUT,
            request_timeout_ms: REQUEST_TIMEOUT,
            scan_duration_ms: 10_000,
            name_prefix: None,
            blink: BlinkConfig::default(),
        }
    }
}

impl Config {
    /// Replaces values that would make every operation fail right away.
    pub fn normalize(&mut self) {
        let defaults = Config::default();
        for (value, default) in [
            (&mut self.connect_timeout_ms, defaults.connect_timeout_ms),
            (&mut self.operation_timeout_ms, defaults.operation_timeout_ms),
            (&mut self.identify_timeout_ms, defaults.identify_timeout_ms),
            (&mut self.request_timeout_ms, defaults.request_timeout_ms),
            (&mut self.scan_duration_ms, defaults.scan_duration_ms),
        ] {
            if *value == 0 {
                *value = default;
            }
        }

        self.blink.fade_percent = self.blink.fade_percent.min(100);
        self.blink.count = self.blink.count.max(1);
        if self.name_prefix.as_deref().map_or(false, str::is_empty) {
            self.name_prefix = None;
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn peripheral_config(&self) -> PeripheralConfig {
        PeripheralConfig::default().with_operation_timeout(Duration::from_millis(self.operation_timeout_ms))
    }

    pub fn pixel_config(&self) -> PixelConfig {
        PixelConfig::default()
            .with_identify_timeout(Duration::from_millis(self.identify_timeout_ms))
            .with_request_timeout(self.request_timeout())
    }

    pub fn blink_params(&self) -> BlinkParams {
        BlinkParams {
            duration: Duration::from_millis(self.blink.duration_ms),
            color: self.blink.color,
            count: self.blink.count,
            fade: self.blink.fade_percent as f32 / 100.0,
            ..Default::default()
        }
    }
}
