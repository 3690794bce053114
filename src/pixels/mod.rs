pub mod constants;
pub mod info;
pub mod messages;
pub mod pixel;
pub mod scanner;
pub mod types;

use std::sync::Arc;

use crate::ble::adapter::BleAdapter;
use crate::ble::central::Central;
use crate::pixels::info::{PixelInfo, ScannedPixel};
use crate::pixels::pixel::{Pixel, PixelConfig, PixelDelegate};
use crate::pixels::scanner::PixelScanner;

impl<A: BleAdapter> Central<A> {
    pub fn pixel_scanner(&self) -> PixelScanner<A> {
        PixelScanner::new(self.scanner())
    }

    /// Session for a scanned die, sharing the connection state of its peripheral.
    pub fn pixel(&self, scanned: &ScannedPixel) -> Pixel<A> {
        self.pixel_with(scanned, PixelConfig::default(), None)
    }

    pub fn pixel_with(
        &self,
        scanned: &ScannedPixel,
        config: PixelConfig,
        delegate: Option<Arc<dyn PixelDelegate>>,
    ) -> Pixel<A> {
        Pixel::new(self.peripheral(&scanned.system_id()), scanned, config, delegate)
    }
}
