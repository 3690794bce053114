use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use indexmap::IndexMap;
use log::{debug, info};

use crate::ble::adapter::BleAdapter;
use crate::ble::scanner::{ScanEvent, ScanFilter, ScannedPeripheral, Scanner};
use crate::ble::types::PeripheralId;
use crate::error::{BleError, DecodeError};
use crate::guarded_list::{CallbackHandle, GuardedCallbackList};
use crate::pixels::constants::PIXELS_SERVICE;
use crate::pixels::info::{ScannedPixel, ScannedPixelData};

#[derive(Debug, Clone)]
pub enum PixelScanEvent {
    Scanned(ScannedPixel),
    /// Advertises the Pixels service but its data could not be decoded.
    UnknownDevice { peripheral: ScannedPeripheral, error: DecodeError },
}

pub type PixelScanCallback = Arc<dyn Fn(&PixelScanEvent) + Send + Sync>;

/// Advertisements recognized as coming from a Pixel: the Pixels service plus manufacturer data.
pub fn pixel_filter() -> ScanFilter {
    ScanFilter::All(vec![
        ScanFilter::Service(PIXELS_SERVICE),
        ScanFilter::ManufacturerData { company_id: None, prefix: vec![] },
    ])
}

struct PixelScannerShared {
    pixels: Mutex<IndexMap<PeripheralId, ScannedPixel>>,
    callbacks: GuardedCallbackList<PixelScanCallback>,
}

impl PixelScannerShared {
    fn pixels(&self) -> MutexGuard<'_, IndexMap<PeripheralId, ScannedPixel>> {
        self.pixels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_scan_event(&self, event: &ScanEvent) {
        let peripheral = event.peripheral();
        let event = match ScannedPixelData::from_advertisement(peripheral) {
            Ok(data) if data.pixel_id == 0 => {
                // the service data usually follows in the scan response
                debug!("Pixel {} has not advertised its id yet", peripheral.id);
                return;
            },
            Ok(data) => {
                let pixel = ScannedPixel::new(data);
                self.pixels().insert(peripheral.id.clone(), pixel.clone());
                PixelScanEvent::Scanned(pixel)
            },
            Err(error) => {
                debug!("Undecodable advertisement from {}: {}", peripheral.id, error);
                PixelScanEvent::UnknownDevice {
                    peripheral: peripheral.clone(),
                    error,
                }
            },
        };

        self.callbacks.invoke_all(|callback| callback(&event));
    }
}

/// Scans for Pixels and decodes their advertisements.
pub struct PixelScanner<A: BleAdapter> {
    scanner: Scanner<A>,
    shared: Arc<PixelScannerShared>,
    scan_handle: CallbackHandle,
}

impl<A: BleAdapter> PixelScanner<A> {
    pub fn new(scanner: Scanner<A>) -> Self {
        let shared = Arc::new(PixelScannerShared {
            pixels: Mutex::new(IndexMap::new()),
            callbacks: GuardedCallbackList::new(),
        });

        let weak: Weak<PixelScannerShared> = Arc::downgrade(&shared);
        let scan_handle = scanner.on_scanned(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_scan_event(event);
            }
        });

        PixelScanner { scanner, shared, scan_handle }
    }

    pub async fn start_scan(&self) -> Result<(), BleError> {
        info!("Scanning for Pixels");
        self.scanner.start_scan(Some(pixel_filter())).await
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanner.stop_scan().await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn on_scanned<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&PixelScanEvent) + Send + Sync + 'static,
    {
        self.shared.callbacks.add(Arc::new(callback))
    }

    pub fn remove_callback(&self, handle: CallbackHandle) -> bool {
        self.shared.callbacks.remove(handle)
    }

    /// One entry per die, in discovery order, holding its latest advertisement.
    pub fn scanned_pixels(&self) -> Vec<ScannedPixel> {
        self.shared.pixels().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.shared.pixels().clear();
        self.scanner.clear();
    }
}

impl<A: BleAdapter> Drop for PixelScanner<A> {
    fn drop(&mut self) {
        self.scanner.remove_callback(self.scan_handle);
    }
}
