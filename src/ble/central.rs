use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use futures::future::join_all;
use indexmap::IndexMap;
use log::info;

use crate::ble::adapter::BleAdapter;
use crate::ble::peripheral::{Peripheral, PeripheralConfig};
use crate::ble::scanner::Scanner;
use crate::ble::types::PeripheralId;

/// Entry point of the library: owns the adapter and hands out one [`Peripheral`] per identifier,
/// so every part of an application that talks to a device shares the same connection state.
pub struct Central<A: BleAdapter> {
    adapter: Arc<A>,
    config: PeripheralConfig,
    peripherals: Mutex<IndexMap<PeripheralId, Peripheral<A>>>,
}

impl<A: BleAdapter> Central<A> {
    pub fn new(adapter: A) -> Self {
        Self::with_config(adapter, PeripheralConfig::default())
    }

    pub fn with_config(adapter: A, config: PeripheralConfig) -> Self {
        Central {
            adapter: Arc::new(adapter),
            config,
            peripherals: Mutex::new(IndexMap::new()),
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    fn peripherals_lock(&self) -> MutexGuard<'_, IndexMap<PeripheralId, Peripheral<A>>> {
        self.peripherals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scanner(&self) -> Scanner<A> {
        Scanner::new(Arc::clone(&self.adapter))
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Peripheral<A> {
        self.peripherals_lock()
            .entry(id.clone())
            .or_insert_with(|| Peripheral::new(Arc::clone(&self.adapter), id.clone(), self.config.clone()))
            .clone()
    }

    pub fn peripherals(&self) -> Vec<Peripheral<A>> {
        self.peripherals_lock().values().cloned().collect()
    }

    pub async fn disconnect_all(&self) {
        let peripherals = self.peripherals();
        info!("Disconnecting {} peripheral(s)", peripherals.len());
        join_all(peripherals.iter().map(|peripheral| peripheral.disconnect())).await;
    }
}
