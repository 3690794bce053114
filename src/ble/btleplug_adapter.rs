use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CharPropFlags, Characteristic as BtleCharacteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId as PlatformPeripheralId};
use futures::future::ready;
use futures::StreamExt;
use indexmap::IndexMap;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::ble::adapter::{AdvertisementStream, BleAdapter, DisconnectionStream, NotificationStream};
use crate::ble::advertisement::AdvertisementData;
use crate::ble::constants::UNKNOWN_RSSI;
use crate::ble::types::{
    Characteristic, CharacteristicProperty, ConnectionEventReason, Disconnection, PeripheralId, RawAdvertisement,
    Service,
};
use crate::error::AdapterError;

type PeripheralCache = Arc<Mutex<HashMap<PeripheralId, PlatformPeripheral>>>;

fn cache_lock(cache: &PeripheralCache) -> MutexGuard<'_, HashMap<PeripheralId, PlatformPeripheral>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_peripheral_id(id: &PlatformPeripheralId) -> PeripheralId {
    PeripheralId::new(format!("{:?}", id))
}

fn to_properties(flags: CharPropFlags) -> BTreeSet<CharacteristicProperty> {
    let mapping = [
        (CharPropFlags::BROADCAST, CharacteristicProperty::Broadcast),
        (CharPropFlags::READ, CharacteristicProperty::Read),
        (CharPropFlags::WRITE_WITHOUT_RESPONSE, CharacteristicProperty::WriteWithoutResponse),
        (CharPropFlags::WRITE, CharacteristicProperty::Write),
        (CharPropFlags::NOTIFY, CharacteristicProperty::Notify),
        (CharPropFlags::INDICATE, CharacteristicProperty::Indicate),
        (CharPropFlags::AUTHENTICATED_SIGNED_WRITES, CharacteristicProperty::AuthenticatedSignedWrites),
        (CharPropFlags::EXTENDED_PROPERTIES, CharacteristicProperty::ExtendedProperties),
    ];

    mapping
        .into_iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, property)| property)
        .collect()
}

async fn advertisement_of(
    adapter: &Adapter,
    cache: &PeripheralCache,
    id: &PlatformPeripheralId,
) -> Option<RawAdvertisement> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            warn!("Failed to query BLE adapter for peripheral {:?}: {}", id, err);
            return None;
        },
    };

    let properties = match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            return None;
        },
        Ok(None) => {
            debug!("Peripheral {:?} has no properties", id);
            return None;
        },
        Ok(Some(properties)) => properties,
    };

    // btleplug hands out parsed properties, rebuild the AD structures from them
    let mut manufacturer_data: Vec<_> = properties.manufacturer_data.into_iter().collect();
    manufacturer_data.sort_by_key(|(company_id, _)| *company_id);
    let mut service_data: Vec<_> = properties.service_data.into_iter().collect();
    service_data.sort_by_key(|(uuid, _)| *uuid);

    let advertisement = AdvertisementData {
        flags: None,
        local_name: properties.local_name,
        services: properties.services,
        tx_power: properties
            .tx_power_level
            .map(|power| power.clamp(i8::MIN as i16, i8::MAX as i16) as i8),
        manufacturer_data: manufacturer_data.into_iter().collect::<IndexMap<_, _>>(),
        service_data: service_data.into_iter().collect::<IndexMap<_, _>>(),
    };

    let peripheral_id = to_peripheral_id(id);
    cache_lock(cache).insert(peripheral_id.clone(), peripheral);

    Some(RawAdvertisement {
        id: peripheral_id,
        payload: advertisement.encode(),
        rssi: properties.rssi.unwrap_or(UNKNOWN_RSSI),
    })
}

/// [`BleAdapter`] backed by the first bluetooth adapter btleplug finds.
pub struct BtleplugAdapter {
    adapter: Adapter,
    peripherals: PeripheralCache,
}

impl BtleplugAdapter {
    pub async fn new() -> Result<Self, AdapterError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next().ok_or(AdapterError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        Ok(Self::from_adapter(adapter))
    }

    pub fn from_adapter(adapter: Adapter) -> Self {
        BtleplugAdapter {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<PlatformPeripheral, AdapterError> {
        if let Some(peripheral) = cache_lock(&self.peripherals).get(id) {
            return Ok(peripheral.clone());
        }

        // not seen through our own scan, ask the adapter for everything it knows
        for peripheral in self.adapter.peripherals().await? {
            let peripheral_id = to_peripheral_id(&peripheral.id());
            cache_lock(&self.peripherals).insert(peripheral_id, peripheral);
        }

        cache_lock(&self.peripherals)
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownPeripheral(id.to_string()))
    }

    async fn characteristic(&self, id: &PeripheralId, uuid: Uuid) -> Result<(PlatformPeripheral, BtleCharacteristic), AdapterError> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(AdapterError::MissingCharacteristic(uuid))?;
        Ok((peripheral, characteristic))
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn start_scan(&self, services: Vec<Uuid>) -> Result<AdvertisementStream, AdapterError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter { services }).await?;

        let adapter = self.adapter.clone();
        let cache = Arc::clone(&self.peripherals);
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let cache = Arc::clone(&cache);
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };
                advertisement_of(&adapter, &cache, &id).await
            }
        });

        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), AdapterError> {
        self.peripheral(id).await?.connect().await?;
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), AdapterError> {
        self.peripheral(id).await?.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Service>, AdapterError> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;

        let services = peripheral
            .services()
            .into_iter()
            .map(|service| Service {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| Characteristic {
                        uuid: c.uuid,
                        service_uuid: c.service_uuid,
                        properties: to_properties(c.properties),
                    })
                    .collect(),
            })
            .collect();

        Ok(services)
    }

    async fn read_characteristic(&self, id: &PeripheralId, characteristic: Uuid) -> Result<Vec<u8>, AdapterError> {
        let (peripheral, characteristic) = self.characteristic(id, characteristic).await?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), AdapterError> {
        let (peripheral, characteristic) = self.characteristic(id, characteristic).await?;
        let write_type = if with_response { WriteType::WithResponse } else { WriteType::WithoutResponse };
        peripheral.write(&characteristic, data, write_type).await?;
        Ok(())
    }

    async fn subscribe_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<NotificationStream, AdapterError> {
        let (peripheral, characteristic) = self.characteristic(id, characteristic).await?;
        // obtain the stream first so nothing sent right after subscribing is missed
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;

        let uuid = characteristic.uuid;
        let stream = notifications.filter_map(move |notification| {
            ready(if notification.uuid == uuid { Some(notification.value) } else { None })
        });
        Ok(stream.boxed())
    }

    async fn disconnections(&self) -> Result<DisconnectionStream, AdapterError> {
        let events = self.adapter.events().await?;
        let stream = events.filter_map(|event| {
            ready(match event {
                CentralEvent::DeviceDisconnected(id) => Some(Disconnection {
                    id: to_peripheral_id(&id),
                    reason: ConnectionEventReason::LinkLoss,
                }),
                _ => None,
            })
        });
        Ok(stream.boxed())
    }
}
