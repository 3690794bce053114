use std::collections::BTreeSet;
use std::fmt;
use serde::Serialize;
use uuid::Uuid;

/// Opaque identifier of a physical device, as reported by the bluetooth adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        PeripheralId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    FailedToConnect,
    Ready,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventReason {
    Unknown,
    Success,
    Canceled,
    NotSupported,
    Timeout,
    LinkLoss,
    AdapterOff,
    PeripheralInitiated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CharacteristicProperty {
    Broadcast,
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
    AuthenticatedSignedWrites,
    ExtendedProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: BTreeSet<CharacteristicProperty>,
}

impl Characteristic {
    pub fn can_notify(&self) -> bool {
        self.properties.contains(&CharacteristicProperty::Notify)
            || self.properties.contains(&CharacteristicProperty::Indicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// One advertisement as delivered by the adapter: AD structures plus signal strength.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub id: PeripheralId,
    pub payload: Vec<u8>,
    pub rssi: i16,
}

/// Unsolicited disconnect reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnection {
    pub id: PeripheralId,
    pub reason: ConnectionEventReason,
}
