use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::ble::types::{Disconnection, PeripheralId, RawAdvertisement, Service};
use crate::error::AdapterError;

pub type AdvertisementStream = BoxStream<'static, RawAdvertisement>;
pub type NotificationStream = BoxStream<'static, Vec<u8>>;
pub type DisconnectionStream = BoxStream<'static, Disconnection>;

/// The primitives a platform bluetooth stack has to provide.
///
/// Implementations deliver their streams from whatever task or thread the platform uses; nothing
/// here assumes events arrive on the caller's task.
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Starts scanning. `services` is a hint that the platform may use to filter in hardware.
    async fn start_scan(&self, services: Vec<Uuid>) -> Result<AdvertisementStream, AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    async fn connect(&self, id: &PeripheralId) -> Result<(), AdapterError>;

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), AdapterError>;

    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Service>, AdapterError>;

    async fn read_characteristic(&self, id: &PeripheralId, characteristic: Uuid) -> Result<Vec<u8>, AdapterError>;

    async fn write_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), AdapterError>;

    async fn subscribe_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<NotificationStream, AdapterError>;

    /// Disconnects reported by the platform, for any peripheral. Disconnects requested through
    /// [`BleAdapter::disconnect`] may show up here as well.
    async fn disconnections(&self) -> Result<DisconnectionStream, AdapterError>;
}
