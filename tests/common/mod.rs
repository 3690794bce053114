#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use uuid::Uuid;

use pixels_ble::ble::adapter::{AdvertisementStream, BleAdapter, DisconnectionStream, NotificationStream};
use pixels_ble::ble::advertisement::AdvertisementData;
use pixels_ble::ble::types::{
    Characteristic, CharacteristicProperty, ConnectionEventReason, Disconnection, PeripheralId, RawAdvertisement,
    Service,
};
use pixels_ble::error::AdapterError;
use pixels_ble::pixels::constants::{PIXELS_NOTIFY_CHARACTERISTIC, PIXELS_SERVICE, PIXELS_WRITE_CHARACTERISTIC};
use pixels_ble::pixels::info::ScannedPixelData;
use pixels_ble::pixels::messages::{BatteryLevel, IAmADie, MessageType, PixelMessage};
use pixels_ble::pixels::types::{PixelBatteryState, PixelDesignAndColor, PixelRollState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail,
    Hang,
}

/// Turns a written payload into the notifications the device sends back.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

struct MockState {
    connect_behavior: ConnectBehavior,
    connect_delay: Duration,
    services: Vec<Service>,
    scan_sender: Option<UnboundedSender<RawAdvertisement>>,
    scan_starts: usize,
    scan_stops: usize,
    connects: usize,
    disconnects: usize,
    disconnection_senders: Vec<UnboundedSender<Disconnection>>,
    notify_senders: Vec<UnboundedSender<Vec<u8>>>,
    written: Vec<(Uuid, Vec<u8>, bool)>,
    write_hangs: bool,
    disconnections_hang: bool,
    responder: Option<Responder>,
}

/// Scripted adapter: tests decide how connects behave and push advertisements, notifications
/// and link losses by hand.
pub struct MockAdapter {
    state: Mutex<MockState>,
}

impl MockAdapter {
    pub fn new() -> Self {
        MockAdapter {
            state: Mutex::new(MockState {
                connect_behavior: ConnectBehavior::Succeed,
                connect_delay: Duration::from_millis(10),
                services: pixel_services(),
                scan_sender: None,
                scan_starts: 0,
                scan_stops: 0,
                connects: 0,
                disconnects: 0,
                disconnection_senders: vec![],
                notify_senders: vec![],
                written: vec![],
                write_hangs: false,
                disconnections_hang: false,
                responder: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state().connect_behavior = behavior;
    }

    pub fn set_services(&self, services: Vec<Service>) {
        self.state().services = services;
    }

    pub fn set_write_hangs(&self, hangs: bool) {
        self.state().write_hangs = hangs;
    }

    pub fn set_disconnections_hang(&self, hangs: bool) {
        self.state().disconnections_hang = hangs;
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        self.state().responder = Some(Arc::new(responder));
    }

    /// Delivers an advertisement to the running scan. Returns false if nobody is scanning.
    pub fn advertise(&self, advertisement: RawAdvertisement) -> bool {
        match &self.state().scan_sender {
            Some(sender) => sender.unbounded_send(advertisement).is_ok(),
            None => false,
        }
    }

    pub fn notify(&self, payload: Vec<u8>) {
        let mut state = self.state();
        state.notify_senders.retain(|sender| sender.unbounded_send(payload.clone()).is_ok());
    }

    pub fn drop_link(&self, id: &PeripheralId, reason: ConnectionEventReason) {
        let mut state = self.state();
        let disconnection = Disconnection { id: id.clone(), reason };
        state.disconnection_senders.retain(|sender| sender.unbounded_send(disconnection.clone()).is_ok());
        state.notify_senders.clear();
    }

    pub fn written(&self) -> Vec<(Uuid, Vec<u8>, bool)> {
        self.state().written.clone()
    }

    pub fn scan_starts(&self) -> usize {
        self.state().scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        self.state().scan_stops
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn start_scan(&self, _services: Vec<Uuid>) -> Result<AdvertisementStream, AdapterError> {
        let (sender, receiver) = unbounded();
        let mut state = self.state();
        state.scan_starts += 1;
        state.scan_sender = Some(sender);
        Ok(receiver.boxed())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        let mut state = self.state();
        state.scan_stops += 1;
        state.scan_sender = None;
        Ok(())
    }

    async fn connect(&self, _id: &PeripheralId) -> Result<(), AdapterError> {
        let (behavior, delay) = {
            let mut state = self.state();
            state.connects += 1;
            (state.connect_behavior, state.connect_delay)
        };

        tokio::time::sleep(delay).await;
        match behavior {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Fail => Err(AdapterError::Other("connection refused".to_string())),
            ConnectBehavior::Hang => futures::future::pending().await,
        }
    }

    async fn disconnect(&self, _id: &PeripheralId) -> Result<(), AdapterError> {
        let mut state = self.state();
        state.disconnects += 1;
        state.notify_senders.clear();
        Ok(())
    }

    async fn discover_services(&self, _id: &PeripheralId) -> Result<Vec<Service>, AdapterError> {
        Ok(self.state().services.clone())
    }

    async fn read_characteristic(&self, _id: &PeripheralId, _characteristic: Uuid) -> Result<Vec<u8>, AdapterError> {
        Ok(vec![])
    }

    async fn write_characteristic(
        &self,
        _id: &PeripheralId,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), AdapterError> {
        let (hangs, responses) = {
            let mut state = self.state();
            state.written.push((characteristic, data.to_vec(), with_response));
            let responses = state.responder.as_ref().map(|respond| respond(data)).unwrap_or_default();
            (state.write_hangs, responses)
        };

        if hangs {
            return futures::future::pending().await;
        }

        for response in responses {
            self.notify(response);
        }
        Ok(())
    }

    async fn subscribe_characteristic(
        &self,
        _id: &PeripheralId,
        _characteristic: Uuid,
    ) -> Result<NotificationStream, AdapterError> {
        let (sender, receiver) = unbounded();
        self.state().notify_senders.push(sender);
        Ok(receiver.boxed())
    }

    async fn disconnections(&self) -> Result<DisconnectionStream, AdapterError> {
        if self.state().disconnections_hang {
            return futures::future::pending().await;
        }
        let (sender, receiver) = unbounded();
        self.state().disconnection_senders.push(sender);
        Ok(receiver.boxed())
    }
}

pub fn pixel_services() -> Vec<Service> {
    let characteristic = |uuid: Uuid, properties: &[CharacteristicProperty]| Characteristic {
        uuid,
        service_uuid: PIXELS_SERVICE,
        properties: properties.iter().copied().collect::<BTreeSet<_>>(),
    };

    vec![Service {
        uuid: PIXELS_SERVICE,
        primary: true,
        characteristics: vec![
            characteristic(PIXELS_NOTIFY_CHARACTERISTIC, &[CharacteristicProperty::Notify]),
            characteristic(
                PIXELS_WRITE_CHARACTERISTIC,
                &[CharacteristicProperty::Write, CharacteristicProperty::WriteWithoutResponse],
            ),
        ],
    }]
}

pub fn pixel_data(id: &str, pixel_id: u32) -> ScannedPixelData {
    ScannedPixelData {
        system_id: PeripheralId::new(id),
        pixel_id,
        name: format!("Pixel{:08X}", pixel_id),
        led_count: 20,
        design_and_color: PixelDesignAndColor::OnyxBlack,
        roll_state: PixelRollState::OnFace,
        current_face: 20,
        battery_level: 81,
        is_charging: false,
        build_timestamp: 1_650_000_000,
        rssi: -62,
    }
}

/// Advertisement as a Pixel sends it, with the scan response folded in.
pub fn pixel_advertisement(data: &ScannedPixelData) -> RawAdvertisement {
    let mut advertisement = AdvertisementData {
        flags: Some(0x06),
        local_name: Some(data.name.clone()),
        services: vec![PIXELS_SERVICE],
        ..Default::default()
    };
    advertisement.manufacturer_data.insert(0xFFFF, data.manufacturer_payload());
    advertisement.service_data.insert(PIXELS_SERVICE, data.service_payload());

    RawAdvertisement {
        id: data.system_id.clone(),
        payload: advertisement.encode(),
        rssi: data.rssi,
    }
}

pub fn i_am_a_die(pixel_id: u32) -> IAmADie {
    IAmADie {
        led_count: 20,
        design_and_color: PixelDesignAndColor::OnyxBlack,
        data_set_hash: 0x1234_5678,
        pixel_id,
        available_flash: 4096,
        build_timestamp: 1_660_000_000,
        roll_state: PixelRollState::OnFace,
        current_face_index: 5,
        battery_level_percent: 64,
        battery_state: PixelBatteryState::Ok,
    }
}

/// Answers like firmware does: identity, RSSI, battery level and blink acknowledgements.
pub fn pixel_responder(pixel_id: u32, rssi: i8) -> impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static {
    move |data: &[u8]| {
        let response = match PixelMessage::decode(data) {
            Ok(PixelMessage::Bare(MessageType::WhoAreYou)) => PixelMessage::IAmADie(i_am_a_die(pixel_id)),
            Ok(PixelMessage::RequestRssi(_)) => PixelMessage::Rssi(rssi),
            Ok(PixelMessage::Bare(MessageType::RequestBatteryLevel)) => PixelMessage::BatteryLevel(BatteryLevel {
                level_percent: 57,
                state: PixelBatteryState::Charging,
            }),
            Ok(PixelMessage::Blink(_)) => PixelMessage::Bare(MessageType::BlinkAck),
            _ => return vec![],
        };
        vec![response.encode()]
    }
}

/// Polls `condition` while letting spawned tasks run. Returns its final value.
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
