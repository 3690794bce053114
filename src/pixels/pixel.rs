use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;
use futures::channel::oneshot;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::ble::adapter::{BleAdapter, NotificationStream};
use crate::ble::peripheral::Peripheral;
use crate::ble::types::{ConnectionEvent, ConnectionEventReason};
use crate::error::{BleError, DecodeError};
use crate::guarded_list::{CallbackHandle, GuardedCallbackList};
use crate::pixels::constants::{
    ALL_FACES_MASK, IDENTIFY_TIMEOUT, PIXELS_NOTIFY_CHARACTERISTIC, PIXELS_WRITE_CHARACTERISTIC, REQUEST_TIMEOUT,
};
use crate::pixels::info::{PixelInfo, ScannedPixel, ScannedPixelData};
use crate::pixels::messages::{BatteryLevel, Blink, MessageType, PixelMessage, RequestRssi};
use crate::pixels::types::{PixelRollState, PixelStatus, TelemetryRequestMode};

/// What the die sent: a decoded message, or a payload that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
    Message(PixelMessage),
    Malformed { payload: Vec<u8>, error: DecodeError },
}

pub type MessageCallback = Arc<dyn Fn(&MessageEvent) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(PixelStatus) + Send + Sync>;

/// Notified about changes of a connected die. Called from the task that received the change, so
/// implementations should return quickly.
pub trait PixelDelegate: Send + Sync {
    fn on_status_changed(&self, _pixel: &dyn PixelInfo, _status: PixelStatus) {}

    fn on_firmware_date_changed(&self, _pixel: &dyn PixelInfo, _date: SystemTime) {}

    fn on_rssi_changed(&self, _pixel: &dyn PixelInfo, _rssi: i16) {}

    fn on_battery_level_changed(&self, _pixel: &dyn PixelInfo, _level: u8) {}

    fn on_charging_state_changed(&self, _pixel: &dyn PixelInfo, _charging: bool) {}

    fn on_roll_state_changed(&self, _pixel: &dyn PixelInfo, _state: PixelRollState, _face: u8) {}

    /// The die came to rest on `face`.
    fn on_rolled(&self, _pixel: &dyn PixelInfo, _face: u8) {}

    fn on_message_received(&self, _pixel: &dyn PixelInfo, _message: &PixelMessage) {}
}

#[derive(Debug, Clone)]
pub struct PixelConfig {
    pub identify_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PixelConfig {
    fn default() -> Self {
        PixelConfig {
            identify_timeout: Duration::from_millis(IDENTIFY_TIMEOUT),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
        }
    }
}

impl PixelConfig {
    pub fn with_identify_timeout(mut self, identify_timeout: Duration) -> Self {
        self.identify_timeout = identify_timeout;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlinkParams {
    pub duration: Duration,
    /// 0x00RRGGBB
    pub color: u32,
    pub count: u8,
    /// Between 0 (no fading) and 1 (fade in and out over the whole blink).
    pub fade: f32,
    pub face_mask: u32,
    pub loop_count: u8,
}

impl Default for BlinkParams {
    fn default() -> Self {
        BlinkParams {
            duration: Duration::from_secs(1),
            color: 0x00FF_FFFF,
            count: 1,
            fade: 0.0,
            face_mask: ALL_FACES_MASK,
            loop_count: 0,
        }
    }
}

impl BlinkParams {
    pub fn to_message(&self) -> Blink {
        Blink {
            count: self.count,
            duration_ms: self.duration.as_millis().min(u16::MAX as u128) as u16,
            color: self.color,
            face_mask: self.face_mask,
            fade: (self.fade.clamp(0.0, 1.0) * 255.0).round() as u8,
            loop_count: self.loop_count,
        }
    }
}

enum DataChange {
    FirmwareDate(SystemTime),
    Rssi(i16),
    BatteryLevel(u8),
    Charging(bool),
    RollState(PixelRollState, u8),
    Rolled(u8),
}

struct Waiter {
    id: u64,
    message_type: MessageType,
    sender: oneshot::Sender<PixelMessage>,
}

struct Session {
    status: PixelStatus,
    data: ScannedPixelData,
    /// Oldest first; a response resolves the oldest waiter of its type.
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
    notifications: Option<CancellationToken>,
}

struct PixelInner<A: BleAdapter> {
    peripheral: Peripheral<A>,
    config: PixelConfig,
    delegate: Option<Arc<dyn PixelDelegate>>,
    expected_pixel_id: u32,
    session: Mutex<Session>,
    message_callbacks: GuardedCallbackList<MessageCallback>,
    status_callbacks: GuardedCallbackList<StatusCallback>,
    connection_handle: CallbackHandle,
}

impl<A: BleAdapter> PixelInner<A> {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(self: &Arc<Self>) -> Pixel<A> {
        Pixel { inner: Arc::clone(self) }
    }

    /// Moves to `status` if `allowed` accepts the current one. Returns false if it did not.
    fn change_status<F>(self: &Arc<Self>, allowed: F, status: PixelStatus) -> bool
    where
        F: Fn(PixelStatus) -> bool,
    {
        {
            let mut session = self.session();
            if !allowed(session.status) {
                return false;
            }
            if session.status == status {
                return true;
            }
            session.status = status;

            if matches!(status, PixelStatus::Disconnecting | PixelStatus::Disconnected) {
                // dropping the senders fails every pending request with Canceled
                session.waiters.clear();
                if let Some(notifications) = session.notifications.take() {
                    notifications.cancel();
                }
            }
        }

        info!("Pixel {} status: {:?}", self.peripheral.id(), status);
        self.status_callbacks.invoke_all(|callback| callback(status));
        if let Some(delegate) = &self.delegate {
            delegate.on_status_changed(&self.handle(), status);
        }
        true
    }

    fn on_connection_event(self: &Arc<Self>, event: ConnectionEvent, _reason: ConnectionEventReason) {
        match event {
            ConnectionEvent::Connecting => {
                self.change_status(|current| current == PixelStatus::Disconnected, PixelStatus::Connecting);
            },
            ConnectionEvent::Disconnecting => {
                self.change_status(|_| true, PixelStatus::Disconnecting);
            },
            ConnectionEvent::FailedToConnect | ConnectionEvent::Disconnected => {
                self.change_status(|_| true, PixelStatus::Disconnected);
            },
            // identification decides when the die is ready
            ConnectionEvent::Connected | ConnectionEvent::Ready => {},
        }
    }

    fn start_notifications(self: &Arc<Self>, mut stream: NotificationStream) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.session().notifications.replace(cancel.clone()) {
            previous.cancel();
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    next = stream.next() => match (next, weak.upgrade()) {
                        (Some(payload), Some(inner)) => inner.on_notification(payload),
                        _ => break 'mainloop,
                    }
                }
            }
            debug!("Notification task stopped");
        });
    }

    fn on_notification(self: &Arc<Self>, payload: Vec<u8>) {
        let event = match PixelMessage::decode(&payload) {
            Ok(message) => {
                debug!("Pixel {} sent {:?}", self.peripheral.id(), message.message_type());
                self.process_message(&message);
                self.resolve_waiter(&message);
                MessageEvent::Message(message)
            },
            Err(error) => {
                warn!("Malformed message from pixel {}: {} ({:?})", self.peripheral.id(), error, payload);
                MessageEvent::Malformed { payload, error }
            },
        };

        self.message_callbacks.invoke_all(|callback| callback(&event));
    }

    /// Updates the live attributes, then tells the delegate what changed.
    fn process_message(self: &Arc<Self>, message: &PixelMessage) {
        let mut changes = vec![];
        {
            let mut session = self.session();
            let data = &mut session.data;

            match message {
                // another die answering must not overwrite the record of the one we expect
                PixelMessage::IAmADie(identity) if data.pixel_id == 0 || data.pixel_id == identity.pixel_id => {
                    let before = data.clone();
                    data.apply_identity(identity);
                    if before.build_timestamp != data.build_timestamp {
                        changes.push(DataChange::FirmwareDate(ScannedPixel::new(data.clone()).firmware_date()));
                    }
                    if before.battery_level != data.battery_level {
                        changes.push(DataChange::BatteryLevel(data.battery_level));
                    }
                    if before.is_charging != data.is_charging {
                        changes.push(DataChange::Charging(data.is_charging));
                    }
                    // the roll state is stored but not reported, it did not come from a roll
                },
                PixelMessage::IAmADie(identity) => {
                    warn!(
                        "Pixel {} answered as {:08x}, expected {:08x}",
                        self.peripheral.id(),
                        identity.pixel_id,
                        data.pixel_id
                    );
                },
                PixelMessage::RollState(roll) => {
                    let face = roll.face_index.saturating_add(1);
                    data.roll_state = roll.state;
                    data.current_face = face;
                    changes.push(DataChange::RollState(roll.state, face));
                    if roll.state == PixelRollState::OnFace {
                        changes.push(DataChange::Rolled(face));
                    }
                },
                PixelMessage::BatteryLevel(battery) => {
                    if data.battery_level != battery.level_percent {
                        data.battery_level = battery.level_percent;
                        changes.push(DataChange::BatteryLevel(battery.level_percent));
                    }
                    let charging = battery.state.is_charging_or_done();
                    if data.is_charging != charging {
                        data.is_charging = charging;
                        changes.push(DataChange::Charging(charging));
                    }
                },
                PixelMessage::Rssi(rssi) => {
                    let rssi = *rssi as i16;
                    if data.rssi != rssi {
                        data.rssi = rssi;
                        changes.push(DataChange::Rssi(rssi));
                    }
                },
                _ => {},
            }
        }

        let delegate = match &self.delegate {
            Some(delegate) => delegate,
            None => return,
        };
        let pixel = self.handle();
        for change in changes {
            match change {
                DataChange::FirmwareDate(date) => delegate.on_firmware_date_changed(&pixel, date),
                DataChange::Rssi(rssi) => delegate.on_rssi_changed(&pixel, rssi),
                DataChange::BatteryLevel(level) => delegate.on_battery_level_changed(&pixel, level),
                DataChange::Charging(charging) => delegate.on_charging_state_changed(&pixel, charging),
                DataChange::RollState(state, face) => delegate.on_roll_state_changed(&pixel, state, face),
                DataChange::Rolled(face) => delegate.on_rolled(&pixel, face),
            }
        }
        delegate.on_message_received(&pixel, message);
    }

    fn register_waiter(&self, message_type: MessageType) -> (u64, oneshot::Receiver<PixelMessage>) {
        let (sender, receiver) = oneshot::channel();
        let mut session = self.session();
        session.next_waiter_id += 1;
        let id = session.next_waiter_id;
        session.waiters.push(Waiter { id, message_type, sender });
        (id, receiver)
    }

    fn remove_waiter(&self, id: u64) {
        self.session().waiters.retain(|waiter| waiter.id != id);
    }

    fn resolve_waiter(&self, message: &PixelMessage) {
        let message_type = message.message_type();
        loop {
            let waiter = {
                let mut session = self.session();
                match session.waiters.iter().position(|w| w.message_type == message_type) {
                    Some(index) => session.waiters.remove(index),
                    None => return,
                }
            };

            // a waiter whose caller already gave up does not consume the response
            if waiter.sender.send(*message).is_ok() {
                return;
            }
        }
    }

    async fn send(&self, message: &PixelMessage, with_response: bool) -> Result<(), BleError> {
        debug!("Sending {:?} to pixel {}", message.message_type(), self.peripheral.id());
        self.peripheral
            .write_characteristic(PIXELS_WRITE_CHARACTERISTIC, &message.encode(), with_response)
            .await
    }

    async fn send_and_wait(
        &self,
        message: &PixelMessage,
        response_type: MessageType,
        timeout_duration: Duration,
    ) -> Result<PixelMessage, BleError> {
        // registered before sending so a quick response is not missed
        let (waiter_id, receiver) = self.register_waiter(response_type);

        let result = async {
            self.send(message, true).await?;
            match timeout(timeout_duration, receiver).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(oneshot::Canceled)) => Err(BleError::Canceled),
                Err(_) => {
                    warn!("No {:?} from pixel {} in time", response_type, self.peripheral.id());
                    Err(BleError::Timeout)
                },
            }
        }
        .await;

        self.remove_waiter(waiter_id);
        result
    }

    async fn identify(self: &Arc<Self>) -> Result<(), BleError> {
        if self.peripheral.characteristic(PIXELS_WRITE_CHARACTERISTIC).is_none() {
            return Err(BleError::MissingCharacteristic(PIXELS_WRITE_CHARACTERISTIC));
        }

        let notifications = self.peripheral.subscribe_characteristic(PIXELS_NOTIFY_CHARACTERISTIC).await?;
        self.start_notifications(notifications);

        let response = self
            .send_and_wait(&PixelMessage::Bare(MessageType::WhoAreYou), MessageType::IAmADie, self.config.identify_timeout)
            .await?;

        match response {
            PixelMessage::IAmADie(identity) => {
                if self.expected_pixel_id != 0 && self.expected_pixel_id != identity.pixel_id {
                    return Err(BleError::IdentificationMismatch {
                        expected: self.expected_pixel_id,
                        actual: identity.pixel_id,
                    });
                }
                Ok(())
            },
            other => Err(BleError::Unknown(format!("unexpected response {:?}", other.message_type()))),
        }
    }
}

impl<A: BleAdapter> Drop for PixelInner<A> {
    fn drop(&mut self) {
        self.peripheral.remove_connection_callback(self.connection_handle);
        let session = self.session.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(notifications) = session.notifications.take() {
            notifications.cancel();
        }
    }
}

/// Session with a connected die. Clones share the same session.
pub struct Pixel<A: BleAdapter> {
    inner: Arc<PixelInner<A>>,
}

impl<A: BleAdapter> Clone for Pixel<A> {
    fn clone(&self) -> Self {
        Pixel { inner: Arc::clone(&self.inner) }
    }
}

impl<A: BleAdapter> PixelInfo for Pixel<A> {
    fn data(&self) -> ScannedPixelData {
        self.inner.session().data.clone()
    }
}

impl<A: BleAdapter> Pixel<A> {
    pub fn new(
        peripheral: Peripheral<A>,
        scanned: &ScannedPixel,
        config: PixelConfig,
        delegate: Option<Arc<dyn PixelDelegate>>,
    ) -> Self {
        let data = scanned.data();
        let status = if peripheral.state() == ConnectionEvent::Disconnected {
            PixelStatus::Disconnected
        } else {
            // someone else drives this peripheral; wait for it to disconnect
            PixelStatus::Disconnecting
        };

        let inner = Arc::new_cyclic(|weak: &Weak<PixelInner<A>>| {
            let weak = weak.clone();
            let connection_handle = peripheral.on_connection_event(move |event, reason| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_connection_event(event, reason);
                }
            });

            PixelInner {
                peripheral,
                config,
                delegate,
                expected_pixel_id: data.pixel_id,
                session: Mutex::new(Session {
                    status,
                    data,
                    waiters: vec![],
                    next_waiter_id: 0,
                    notifications: None,
                }),
                message_callbacks: GuardedCallbackList::new(),
                status_callbacks: GuardedCallbackList::new(),
                connection_handle,
            }
        });

        Pixel { inner }
    }

    pub fn peripheral(&self) -> &Peripheral<A> {
        &self.inner.peripheral
    }

    pub fn status(&self) -> PixelStatus {
        self.inner.session().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == PixelStatus::Ready
    }

    /// Connects, subscribes to the die's messages and checks that it is the die that was scanned.
    pub async fn connect(&self, timeout_duration: Duration) -> Result<(), BleError> {
        let inner = &self.inner;
        match self.status() {
            PixelStatus::Ready => return Ok(()),
            PixelStatus::Disconnected => {},
            _ => return Err(BleError::Busy),
        }
        if !inner.change_status(|current| current == PixelStatus::Disconnected, PixelStatus::Connecting) {
            return Err(BleError::Busy);
        }

        if let Err(err) = inner.peripheral.connect(timeout_duration).await {
            inner.change_status(|current| current == PixelStatus::Connecting, PixelStatus::Disconnected);
            return Err(err);
        }

        if !inner.change_status(|current| current == PixelStatus::Connecting, PixelStatus::Identifying) {
            return Err(BleError::Canceled);
        }

        match inner.identify().await {
            Ok(()) => {
                if inner.change_status(|current| current == PixelStatus::Identifying, PixelStatus::Ready) {
                    info!("Pixel {} ({:08x}) ready", self.name(), self.pixel_id());
                    Ok(())
                } else {
                    Err(BleError::Canceled)
                }
            },
            Err(err) => {
                warn!("Identifying pixel {} failed: {}", inner.peripheral.id(), err);
                inner.peripheral.disconnect().await;
                Err(err)
            },
        }
    }

    pub async fn disconnect(&self) {
        self.inner.peripheral.disconnect().await;
    }

    pub fn on_message<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        self.inner.message_callbacks.add(Arc::new(callback))
    }

    pub fn remove_message_callback(&self, handle: CallbackHandle) -> bool {
        self.inner.message_callbacks.remove(handle)
    }

    pub fn on_status_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(PixelStatus) + Send + Sync + 'static,
    {
        self.inner.status_callbacks.add(Arc::new(callback))
    }

    pub fn remove_status_callback(&self, handle: CallbackHandle) -> bool {
        self.inner.status_callbacks.remove(handle)
    }

    /// Sends a message and waits for the write to be acknowledged, not for a response.
    pub async fn send_message(&self, message: &PixelMessage) -> Result<(), BleError> {
        self.inner.send(message, true).await
    }

    /// Sends a message and waits for the next message of `response_type`. A response that arrives
    /// after `timeout` does not resolve any later request.
    pub async fn send_and_wait_for_response(
        &self,
        message: &PixelMessage,
        response_type: MessageType,
        timeout_duration: Duration,
    ) -> Result<PixelMessage, BleError> {
        self.inner.send_and_wait(message, response_type, timeout_duration).await
    }

    pub async fn request_rssi(&self, timeout_duration: Duration) -> Result<i8, BleError> {
        let request = PixelMessage::RequestRssi(RequestRssi {
            request_mode: TelemetryRequestMode::Once,
            min_interval_ms: 0,
        });

        match self.send_and_wait_for_response(&request, MessageType::Rssi, timeout_duration).await? {
            PixelMessage::Rssi(rssi) => Ok(rssi),
            other => Err(BleError::Unknown(format!("unexpected response {:?}", other.message_type()))),
        }
    }

    pub async fn request_battery_level(&self, timeout_duration: Duration) -> Result<BatteryLevel, BleError> {
        let request = PixelMessage::Bare(MessageType::RequestBatteryLevel);

        match self.send_and_wait_for_response(&request, MessageType::BatteryLevel, timeout_duration).await? {
            PixelMessage::BatteryLevel(level) => Ok(level),
            other => Err(BleError::Unknown(format!("unexpected response {:?}", other.message_type()))),
        }
    }

    /// Blinks the die's LEDs and waits for the die to acknowledge.
    pub async fn blink(&self, params: &BlinkParams, timeout_duration: Duration) -> Result<(), BleError> {
        let request = PixelMessage::Blink(params.to_message());
        self.send_and_wait_for_response(&request, MessageType::BlinkAck, timeout_duration).await?;
        Ok(())
    }

    /// Asks the die to send its RSSI every `min_interval` (or to stop). The values arrive as
    /// `Rssi` messages.
    pub async fn report_rssi(&self, activate: bool, min_interval: Duration) -> Result<(), BleError> {
        let request = PixelMessage::RequestRssi(RequestRssi {
            request_mode: if activate { TelemetryRequestMode::Automatic } else { TelemetryRequestMode::Off },
            min_interval_ms: min_interval.as_millis().min(u16::MAX as u128) as u16,
        });
        self.send_message(&request).await
    }

    /// Puts the die to sleep. It will drop the connection without answering.
    pub async fn turn_off(&self) -> Result<(), BleError> {
        self.inner.send(&PixelMessage::Bare(MessageType::Sleep), false).await
    }

    pub fn config(&self) -> &PixelConfig {
        &self.inner.config
    }
}
