//! Connection lifecycle of a single peripheral.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Ready -> Disconnecting -> Disconnected
//!                     |             |          |
//!                     +-------------+----------|--> FailedToConnect -> Disconnected
//!                                   |          |
//!                                   +----------+--> Disconnected (link loss)
//! ```
//!
//! Every transition is queued under the state lock and dispatched to the connection callbacks by
//! a single drainer, so callbacks for one peripheral observe transitions in order and never run
//! concurrently with each other.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ble::adapter::{BleAdapter, DisconnectionStream, NotificationStream};
use crate::ble::constants::{DISCONNECT_DEADLINE, OPERATION_TIMEOUT};
use crate::ble::types::{Characteristic, ConnectionEvent, ConnectionEventReason, PeripheralId, Service};
use crate::error::{AdapterError, BleError};
use crate::guarded_list::{CallbackHandle, GuardedCallbackList};

pub type ConnectionCallback = Arc<dyn Fn(ConnectionEvent, ConnectionEventReason) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PeripheralConfig {
    pub operation_timeout: Duration,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        PeripheralConfig {
            operation_timeout: Duration::from_millis(OPERATION_TIMEOUT),
        }
    }
}

impl PeripheralConfig {
    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }
}

struct PeripheralState {
    event: ConnectionEvent,
    /// Incremented by every connect call; stale completions compare against it.
    attempt: u64,
    /// Cancelled when the current attempt ends, for whatever reason.
    cancel: CancellationToken,
    services: Vec<Service>,
    busy: HashSet<Uuid>,
    queue: VecDeque<(ConnectionEvent, ConnectionEventReason)>,
    dispatching: bool,
}

impl PeripheralState {
    fn transition(&mut self, event: ConnectionEvent, reason: ConnectionEventReason) {
        if self.event == event {
            return;
        }
        self.event = event;
        self.queue.push_back((event, reason));
    }

    /// Ends the current attempt: pending operations are cancelled and discovered services dropped.
    fn end_attempt(&mut self) {
        self.cancel.cancel();
        self.services.clear();
        self.busy.clear();
    }
}

struct PeripheralInner<A: BleAdapter> {
    id: PeripheralId,
    adapter: Arc<A>,
    config: PeripheralConfig,
    state: Mutex<PeripheralState>,
    callbacks: GuardedCallbackList<ConnectionCallback>,
}

impl<A: BleAdapter> PeripheralInner<A> {
    fn state(&self) -> MutexGuard<'_, PeripheralState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch_events(&self) {
        {
            let mut state = self.state();
            if state.dispatching {
                // whoever is draining will pick up our events
                return;
            }
            state.dispatching = true;
        }

        loop {
            let (event, reason) = {
                let mut state = self.state();
                match state.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        state.dispatching = false;
                        return;
                    },
                }
            };

            debug!("Peripheral {}: {:?} ({:?})", self.id, event, reason);
            self.callbacks.invoke_all(|callback| callback(event, reason));
        }
    }

    /// True while `attempt` is the current one and has not reached a terminal state.
    fn is_pending(&self, attempt: u64) -> bool {
        let state = self.state();
        state.attempt == attempt && matches!(state.event, ConnectionEvent::Connecting | ConnectionEvent::Connected)
    }

    fn on_disconnection(&self, attempt: u64, reason: ConnectionEventReason) {
        {
            let mut state = self.state();
            if state.attempt != attempt {
                return;
            }
            match state.event {
                ConnectionEvent::Connected | ConnectionEvent::Ready => {
                    warn!("Connection lost to peripheral {} ({:?})", self.id, reason);
                    state.end_attempt();
                    state.transition(ConnectionEvent::Disconnected, reason);
                },
                // the pending connect or its timeout decides the outcome
                _ => return,
            }
        }
        self.dispatch_events();
    }
}

fn watch_disconnections<A: BleAdapter>(
    inner: Weak<PeripheralInner<A>>,
    id: PeripheralId,
    attempt: u64,
    cancel: CancellationToken,
    mut stream: DisconnectionStream,
) {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                next = stream.next() => match next {
                    Some(disconnection) if disconnection.id == id => {
                        if let Some(inner) = inner.upgrade() {
                            let reason = match disconnection.reason {
                                ConnectionEventReason::Success => ConnectionEventReason::LinkLoss,
                                reason => reason,
                            };
                            inner.on_disconnection(attempt, reason);
                        }
                        break 'mainloop;
                    },
                    Some(_) => {},
                    None => {
                        debug!("Disconnection stream ended for peripheral {}", id);
                        break 'mainloop;
                    },
                }
            }
        }
    });
}

/// Releases the per-characteristic busy marker of an operation.
struct OperationGuard<'a, A: BleAdapter> {
    inner: &'a PeripheralInner<A>,
    attempt: u64,
    characteristic: Uuid,
}

impl<'a, A: BleAdapter> Drop for OperationGuard<'a, A> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if state.attempt == self.attempt {
            state.busy.remove(&self.characteristic);
        }
    }
}

/// Handle to the connection of one device. Clones share the same connection.
pub struct Peripheral<A: BleAdapter> {
    inner: Arc<PeripheralInner<A>>,
}

impl<A: BleAdapter> Clone for Peripheral<A> {
    fn clone(&self) -> Self {
        Peripheral { inner: Arc::clone(&self.inner) }
    }
}

impl<A: BleAdapter> Peripheral<A> {
    pub fn new(adapter: Arc<A>, id: PeripheralId, config: PeripheralConfig) -> Self {
        let state = PeripheralState {
            event: ConnectionEvent::Disconnected,
            attempt: 0,
            cancel: CancellationToken::new(),
            services: vec![],
            busy: HashSet::new(),
            queue: VecDeque::new(),
            dispatching: false,
        };

        Peripheral {
            inner: Arc::new(PeripheralInner {
                id,
                adapter,
                config,
                state: Mutex::new(state),
                callbacks: GuardedCallbackList::new(),
            }),
        }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.inner.id
    }

    pub fn state(&self) -> ConnectionEvent {
        self.inner.state().event
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionEvent::Ready
    }

    /// Services found by the last discovery. Empty unless connected.
    pub fn services(&self) -> Vec<Service> {
        self.inner.state().services.clone()
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        let state = self.inner.state();
        state.services.iter().find_map(|s| s.characteristic(uuid)).cloned()
    }

    pub fn on_connection_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionEvent, ConnectionEventReason) + Send + Sync + 'static,
    {
        self.inner.callbacks.add(Arc::new(callback))
    }

    pub fn remove_connection_callback(&self, handle: CallbackHandle) -> bool {
        self.inner.callbacks.remove(handle)
    }

    /// Connects and discovers services. The whole attempt, discovery included, is bounded by
    /// `timeout`.
    pub async fn connect(&self, timeout_duration: Duration) -> Result<(), BleError> {
        let inner = &self.inner;
        let (attempt, cancel) = {
            let mut state = inner.state();
            if state.event != ConnectionEvent::Disconnected {
                return Err(BleError::Busy);
            }
            state.attempt += 1;
            state.cancel = CancellationToken::new();
            state.transition(ConnectionEvent::Connecting, ConnectionEventReason::Success);
            (state.attempt, state.cancel.clone())
        };
        inner.dispatch_events();

        info!("Connecting to peripheral {}...", inner.id);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionEventReason::Canceled),
            result = timeout(timeout_duration, self.establish(attempt, &cancel)) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!("Connecting to peripheral {} took too long", inner.id);
                    Err(ConnectionEventReason::Timeout)
                },
            },
        };

        match outcome {
            Ok(services) => {
                {
                    let mut state = inner.state();
                    if state.attempt != attempt || state.event != ConnectionEvent::Connected {
                        return Err(BleError::Canceled);
                    }
                    state.services = services;
                    state.transition(ConnectionEvent::Ready, ConnectionEventReason::Success);
                }
                inner.dispatch_events();
                info!("Peripheral {} ready", inner.id);
                Ok(())
            },
            Err(reason) => {
                if !inner.is_pending(attempt) {
                    // superseded by disconnect() or link loss, which reported the outcome
                    return Err(BleError::Canceled);
                }
                inner.state().end_attempt();

                // cleaned up before Disconnected is reported, so it can not hit a new attempt
                warn!("Connecting to peripheral {} failed: {:?}", inner.id, reason);
                tokio::select! {
                    _ = sleep(Duration::from_millis(DISCONNECT_DEADLINE)) => {
                        debug!("Cleaning up failed connection to {} took too long", inner.id);
                    }
                    result = inner.adapter.disconnect(&inner.id) => {
                        if let Err(err) = result {
                            debug!("Cleaning up failed connection to {}: {}", inner.id, err);
                        }
                    }
                };

                let failed = {
                    let mut state = inner.state();
                    let pending = state.attempt == attempt
                        && matches!(state.event, ConnectionEvent::Connecting | ConnectionEvent::Connected);
                    if pending {
                        state.transition(ConnectionEvent::FailedToConnect, reason);
                        state.transition(ConnectionEvent::Disconnected, reason);
                    }
                    pending
                };
                inner.dispatch_events();

                if !failed {
                    return Err(BleError::Canceled);
                }
                Err(BleError::from_reason(reason))
            },
        }
    }

    async fn establish(&self, attempt: u64, cancel: &CancellationToken) -> Result<Vec<Service>, ConnectionEventReason> {
        let inner = &self.inner;
        match inner.adapter.disconnections().await {
            Ok(stream) => watch_disconnections(Arc::downgrade(inner), inner.id.clone(), attempt, cancel.clone(), stream),
            Err(err) => warn!("Can not watch for link loss of peripheral {}: {}", inner.id, err),
        }

        inner.adapter.connect(&inner.id).await.map_err(|err| {
            warn!("Adapter failed to connect {}: {}", inner.id, err);
            err.reason()
        })?;

        {
            let mut state = inner.state();
            if state.attempt != attempt || state.event != ConnectionEvent::Connecting {
                return Err(ConnectionEventReason::Canceled);
            }
            state.transition(ConnectionEvent::Connected, ConnectionEventReason::Success);
        }
        inner.dispatch_events();

        info!("Connected; Discovering services of {}...", inner.id);
        inner.adapter.discover_services(&inner.id).await.map_err(|err| {
            warn!("Service discovery on {} failed: {}", inner.id, err);
            err.reason()
        })
    }

    /// Disconnects, cancelling a pending connect and any pending operation. Returns once the
    /// peripheral is `Disconnected`; calling it again meanwhile is a no-op.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let (attempt, reason) = {
            let mut state = inner.state();
            let reason = match state.event {
                ConnectionEvent::Disconnected | ConnectionEvent::Disconnecting | ConnectionEvent::FailedToConnect => return,
                ConnectionEvent::Connecting | ConnectionEvent::Connected => ConnectionEventReason::Canceled,
                ConnectionEvent::Ready => ConnectionEventReason::Success,
            };
            state.end_attempt();
            state.transition(ConnectionEvent::Disconnecting, reason);
            (state.attempt, reason)
        };
        inner.dispatch_events();

        info!("Disconnecting from peripheral {}", inner.id);
        tokio::select! {
            _ = sleep(Duration::from_millis(DISCONNECT_DEADLINE)) => {
                warn!("Disconnecting from peripheral {} took too long", inner.id);
            }
            result = inner.adapter.disconnect(&inner.id) => {
                if let Err(err) = result {
                    warn!("Adapter failed to disconnect {}: {}", inner.id, err);
                }
            }
        };

        {
            let mut state = inner.state();
            if state.attempt == attempt && state.event == ConnectionEvent::Disconnecting {
                state.transition(ConnectionEvent::Disconnected, reason);
            }
        }
        inner.dispatch_events();
    }

    fn begin_operation(&self, characteristic: Uuid) -> Result<(OperationGuard<'_, A>, CancellationToken), BleError> {
        let mut state = self.inner.state();
        if state.event != ConnectionEvent::Ready {
            return Err(BleError::NotConnected);
        }
        if !state.services.iter().any(|s| s.characteristic(characteristic).is_some()) {
            return Err(BleError::MissingCharacteristic(characteristic));
        }
        if !state.busy.insert(characteristic) {
            return Err(BleError::Busy);
        }

        let guard = OperationGuard {
            inner: &self.inner,
            attempt: state.attempt,
            characteristic,
        };
        Ok((guard, state.cancel.clone()))
    }

    async fn run_operation<T, F>(&self, cancel: CancellationToken, operation: F) -> Result<T, BleError>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(BleError::Canceled),
            result = timeout(self.inner.config.operation_timeout, operation) => match result {
                Ok(result) => result.map_err(BleError::from),
                Err(_) => Err(BleError::Timeout),
            },
        }
    }

    pub async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        let (_guard, cancel) = self.begin_operation(characteristic)?;
        let inner = &self.inner;
        self.run_operation(cancel, inner.adapter.read_characteristic(&inner.id, characteristic)).await
    }

    pub async fn write_characteristic(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<(), BleError> {
        let (_guard, cancel) = self.begin_operation(characteristic)?;
        let inner = &self.inner;
        self.run_operation(cancel, inner.adapter.write_characteristic(&inner.id, characteristic, data, with_response)).await
    }

    /// Subscribes to notifications. The stream ends when the attempt that created it ends.
    pub async fn subscribe_characteristic(&self, characteristic: Uuid) -> Result<NotificationStream, BleError> {
        let (_guard, cancel) = self.begin_operation(characteristic)?;
        let inner = &self.inner;
        info!("Subscribing to characteristic {} of {}", characteristic, inner.id);
        let stream = self
            .run_operation(cancel.clone(), inner.adapter.subscribe_characteristic(&inner.id, characteristic))
            .await?;
        Ok(stream.take_until(cancel.cancelled_owned()).boxed())
    }
}
