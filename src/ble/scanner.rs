use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;
use futures::StreamExt;
use indexmap::IndexMap;
use indexmap::map::Entry;
use log::{debug, info, trace, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ble::adapter::{AdvertisementStream, BleAdapter};
use crate::ble::advertisement::AdvertisementData;
use crate::ble::types::{PeripheralId, RawAdvertisement};
use crate::error::BleError;
use crate::guarded_list::{CallbackHandle, GuardedCallbackList};

/// Predicate deciding which advertisements a [`Scanner`] records.
#[derive(Clone)]
pub enum ScanFilter {
    NamePrefix(String),
    Service(Uuid),
    /// Manufacturer specific data, optionally for one company, starting with `prefix`.
    ManufacturerData { company_id: Option<u16>, prefix: Vec<u8> },
    All(Vec<ScanFilter>),
    Any(Vec<ScanFilter>),
    Custom(Arc<dyn Fn(&AdvertisementData) -> bool + Send + Sync>),
}

impl ScanFilter {
    pub fn matches(&self, advertisement: &AdvertisementData) -> bool {
        match self {
            ScanFilter::NamePrefix(prefix) => advertisement
                .local_name
                .as_deref()
                .map_or(false, |name| name.starts_with(prefix.as_str())),
            ScanFilter::Service(uuid) => advertisement.has_service(uuid),
            ScanFilter::ManufacturerData { company_id, prefix } => {
                advertisement.manufacturer_data.iter().any(|(id, data)| {
                    company_id.map_or(true, |wanted| wanted == *id) && data.starts_with(prefix)
                })
            },
            ScanFilter::All(filters) => filters.iter().all(|f| f.matches(advertisement)),
            ScanFilter::Any(filters) => filters.iter().any(|f| f.matches(advertisement)),
            ScanFilter::Custom(predicate) => predicate(advertisement),
        }
    }

    /// Service UUIDs the adapter may filter on. Empty means the adapter must report everything.
    pub fn service_hint(&self) -> Vec<Uuid> {
        match self {
            ScanFilter::Service(uuid) => vec![*uuid],
            ScanFilter::All(filters) => {
                let mut services = vec![];
                for filter in filters {
                    for uuid in filter.service_hint() {
                        if !services.contains(&uuid) {
                            services.push(uuid);
                        }
                    }
                }
                services
            },
            ScanFilter::Any(filters) => {
                let mut services = vec![];
                for filter in filters {
                    let hint = filter.service_hint();
                    // a branch without a service restriction means anything may match
                    if hint.is_empty() {
                        return vec![];
                    }
                    services.extend(hint);
                }
                services
            },
            _ => vec![],
        }
    }
}

impl fmt::Debug for ScanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFilter::NamePrefix(prefix) => f.debug_tuple("NamePrefix").field(prefix).finish(),
            ScanFilter::Service(uuid) => f.debug_tuple("Service").field(uuid).finish(),
            ScanFilter::ManufacturerData { company_id, prefix } => f
                .debug_struct("ManufacturerData")
                .field("company_id", company_id)
                .field("prefix", prefix)
                .finish(),
            ScanFilter::All(filters) => f.debug_tuple("All").field(filters).finish(),
            ScanFilter::Any(filters) => f.debug_tuple("Any").field(filters).finish(),
            ScanFilter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedPeripheral {
    pub id: PeripheralId,
    pub advertisement: AdvertisementData,
    pub rssi: i16,
    pub last_seen: SystemTime,
}

impl ScannedPeripheral {
    pub fn name(&self) -> Option<&str> {
        self.advertisement.local_name.as_deref()
    }
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Discovered(ScannedPeripheral),
    Updated(ScannedPeripheral),
}

impl ScanEvent {
    pub fn peripheral(&self) -> &ScannedPeripheral {
        match self {
            ScanEvent::Discovered(peripheral) | ScanEvent::Updated(peripheral) => peripheral,
        }
    }
}

pub type ScanCallback = Arc<dyn Fn(&ScanEvent) + Send + Sync>;

struct ScanSession {
    generation: u64,
    cancel: CancellationToken,
}

pub(crate) struct ScannerShared {
    peripherals: Mutex<IndexMap<PeripheralId, ScannedPeripheral>>,
    filter: Mutex<Option<ScanFilter>>,
    session: Mutex<Option<ScanSession>>,
    generation: AtomicU64,
    callbacks: GuardedCallbackList<ScanCallback>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScannerShared {
    fn new() -> Self {
        ScannerShared {
            peripherals: Mutex::new(IndexMap::new()),
            filter: Mutex::new(None),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            callbacks: GuardedCallbackList::new(),
        }
    }

    fn end_session(&self, generation: u64) {
        let mut session = lock(&self.session);
        if session.as_ref().map_or(false, |s| s.generation == generation) {
            *session = None;
        }
    }

    pub(crate) fn process_advertisement(&self, raw: RawAdvertisement) {
        let advertisement = AdvertisementData::parse(&raw.payload);

        if let Some(filter) = lock(&self.filter).as_ref() {
            if !filter.matches(&advertisement) {
                trace!("Advertisement from {} rejected by filter", raw.id);
                return;
            }
        }

        let event = {
            let mut peripherals = lock(&self.peripherals);
            match peripherals.entry(raw.id) {
                Entry::Occupied(mut entry) => {
                    let peripheral = entry.get_mut();
                    peripheral.advertisement = advertisement;
                    peripheral.rssi = raw.rssi;
                    peripheral.last_seen = SystemTime::now();
                    ScanEvent::Updated(peripheral.clone())
                },
                Entry::Vacant(entry) => {
                    let id = entry.key().clone();
                    let peripheral = entry.insert(ScannedPeripheral {
                        id,
                        advertisement,
                        rssi: raw.rssi,
                        last_seen: SystemTime::now(),
                    });
                    debug!("Discovered peripheral {} {:?}", peripheral.id, peripheral.name());
                    ScanEvent::Discovered(peripheral.clone())
                },
            }
        };

        self.callbacks.invoke_all(|callback| callback(&event));
    }
}

fn scan_task(shared: Weak<ScannerShared>, generation: u64, cancel: CancellationToken, mut stream: AdvertisementStream) {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                next = stream.next() => match (next, shared.upgrade()) {
                    (Some(raw), Some(shared)) => shared.process_advertisement(raw),
                    (None, Some(shared)) => {
                        warn!("Advertisement stream ended while scanning");
                        shared.end_session(generation);
                        break 'mainloop;
                    },
                    (_, None) => break 'mainloop,
                }
            }
        }
        debug!("Scan task stopped");
    });
}

/// Scans for peripherals and keeps one [`ScannedPeripheral`] per identifier.
pub struct Scanner<A: BleAdapter> {
    adapter: Arc<A>,
    shared: Arc<ScannerShared>,
}

impl<A: BleAdapter> Scanner<A> {
    pub fn new(adapter: Arc<A>) -> Self {
        Scanner {
            adapter,
            shared: Arc::new(ScannerShared::new()),
        }
    }

    /// Starts scanning. Calling this while already scanning keeps the running session (and its
    /// filter) and returns immediately.
    pub async fn start_scan(&self, filter: Option<ScanFilter>) -> Result<(), BleError> {
        let (generation, cancel) = {
            let mut session = lock(&self.shared.session);
            if session.is_some() {
                debug!("Already scanning");
                return Ok(());
            }
            let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let cancel = CancellationToken::new();
            *session = Some(ScanSession { generation, cancel: cancel.clone() });
            (generation, cancel)
        };

        let services = filter.as_ref().map(ScanFilter::service_hint).unwrap_or_default();
        *lock(&self.shared.filter) = filter;

        info!("Starting scan (services: {:?})", services);
        match self.adapter.start_scan(services).await {
            Ok(stream) => {
                scan_task(Arc::downgrade(&self.shared), generation, cancel, stream);
                Ok(())
            },
            Err(err) => {
                warn!("Scanning failed {:?}", err);
                self.shared.end_session(generation);
                Err(err.into())
            },
        }
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        let session = lock(&self.shared.session).take();
        match session {
            None => Ok(()),
            Some(session) => {
                session.cancel.cancel();
                info!("Stopping scan");
                self.adapter.stop_scan().await.map_err(BleError::from)
            },
        }
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.shared.session).is_some()
    }

    pub fn on_scanned<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ScanEvent) + Send + Sync + 'static,
    {
        self.shared.callbacks.add(Arc::new(callback))
    }

    pub fn remove_callback(&self, handle: CallbackHandle) -> bool {
        self.shared.callbacks.remove(handle)
    }

    /// All peripherals seen since the last [`Scanner::clear`], in discovery order.
    pub fn peripherals(&self) -> Vec<ScannedPeripheral> {
        lock(&self.shared.peripherals).values().cloned().collect()
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Option<ScannedPeripheral> {
        lock(&self.shared.peripherals).get(id).cloned()
    }

    pub fn clear(&self) {
        lock(&self.shared.peripherals).clear();
    }
}

impl<A: BleAdapter> Drop for Scanner<A> {
    fn drop(&mut self) {
        let session = lock(&self.shared.session).take();
        if let Some(session) = session {
            session.cancel.cancel();

            let adapter = Arc::clone(&self.adapter);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = adapter.stop_scan().await {
                            warn!("Failed to stop scan of dropped scanner: {}", err);
                        }
                    });
                },
                Err(_) => warn!("Scanner dropped outside of a runtime while scanning"),
            }
        }
    }
}
