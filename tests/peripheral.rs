mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use common::{wait_for, ConnectBehavior, MockAdapter};
use pixels_ble::ble::central::Central;
use pixels_ble::ble::peripheral::{Peripheral, PeripheralConfig};
use pixels_ble::ble::types::{ConnectionEvent, ConnectionEventReason, PeripheralId};
use pixels_ble::error::BleError;
use pixels_ble::pixels::constants::{PIXELS_NOTIFY_CHARACTERISTIC, PIXELS_WRITE_CHARACTERISTIC};
use uuid::Uuid;

type Events = Arc<Mutex<Vec<(ConnectionEvent, ConnectionEventReason)>>>;

fn record(peripheral: &Peripheral<MockAdapter>) -> Events {
    let events: Events = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&events);
    peripheral.on_connection_event(move |event, reason| sink.lock().unwrap().push((event, reason)));
    events
}

fn setup() -> (Central<MockAdapter>, Peripheral<MockAdapter>, Events) {
    let central = Central::new(MockAdapter::new());
    let peripheral = central.peripheral(&PeripheralId::new("AA:BB:CC:00:00:01"));
    let events = record(&peripheral);
    (central, peripheral, events)
}

#[tokio::test]
async fn connect_and_disconnect_report_each_transition_once() {
    let (_central, peripheral, events) = setup();

    peripheral.connect(Duration::from_secs(5)).await.unwrap();
    assert!(peripheral.is_ready());
    assert!(peripheral.characteristic(PIXELS_WRITE_CHARACTERISTIC).is_some());

    peripheral.disconnect().await;
    assert_eq!(peripheral.state(), ConnectionEvent::Disconnected);
    assert!(peripheral.services().is_empty());

    use ConnectionEvent::*;
    use ConnectionEventReason::Success;
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (Connecting, Success),
            (Connected, Success),
            (Ready, Success),
            (Disconnecting, Success),
            (Disconnected, Success),
        ]
    );

    // already disconnected: nothing to report
    peripheral.disconnect().await;
    assert_eq!(events.lock().unwrap().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_exactly_at_the_deadline() {
    let (central, peripheral, events) = setup();
    central.adapter().set_connect_behavior(ConnectBehavior::Hang);

    let start = Instant::now();
    let result = peripheral.connect(Duration::from_secs(3)).await;
    let elapsed = start.elapsed();

    assert_eq!(result, Err(BleError::Timeout));
    assert!(elapsed >= Duration::from_secs(3), "failed early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3010), "failed late: {:?}", elapsed);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (ConnectionEvent::Connecting, ConnectionEventReason::Success),
            (ConnectionEvent::FailedToConnect, ConnectionEventReason::Timeout),
            (ConnectionEvent::Disconnected, ConnectionEventReason::Timeout),
        ]
    );
    assert_eq!(central.adapter().disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_link_loss_watch_does_not_outlast_the_deadline() {
    let (central, peripheral, _events) = setup();
    central.adapter().set_disconnections_hang(true);

    let start = Instant::now();
    assert_eq!(peripheral.connect(Duration::from_secs(2)).await, Err(BleError::Timeout));
    assert!(start.elapsed() < Duration::from_millis(2010), "failed late: {:?}", start.elapsed());
    assert_eq!(peripheral.state(), ConnectionEvent::Disconnected);
}

#[tokio::test]
async fn failed_connect_cleans_up_before_reporting_disconnected() {
    let (central, peripheral, _events) = setup();
    central.adapter().set_connect_behavior(ConnectBehavior::Fail);

    let cleanups_seen = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&cleanups_seen);
    let adapter = Arc::clone(central.adapter());
    peripheral.on_connection_event(move |event, _| {
        if event == ConnectionEvent::Disconnected {
            sink.lock().unwrap().push(adapter.disconnects());
        }
    });

    assert!(peripheral.connect(Duration::from_secs(3)).await.is_err());
    assert_eq!(*cleanups_seen.lock().unwrap(), vec![1]);

    // a reconnect right after the failure is not torn down by the cleanup
    central.adapter().set_connect_behavior(ConnectBehavior::Succeed);
    peripheral.connect(Duration::from_secs(3)).await.unwrap();
    assert_eq!(central.adapter().disconnects(), 1);
    assert!(peripheral.is_ready());
}

#[tokio::test]
async fn refused_connection_is_reported_as_failure() {
    let (central, peripheral, events) = setup();
    central.adapter().set_connect_behavior(ConnectBehavior::Fail);

    let result = peripheral.connect(Duration::from_secs(3)).await;
    assert!(matches!(result, Err(BleError::Unknown(_))), "{:?}", result);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].0, ConnectionEvent::FailedToConnect);
    assert_eq!(events[2].0, ConnectionEvent::Disconnected);
}

#[tokio::test]
async fn disconnect_cancels_a_pending_connect() {
    let (central, peripheral, events) = setup();
    central.adapter().set_connect_behavior(ConnectBehavior::Hang);

    let connecting = peripheral.clone();
    let task = tokio::spawn(async move { connecting.connect(Duration::from_secs(30)).await });
    assert!(wait_for(|| peripheral.state() == ConnectionEvent::Connecting).await);

    peripheral.disconnect().await;
    assert_eq!(task.await.unwrap(), Err(BleError::Canceled));
    assert_eq!(peripheral.state(), ConnectionEvent::Disconnected);

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (ConnectionEvent::Connecting, ConnectionEventReason::Success),
            (ConnectionEvent::Disconnecting, ConnectionEventReason::Canceled),
            (ConnectionEvent::Disconnected, ConnectionEventReason::Canceled),
        ]
    );
}

#[tokio::test]
async fn link_loss_goes_straight_to_disconnected() {
    let (central, peripheral, events) = setup();
    peripheral.connect(Duration::from_secs(5)).await.unwrap();

    central.adapter().drop_link(peripheral.id(), ConnectionEventReason::LinkLoss);
    assert!(wait_for(|| peripheral.state() == ConnectionEvent::Disconnected).await);

    let events = events.lock().unwrap();
    assert_eq!(events.last(), Some(&(ConnectionEvent::Disconnected, ConnectionEventReason::LinkLoss)));
    assert!(!events.iter().any(|(event, _)| *event == ConnectionEvent::Disconnecting));
    drop(events);

    assert_eq!(
        peripheral.write_characteristic(PIXELS_WRITE_CHARACTERISTIC, &[1], true).await,
        Err(BleError::NotConnected)
    );
}

#[tokio::test]
async fn link_loss_of_another_device_is_ignored() {
    let (central, peripheral, _events) = setup();
    peripheral.connect(Duration::from_secs(5)).await.unwrap();

    central.adapter().drop_link(&PeripheralId::new("somebody else"), ConnectionEventReason::LinkLoss);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(peripheral.is_ready());
}

#[tokio::test]
async fn operations_require_a_ready_connection_and_a_known_characteristic() {
    let (_central, peripheral, _events) = setup();

    assert_eq!(
        peripheral.read_characteristic(PIXELS_NOTIFY_CHARACTERISTIC).await,
        Err(BleError::NotConnected)
    );

    peripheral.connect(Duration::from_secs(5)).await.unwrap();
    assert_eq!(peripheral.connect(Duration::from_secs(5)).await, Err(BleError::Busy));

    let unknown = Uuid::from_u128(0x1234);
    assert_eq!(
        peripheral.write_characteristic(unknown, &[1], true).await,
        Err(BleError::MissingCharacteristic(unknown))
    );
    assert_eq!(peripheral.read_characteristic(PIXELS_NOTIFY_CHARACTERISTIC).await, Ok(vec![]));
}

#[tokio::test(start_paused = true)]
async fn overlapping_operations_on_one_characteristic_are_busy() {
    let central = Central::with_config(
        MockAdapter::new(),
        PeripheralConfig::default().with_operation_timeout(Duration::from_millis(500)),
    );
    let peripheral = central.peripheral(&PeripheralId::new("AA:BB:CC:00:00:02"));
    peripheral.connect(Duration::from_secs(5)).await.unwrap();
    central.adapter().set_write_hangs(true);

    let writer = peripheral.clone();
    let first = tokio::spawn(async move { writer.write_characteristic(PIXELS_WRITE_CHARACTERISTIC, &[1], true).await });
    assert!(wait_for(|| central.adapter().written().len() == 1).await);

    assert_eq!(
        peripheral.write_characteristic(PIXELS_WRITE_CHARACTERISTIC, &[2], true).await,
        Err(BleError::Busy)
    );
    assert_eq!(first.await.unwrap(), Err(BleError::Timeout));

    // the characteristic is free again once the first write gave up
    central.adapter().set_write_hangs(false);
    assert_eq!(peripheral.write_characteristic(PIXELS_WRITE_CHARACTERISTIC, &[3], true).await, Ok(()));
}

#[tokio::test]
async fn central_hands_out_one_peripheral_per_id() {
    let (central, peripheral, _events) = setup();
    let again = central.peripheral(peripheral.id());

    peripheral.connect(Duration::from_secs(5)).await.unwrap();
    assert!(again.is_ready());
    assert_eq!(central.peripherals().len(), 1);

    central.disconnect_all().await;
    assert_eq!(peripheral.state(), ConnectionEvent::Disconnected);
}

#[tokio::test]
async fn callbacks_may_reenter_the_peripheral() {
    let (_central, peripheral, _events) = setup();
    let seen = Arc::new(Mutex::new(vec![]));

    let observer = peripheral.clone();
    let sink = Arc::clone(&seen);
    peripheral.on_connection_event(move |event, _| {
        sink.lock().unwrap().push((event, observer.state()));
    });

    peripheral.connect(Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (ConnectionEvent::Connecting, ConnectionEvent::Connecting),
            (ConnectionEvent::Connected, ConnectionEvent::Connected),
            (ConnectionEvent::Ready, ConnectionEvent::Ready),
        ]
    );
}
