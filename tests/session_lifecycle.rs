use std::time::Duration;

use arpmini_link::device::{ConnectionState, DeviceError, DeviceManager, SessionEvent, SlotIndex, SlotStatus, NUM_SLOTS, SONG_SIZE};
use arpmini_link::serial::FailureKind;
use arpmini_link::{EditorSettings, SimulatedArpmini};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

fn settings(liveness_interval_ms: u64) -> EditorSettings {
    EditorSettings { liveness_interval_ms, ..EditorSettings::default() }
}

fn slot(index: usize) -> SlotIndex {
    SlotIndex::new(index).unwrap()
}

fn tag_pattern() -> Vec<u8> {
    (0..SONG_SIZE).map(|i| (i as u8).wrapping_mul(3) ^ 0xA5).collect()
}

fn preset_status(index: usize) -> SlotStatus {
    match index % 3 {
        0 => SlotStatus::Song,
        1 => SlotStatus::Drum,
        _ => SlotStatus::Empty,
    }
}

async fn wait_for(events: &mut broadcast::Receiver<SessionEvent>, wanted: fn(&SessionEvent) -> bool) -> SessionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

#[tokio::test]
async fn test_end_to_end_import_export() {
    let device = SimulatedArpmini::new();
    device.set_import_status(SlotStatus::Song);
    let manager = DeviceManager::new(settings(1000));

    manager.connect_with_io("SIM", device.boxed()).await.unwrap();
    assert_eq!(manager.connection_state().await, ConnectionState::Connected);
    assert_eq!(manager.wait_for_scan().await, Some(NUM_SLOTS));

    let registry = manager.registry().await;
    assert!(registry.is_online());
    assert_eq!(registry.scanned_count(), NUM_SLOTS);
    assert!(registry.entries().iter().all(|e| e.status == SlotStatus::Empty));

    assert_eq!(manager.query_status(slot(0)).await.unwrap(), SlotStatus::Empty);

    let data = tag_pattern();
    let queries_before = device.status_queries();
    let status = manager.import(slot(0), &data).await.unwrap();
    assert_eq!(status, SlotStatus::Song);
    assert_eq!(device.status_queries(), queries_before + 1);
    assert_eq!(manager.registry().await.status(slot(0)), SlotStatus::Song);

    let blob = manager.export(slot(0)).await.unwrap();
    assert_eq!(blob.as_bytes(), &data[..]);

    manager.disconnect().await.unwrap();
    assert!(!manager.registry().await.is_online());
    assert!(matches!(manager.disconnect().await, Err(DeviceError::NotConnected)));
}

#[tokio::test]
async fn test_scan_reflects_device_contents() {
    let device = SimulatedArpmini::new();
    for index in 0..NUM_SLOTS {
        device.set_slot(index, preset_status(index), &[index as u8]);
    }
    let manager = DeviceManager::new(settings(1000));
    let mut events = manager.subscribe();

    manager.connect_with_io("SIM", device.boxed()).await.unwrap();
    let done = wait_for(&mut events, |e| matches!(e, SessionEvent::ScanCompleted { .. })).await;
    assert_eq!(done, SessionEvent::ScanCompleted { scanned: NUM_SLOTS });

    let registry = manager.registry().await;
    for entry in registry.entries() {
        assert_eq!(entry.status, preset_status(entry.slot.index()));
    }
    assert!(registry.is_occupied(slot(0)));
    assert!(!registry.is_occupied(slot(2)));
}

#[tokio::test]
async fn test_device_lost_during_scan_keeps_scanned_entries() {
    let device = SimulatedArpmini::new();
    for index in 0..NUM_SLOTS {
        device.set_slot(index, preset_status(index), &[]);
    }
    device.set_latency(Duration::from_millis(20));

    let manager = DeviceManager::new(settings(25));
    let mut events = manager.subscribe();
    manager.connect_with_io("SIM", device.boxed()).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while manager.registry().await.scanned_count() < 5 {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("scan did not start");
    device.unplug();

    let lost = wait_for(&mut events, |e| matches!(e, SessionEvent::DeviceLost { .. })).await;
    assert_eq!(lost, SessionEvent::DeviceLost { port_name: "SIM".to_string() });

    let registry = manager.registry().await;
    assert!(!registry.is_online());
    let scanned = registry.scanned_count();
    assert!(scanned >= 5 && scanned < NUM_SLOTS, "scanned {}", scanned);
    for entry in registry.entries() {
        if entry.is_scanned() {
            assert_eq!(entry.status, preset_status(entry.slot.index()));
        } else {
            assert_eq!(entry.status, SlotStatus::Empty);
        }
    }

    assert!(!manager.is_connected().await);
    assert_eq!(manager.connection_state().await, ConnectionState::Disconnected);
    let err = manager.query_status(slot(0)).await.unwrap_err();
    assert!(matches!(err, DeviceError::NotConnected));
    assert_eq!(err.kind(), FailureKind::Connection);
}

#[tokio::test]
async fn test_disconnect_during_scan_lets_query_finish() {
    let device = SimulatedArpmini::new();
    for index in 0..NUM_SLOTS {
        device.set_slot(index, preset_status(index), &[]);
    }
    device.set_latency(Duration::from_millis(20));

    let manager = DeviceManager::new(settings(60_000));
    let mut events = manager.subscribe();
    manager.connect_with_io("SIM", device.boxed()).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while manager.registry().await.scanned_count() < 5 {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("scan did not start");

    manager.disconnect().await.unwrap();
    let interrupted = wait_for(&mut events, |e| matches!(e, SessionEvent::ScanInterrupted { .. })).await;

    let registry = manager.registry().await;
    assert!(!registry.is_online());
    let scanned = registry.scanned_count();
    assert!(scanned >= 5 && scanned < NUM_SLOTS, "scanned {}", scanned);
    assert_eq!(interrupted, SessionEvent::ScanInterrupted { scanned });
    for entry in registry.entries().iter().filter(|e| e.is_scanned()) {
        assert_eq!(entry.status, preset_status(entry.slot.index()));
    }

    // Nothing is written once the session is gone
    let written = device.written().len();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.registry().await.scanned_count(), scanned);
    assert_eq!(device.written().len(), written);
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn test_query_on_vanished_port_keeps_last_known_status() {
    let device = SimulatedArpmini::new();
    device.set_slot(3, SlotStatus::Song, &tag_pattern());
    let manager = DeviceManager::new(settings(60_000));
    let mut events = manager.subscribe();
    manager.connect_with_io("SIM", device.boxed()).await.unwrap();
    manager.wait_for_scan().await;
    assert_eq!(manager.registry().await.status(slot(3)), SlotStatus::Song);

    device.unplug();
    assert_eq!(manager.query_status(slot(3)).await.unwrap(), SlotStatus::Empty);

    wait_for(&mut events, |e| matches!(e, SessionEvent::DeviceLost { .. })).await;
    let registry = manager.registry().await;
    assert_eq!(registry.status(slot(3)), SlotStatus::Song);
    assert!(!registry.is_online());
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn test_liveness_monitor_disconnects_idle_session() {
    let device = SimulatedArpmini::new();
    let manager = DeviceManager::new(settings(20));
    let mut events = manager.subscribe();

    manager.connect_with_io("SIM", device.boxed()).await.unwrap();
    manager.wait_for_scan().await;
    device.unplug();

    wait_for(&mut events, |e| matches!(e, SessionEvent::DeviceLost { .. })).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn test_failed_transfer_on_vanished_port_reports_device_lost() {
    let device = SimulatedArpmini::new();
    // Keep the monitor out of the way
    let manager = DeviceManager::new(settings(60_000));
    manager.connect_with_io("SIM", device.boxed()).await.unwrap();
    manager.wait_for_scan().await;

    device.unplug();
    let err = manager.import(slot(1), &tag_pattern()).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::DeviceLost);
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn test_protocol_fault_keeps_session_open() {
    let device = SimulatedArpmini::new();
    let manager = DeviceManager::new(settings(1000));
    manager.connect_with_io("SIM", device.boxed()).await.unwrap();
    manager.wait_for_scan().await;

    device.corrupt_ack_at(100);
    let err = manager.import(slot(4), &tag_pattern()).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Protocol);
    assert!(manager.is_connected().await);
    assert_eq!(manager.query_status(slot(4)).await.unwrap(), SlotStatus::Empty);
}

#[tokio::test]
async fn test_validation_precedes_any_wire_activity() {
    let device = SimulatedArpmini::new();
    let manager = DeviceManager::new(settings(1000));

    // Even without a connection, a bad size is a validation failure
    let err = manager.import(slot(0), &[0u8; 10]).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);

    manager.connect_with_io("SIM", device.boxed()).await.unwrap();
    manager.wait_for_scan().await;
    let written_before = device.written().len();

    let err = manager.import(slot(0), &vec![0u8; SONG_SIZE + 1]).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
    assert_eq!(device.written().len(), written_before);
}

#[tokio::test]
async fn test_clear_updates_registry() {
    let device = SimulatedArpmini::new();
    device.set_slot(9, SlotStatus::Drum, &tag_pattern());
    let manager = DeviceManager::new(settings(1000));
    manager.connect_with_io("SIM", device.boxed()).await.unwrap();
    manager.wait_for_scan().await;
    assert_eq!(manager.registry().await.status(slot(9)), SlotStatus::Drum);

    assert_eq!(manager.clear(slot(9)).await.unwrap(), SlotStatus::Empty);
    assert_eq!(manager.registry().await.status(slot(9)), SlotStatus::Empty);
    assert_eq!(manager.query_status(slot(9)).await.unwrap(), SlotStatus::Empty);
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let manager = DeviceManager::new(settings(1000));
    manager.connect_with_io("SIM", SimulatedArpmini::new().boxed()).await.unwrap();

    let err = manager.connect_with_io("SIM2", SimulatedArpmini::new().boxed()).await.unwrap_err();
    assert!(matches!(err, DeviceError::AlreadyConnected));

    manager.disconnect().await.unwrap();
    manager.connect_with_io("SIM2", SimulatedArpmini::new().boxed()).await.unwrap();
    assert_eq!(manager.registry().await.port_name(), Some("SIM2"));
    manager.disconnect().await.unwrap();
}
