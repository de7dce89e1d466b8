// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

mod common;

use ble_correlator::api::{
    uuid_from_u16, AdapterState, Advertisement, Central, CentralEvent, PeripheralId, UuidFilter,
};
use ble_correlator::transport::{Command, TransportEvent};
use ble_correlator::Error;
use common::{peripheral, Harness, Outcomes};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

const A: Uuid = uuid_from_u16(0xfd00);
const B: Uuid = uuid_from_u16(0xfd01);
const C: Uuid = uuid_from_u16(0xfd02);

fn advertising(peripheral: PeripheralId, services: &[Uuid]) -> TransportEvent {
    TransportEvent::Advertisement(Advertisement {
        peripheral,
        local_name: Some(format!("sensor-{}", peripheral)),
        services: services.iter().copied().collect(),
        rssi: -60,
        ..Default::default()
    })
}

fn found(outcomes: &Outcomes<Vec<Advertisement>>) -> Vec<PeripheralId> {
    match outcomes.take().pop() {
        Some(Ok(found)) => found.into_iter().map(|a| a.peripheral).collect(),
        other => panic!("scan did not complete: {:?}", other.map(|r| r.err())),
    }
}

#[tokio::test(start_paused = true)]
async fn one_advertisement_reaches_every_matching_scan() {
    let h = Harness::new();
    let unfiltered = Outcomes::new();
    let only_a = Outcomes::new();
    h.engine
        .submit_scan(UuidFilter::Any, Some(Duration::from_secs(5)), None, unfiltered.completion())
        .unwrap();
    h.engine
        .submit_scan(
            UuidFilter::only([A]),
            Some(Duration::from_secs(5)),
            None,
            only_a.completion(),
        )
        .unwrap();

    h.event(advertising(peripheral(1), &[A, B])).unwrap();
    h.event(advertising(peripheral(2), &[C])).unwrap();
    sleep(Duration::from_secs(6)).await;
    h.engine.flush().await;

    assert_eq!(found(&unfiltered), vec![peripheral(1), peripheral(2)]);
    assert_eq!(found(&only_a), vec![peripheral(1)]);
    assert_eq!(h.transport.commands().last(), Some(&Command::StopScan));
    assert_eq!(h.engine.active_scan_filter(), None);
}

#[tokio::test(start_paused = true)]
async fn transport_filter_is_the_union_of_outstanding_filters() {
    let h = Harness::new();
    let short = Outcomes::new();
    h.engine
        .submit_scan(UuidFilter::only([A]), Some(Duration::from_secs(2)), None, short.completion())
        .unwrap();
    h.engine
        .submit_scan(
            UuidFilter::only([B, C]),
            Some(Duration::from_secs(4)),
            None,
            Outcomes::new().completion(),
        )
        .unwrap();
    assert_eq!(h.engine.active_scan_filter(), Some(UuidFilter::only([A, B, C])));

    let any = h
        .engine
        .submit_scan(UuidFilter::Any, Some(Duration::from_secs(10)), None, Outcomes::new().completion())
        .unwrap();
    assert_eq!(h.engine.active_scan_filter(), Some(UuidFilter::Any));
    assert!(h.engine.cancel_scan(any));
    assert!(!h.engine.cancel_scan(any));
    assert_eq!(h.engine.active_scan_filter(), Some(UuidFilter::only([A, B, C])));

    sleep(Duration::from_secs(3)).await;
    h.engine.flush().await;
    assert_eq!(short.len(), 1);
    assert_eq!(h.engine.active_scan_filter(), Some(UuidFilter::only([B, C])));

    assert_eq!(
        h.transport.take_commands(),
        vec![
            Command::StartScan(UuidFilter::only([A])),
            Command::StartScan(UuidFilter::only([A, B, C])),
            Command::StartScan(UuidFilter::Any),
            Command::StartScan(UuidFilter::only([A, B, C])),
            Command::StartScan(UuidFilter::only([B, C])),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_scan_aborts_every_scan() {
    let h = Harness::new();
    let first = Outcomes::new();
    let second = Outcomes::new();
    h.engine
        .submit_scan(UuidFilter::Any, None, None, first.completion())
        .unwrap();
    h.engine
        .submit_scan(UuidFilter::only([A]), None, None, second.completion())
        .unwrap();
    h.engine.stop_scan().await.unwrap();
    h.engine.flush().await;

    assert!(matches!(first.take().as_slice(), [Err(Error::ScanAborted)]));
    assert!(matches!(second.take().as_slice(), [Err(Error::ScanAborted)]));

    // The elapsed duration must not resolve them a second time.
    sleep(Duration::from_secs(30)).await;
    h.engine.flush().await;
    assert_eq!(first.len() + second.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn adapter_power_loss_aborts_scans() {
    let h = Harness::new();
    let mut events = h.engine.events().await.unwrap();
    let scan = Outcomes::new();
    h.engine
        .submit_scan(UuidFilter::Any, None, None, scan.completion())
        .unwrap();

    h.transport.set_state(AdapterState::PoweredOff);
    h.event(TransportEvent::StateChanged(AdapterState::PoweredOff))
        .unwrap();
    h.engine.flush().await;

    assert!(matches!(scan.take().as_slice(), [Err(Error::ScanAborted)]));
    assert!(matches!(
        events.next().await,
        Some(CentralEvent::StateUpdate(AdapterState::PoweredOff))
    ));
    assert!(matches!(
        h.engine.scan(UuidFilter::Any, Duration::from_secs(1)).await,
        Err(Error::Unavailable(AdapterState::PoweredOff))
    ));
}

#[tokio::test(start_paused = true)]
async fn updates_and_discovery_events_follow_advertisements() {
    let h = Harness::new();
    let mut events = h.engine.events().await.unwrap();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    h.engine
        .submit_scan(
            UuidFilter::Any,
            Some(Duration::from_secs(1)),
            Some(Box::new(move |a: Advertisement| {
                sink.lock().unwrap().push((a.peripheral, a.sequence))
            })),
            Outcomes::new().completion(),
        )
        .unwrap();

    h.event(advertising(peripheral(3), &[])).unwrap();
    h.event(advertising(peripheral(3), &[])).unwrap();
    h.event(advertising(peripheral(4), &[])).unwrap();
    h.engine.flush().await;

    assert_eq!(
        *updates.lock().unwrap(),
        vec![(peripheral(3), 1), (peripheral(3), 2), (peripheral(4), 3)]
    );
    assert!(matches!(events.next().await, Some(CentralEvent::DeviceDiscovered(p)) if p == peripheral(3)));
    assert!(matches!(events.next().await, Some(CentralEvent::DeviceDiscovered(p)) if p == peripheral(4)));
}

#[tokio::test(start_paused = true)]
async fn async_scan_returns_sorted_results() {
    let h = Harness::new();
    let engine = h.engine.clone();
    let scan = tokio::spawn(async move {
        engine
            .scan(UuidFilter::only([B]), Duration::from_secs(3))
            .await
    });
    tokio::task::yield_now().await;
    h.event(advertising(peripheral(9), &[B])).unwrap();
    h.event(advertising(peripheral(5), &[B, C])).unwrap();
    h.event(advertising(peripheral(7), &[A])).unwrap();

    let found: Vec<PeripheralId> = scan
        .await
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|a| a.peripheral)
        .collect();
    assert_eq!(found, vec![peripheral(5), peripheral(9)]);
}
