// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

mod common;

use ble_correlator::api::{
    uuid_from_u16, Central, CharPropFlags, Service, TransportError, UuidFilter,
};
use ble_correlator::transport::{Command, TransportEvent};
use ble_correlator::Error;
use common::{characteristic, descriptor, peripheral, service, Harness, Outcomes};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

const A: u16 = 0x1800;
const B: u16 = 0x1801;

fn uuids(services: &[Service]) -> Vec<Uuid> {
    services.iter().map(|s| s.uuid).collect()
}

#[tokio::test]
async fn wider_filter_waits_for_more_discoveries() {
    let h = Harness::new();
    let p = peripheral(1);
    h.connect(p).await;

    let both = Outcomes::new();
    let any = Outcomes::new();
    h.engine
        .submit_discover_services(
            &p,
            UuidFilter::only([uuid_from_u16(A), uuid_from_u16(B)]),
            None,
            both.completion(),
        )
        .unwrap();
    h.engine
        .submit_discover_services(&p, UuidFilter::Any, None, any.completion())
        .unwrap();

    h.event(TransportEvent::ServicesDiscovered {
        peripheral: p,
        services: vec![service(p, A)],
        error: None,
    })
    .unwrap();
    h.engine.flush().await;
    match any.take().as_slice() {
        [Ok(services)] => assert_eq!(uuids(services), vec![uuid_from_u16(A)]),
        other => panic!("unexpected outcome count {}", other.len()),
    }
    assert_eq!(both.len(), 0);

    h.event(TransportEvent::ServicesDiscovered {
        peripheral: p,
        services: vec![service(p, A), service(p, B)],
        error: None,
    })
    .unwrap();
    h.engine.flush().await;
    match both.take().as_slice() {
        [Ok(services)] => assert_eq!(uuids(services), vec![uuid_from_u16(A), uuid_from_u16(B)]),
        other => panic!("unexpected outcome count {}", other.len()),
    }
    assert_eq!(h.engine.services(&p).len(), 2);
    assert_eq!(
        h.transport.count(|c| matches!(c, Command::DiscoverServices(..))),
        2
    );
}

#[tokio::test]
async fn discovery_with_nothing_pending_is_not_an_error() {
    let h = Harness::new();
    let p = peripheral(2);
    h.connect(p).await;
    assert!(h
        .event(TransportEvent::ServicesDiscovered {
            peripheral: p,
            services: vec![service(p, A)],
            error: None,
        })
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn unsatisfied_discovery_times_out() {
    let h = Harness::new();
    let p = peripheral(3);
    h.connect(p).await;
    let outcomes = Outcomes::new();
    h.engine
        .submit_discover_services(
            &p,
            UuidFilter::only([uuid_from_u16(B)]),
            Some(Duration::from_secs(2)),
            outcomes.completion(),
        )
        .unwrap();
    h.event(TransportEvent::ServicesDiscovered {
        peripheral: p,
        services: vec![service(p, A)],
        error: None,
    })
    .unwrap();

    sleep(Duration::from_secs(3)).await;
    h.engine.flush().await;
    assert!(matches!(outcomes.take().as_slice(), [Err(Error::TimedOut(_))]));
}

#[tokio::test]
async fn discovery_error_reaches_unfiltered_requests() {
    let h = Harness::new();
    let p = peripheral(4);
    h.connect(p).await;
    let outcomes = Outcomes::new();
    h.engine
        .submit_discover_services(&p, UuidFilter::Any, None, outcomes.completion())
        .unwrap();
    h.event(TransportEvent::ServicesDiscovered {
        peripheral: p,
        services: Vec::new(),
        error: Some(TransportError::new("insufficient authentication")),
    })
    .unwrap();
    h.engine.flush().await;
    assert!(matches!(outcomes.take().as_slice(), [Err(Error::Transport(_))]));
}

#[tokio::test]
async fn characteristics_and_descriptors_join_on_their_own_scope() {
    let h = Harness::new();
    let p = peripheral(5);
    h.connect(p).await;
    let heart_rate_service = service(p, common::HEART_RATE_SERVICE);
    let measurement = characteristic(p, common::HEART_RATE_MEASUREMENT, CharPropFlags::NOTIFY);
    let location = characteristic(p, common::BODY_SENSOR_LOCATION, CharPropFlags::READ);
    let engine = h.engine.clone();
    let svc = heart_rate_service.clone();
    let characteristics = tokio::spawn(async move {
        engine
            .discover_characteristics(&svc, UuidFilter::Any)
            .await
    });
    tokio::task::yield_now().await;

    // A completion for another service does not satisfy the request.
    h.event(TransportEvent::CharacteristicsDiscovered {
        service: service(p, 0x180f),
        characteristics: Vec::new(),
        error: None,
    })
    .unwrap();
    h.event(TransportEvent::CharacteristicsDiscovered {
        service: heart_rate_service.clone(),
        characteristics: vec![measurement.clone(), location.clone()],
        error: None,
    })
    .unwrap();
    let found = characteristics.await.unwrap().unwrap();
    assert_eq!(found, vec![measurement.clone(), location]);
    assert_eq!(h.engine.characteristics(&heart_rate_service).len(), 2);

    let outcomes = Outcomes::new();
    let cccd = descriptor(&measurement, common::CLIENT_CONFIGURATION);
    h.engine
        .submit_discover_descriptors(
            &measurement,
            UuidFilter::only([cccd.uuid]),
            None,
            outcomes.completion(),
        )
        .unwrap();
    h.event(TransportEvent::DescriptorsDiscovered {
        characteristic: measurement.clone(),
        descriptors: vec![cccd.clone()],
        error: None,
    })
    .unwrap();
    h.engine.flush().await;
    match outcomes.take().as_slice() {
        [Ok(descriptors)] => assert_eq!(descriptors, &vec![cccd]),
        other => panic!("unexpected outcome count {}", other.len()),
    }
}

#[tokio::test]
async fn discovery_requires_a_session_and_cache_dies_with_it() {
    let h = Harness::new();
    let p = peripheral(6);
    let result = h.engine.discover_services(&p, UuidFilter::Any).await;
    assert!(matches!(result, Err(Error::NotConnected)));

    h.connect(p).await;
    h.engine
        .submit_discover_services(&p, UuidFilter::Any, None, Outcomes::new().completion())
        .unwrap();
    h.event(TransportEvent::ServicesDiscovered {
        peripheral: p,
        services: vec![service(p, A)],
        error: None,
    })
    .unwrap();
    assert_eq!(h.engine.services(&p).len(), 1);

    h.event(TransportEvent::Disconnected(p, Some(TransportError::new("gone"))))
        .unwrap();
    assert!(h.engine.services(&p).is_empty());
}

#[tokio::test]
async fn late_discovery_does_not_outlive_its_session() {
    let h = Harness::new();
    let p = peripheral(1);
    h.connect(p).await;
    h.event(TransportEvent::Disconnected(p, Some(TransportError::new("link lost"))))
        .unwrap();
    h.event(TransportEvent::ServicesDiscovered {
        peripheral: p,
        services: vec![service(p, 0x180d)],
        error: None,
    })
    .unwrap();
    assert!(h.engine.services(&p).is_empty());

    h.connect(p).await;
    let heart_rate = Outcomes::new();
    h.engine
        .submit_discover_services(
            &p,
            UuidFilter::only([uuid_from_u16(0x180d)]),
            None,
            heart_rate.completion(),
        )
        .unwrap();
    h.event(TransportEvent::ServicesDiscovered {
        peripheral: p,
        services: vec![service(p, 0x180f)],
        error: None,
    })
    .unwrap();
    h.engine.flush().await;
    assert_eq!(heart_rate.len(), 0);
    assert_eq!(uuids(&h.engine.services(&p)), vec![uuid_from_u16(0x180f)]);
}
