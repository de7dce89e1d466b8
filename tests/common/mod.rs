// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

#![allow(dead_code)]

use ble_correlator::api::{
    uuid_from_u16, Characteristic, CharPropFlags, Completion, Descriptor, PeripheralId, Service,
};
use ble_correlator::transport::{RecordingTransport, TransportEvent};
use ble_correlator::{Engine, EngineConfig, Result};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const HEART_RATE_SERVICE: u16 = 0x180d;
pub const HEART_RATE_MEASUREMENT: u16 = 0x2a37;
pub const BODY_SENSOR_LOCATION: u16 = 0x2a38;
pub const CLIENT_CONFIGURATION: u16 = 0x2902;

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

pub fn peripheral(n: u128) -> PeripheralId {
    PeripheralId::from_uuid(Uuid::from_u128(n))
}

pub fn service(peripheral: PeripheralId, uuid: u16) -> Service {
    Service {
        peripheral,
        uuid: uuid_from_u16(uuid),
        primary: true,
    }
}

pub fn characteristic(peripheral: PeripheralId, uuid: u16, properties: CharPropFlags) -> Characteristic {
    Characteristic {
        peripheral,
        service_uuid: uuid_from_u16(HEART_RATE_SERVICE),
        uuid: uuid_from_u16(uuid),
        properties,
    }
}

pub fn heart_rate(peripheral: PeripheralId) -> Characteristic {
    characteristic(
        peripheral,
        HEART_RATE_MEASUREMENT,
        CharPropFlags::READ | CharPropFlags::NOTIFY,
    )
}

pub fn descriptor(characteristic: &Characteristic, uuid: u16) -> Descriptor {
    Descriptor {
        peripheral: characteristic.peripheral,
        service_uuid: characteristic.service_uuid,
        characteristic_uuid: characteristic.uuid,
        uuid: uuid_from_u16(uuid),
    }
}

/// Collects every result handed to the completions it creates.
pub struct Outcomes<T> {
    results: Arc<Mutex<Vec<Result<T>>>>,
}

impl<T> Clone for Outcomes<T> {
    fn clone(&self) -> Self {
        Outcomes {
            results: self.results.clone(),
        }
    }
}

impl<T: Send + 'static> Outcomes<T> {
    pub fn new() -> Self {
        Outcomes {
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn completion(&self) -> Completion<T> {
        let results = self.results.clone();
        Box::new(move |result: Result<T>| results.lock().unwrap().push(result))
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<Result<T>> {
        std::mem::take(&mut *self.results.lock().unwrap())
    }
}

pub struct Harness {
    pub transport: Arc<RecordingTransport>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Harness::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_logging();
        let transport = Arc::new(RecordingTransport::default());
        let engine = Engine::new(transport.clone(), config).unwrap();
        Harness { transport, engine }
    }

    pub fn event(&self, event: TransportEvent) -> Result<()> {
        self.engine.handle_event(event)
    }

    /// Brings up a session with `peripheral` and forgets the commands that took.
    pub async fn connect(&self, peripheral: PeripheralId) {
        let outcomes = Outcomes::new();
        self.engine
            .submit_connect(&peripheral, None, None, outcomes.completion())
            .unwrap();
        self.event(TransportEvent::Connected(peripheral)).unwrap();
        self.engine.flush().await;
        assert!(matches!(outcomes.take().as_slice(), [Ok(())]));
        self.transport.take_commands();
    }
}
