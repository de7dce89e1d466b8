// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Drives an engine against a simulated heart rate monitor. Run with
//! `RUST_LOG=debug cargo run --example simulated_central` to watch the correlation.

use ble_correlator::api::{
    uuid_from_u16, AdapterState, Advertisement, Central, CentralEvent, CharPropFlags,
    Characteristic, PeripheralId, Service, TransportError, UuidFilter, ValueNotification,
};
use ble_correlator::transport::{Command, Transport, TransportEvent};
use ble_correlator::{Engine, EngineConfig, EventSink};
use futures::stream::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use uuid::Uuid;

const HEART_RATE_SERVICE: u16 = 0x180d;
const HEART_RATE_MEASUREMENT: u16 = 0x2a37;
const BATTERY_SERVICE: u16 = 0x180f;

/// A radio that answers every command after a short delay, as a real stack would.
#[derive(Debug, Default)]
struct SimulatedRadio {
    sink: Mutex<Option<EventSink>>,
}

impl SimulatedRadio {
    fn attach(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn reply_after(&self, delay: Duration, events: Vec<TransportEvent>) {
        let sink = match self.sink.lock().unwrap().clone() {
            Some(sink) => sink,
            None => return,
        };
        tokio::spawn(async move {
            time::sleep(delay).await;
            for event in events {
                if sink.send(event).is_err() {
                    break;
                }
            }
        });
    }
}

fn monitor() -> PeripheralId {
    PeripheralId::from_uuid(Uuid::from_u128(0x5eed))
}

fn heart_rate_service() -> Service {
    Service {
        peripheral: monitor(),
        uuid: uuid_from_u16(HEART_RATE_SERVICE),
        primary: true,
    }
}

fn measurement() -> Characteristic {
    Characteristic {
        peripheral: monitor(),
        service_uuid: uuid_from_u16(HEART_RATE_SERVICE),
        uuid: uuid_from_u16(HEART_RATE_MEASUREMENT),
        properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
    }
}

impl Transport for SimulatedRadio {
    fn state(&self) -> AdapterState {
        AdapterState::PoweredOn
    }

    fn issue(&self, command: Command) -> ble_correlator::Result<()> {
        let quick = Duration::from_millis(20);
        match command {
            Command::StartScan(_) => {
                let advertisements = (0..3)
                    .map(|_| {
                        TransportEvent::Advertisement(Advertisement {
                            peripheral: monitor(),
                            local_name: Some("Pulse".into()),
                            services: [uuid_from_u16(HEART_RATE_SERVICE)].into_iter().collect(),
                            rssi: -58,
                            ..Default::default()
                        })
                    })
                    .collect();
                self.reply_after(Duration::from_millis(100), advertisements);
            }
            Command::StopScan => {}
            Command::Connect(p) => self.reply_after(quick, vec![TransportEvent::Connected(p)]),
            Command::CancelConnect(p) | Command::Disconnect(p) => {
                self.reply_after(quick, vec![TransportEvent::Disconnected(p, None)])
            }
            Command::DiscoverServices(p, _) => self.reply_after(
                quick,
                vec![TransportEvent::ServicesDiscovered {
                    peripheral: p,
                    services: vec![
                        heart_rate_service(),
                        Service {
                            peripheral: p,
                            uuid: uuid_from_u16(BATTERY_SERVICE),
                            primary: true,
                        },
                    ],
                    error: None,
                }],
            ),
            Command::DiscoverCharacteristics(service, _) => self.reply_after(
                quick,
                vec![TransportEvent::CharacteristicsDiscovered {
                    characteristics: if service == heart_rate_service() {
                        vec![measurement()]
                    } else {
                        Vec::new()
                    },
                    service,
                    error: None,
                }],
            ),
            Command::DiscoverDescriptors(characteristic, _) => self.reply_after(
                quick,
                vec![TransportEvent::DescriptorsDiscovered {
                    characteristic,
                    descriptors: Vec::new(),
                    error: None,
                }],
            ),
            Command::Read(characteristic) => self.reply_after(
                quick,
                vec![TransportEvent::ValueUpdated {
                    characteristic,
                    value: vec![0x00, 72],
                    error: None,
                }],
            ),
            Command::Write(characteristic, _, _) => self.reply_after(
                quick,
                vec![TransportEvent::ValueWritten {
                    characteristic,
                    error: None,
                }],
            ),
            Command::ReadDescriptor(descriptor) => self.reply_after(
                quick,
                vec![TransportEvent::DescriptorValueUpdated {
                    descriptor,
                    value: vec![0, 0],
                    error: None,
                }],
            ),
            Command::WriteDescriptor(descriptor, _) => self.reply_after(
                quick,
                vec![TransportEvent::DescriptorValueWritten {
                    descriptor,
                    error: None,
                }],
            ),
            Command::SetNotify(characteristic, enabled) => {
                let mut events = vec![TransportEvent::NotifyStateChanged {
                    characteristic: characteristic.clone(),
                    enabled,
                    error: None,
                }];
                if enabled {
                    events.extend((0..5).map(|beat| TransportEvent::ValueUpdated {
                        characteristic: characteristic.clone(),
                        value: vec![0x00, 70 + beat],
                        error: None,
                    }));
                }
                self.reply_after(quick, events);
            }
            Command::ReadRssi(peripheral) => self.reply_after(
                quick,
                vec![TransportEvent::RssiRead {
                    peripheral,
                    rssi: -61,
                    error: None,
                }],
            ),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let radio = Arc::new(SimulatedRadio::default());
    let engine = Engine::new(radio.clone(), EngineConfig::default())?;
    radio.attach(engine.event_sink());

    let mut events = engine.events().await?;
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDiscovered(id) = event {
                println!("discovered {}", id);
            }
        }
    });

    let found = engine
        .scan(
            UuidFilter::only([uuid_from_u16(HEART_RATE_SERVICE)]),
            Duration::from_millis(500),
        )
        .await?;
    let target = match found.first() {
        Some(advertisement) => advertisement.peripheral,
        None => {
            eprintln!("no heart rate monitor in range");
            return Ok(());
        }
    };

    engine
        .connect(
            &target,
            Some(Box::new(|error: TransportError| eprintln!("connection lost: {}", error))),
        )
        .await?;
    println!("connected, rssi {} dBm", engine.read_rssi(&target).await?);

    let services = engine.discover_services(&target, UuidFilter::Any).await?;
    for service in &services {
        let characteristics = engine
            .discover_characteristics(service, UuidFilter::Any)
            .await?;
        println!("service {} has {} characteristics", service.uuid, characteristics.len());
    }

    let measurement = measurement();
    println!("heart rate {:?}", engine.read(&measurement).await?);

    engine
        .subscribe(
            &measurement,
            Box::new(|notification: ValueNotification| {
                println!("beat {:?}", notification.value)
            }),
        )
        .await?;
    time::sleep(Duration::from_millis(200)).await;
    engine.unsubscribe(&measurement).await?;

    engine.disconnect(&target).await?;
    Ok(())
}
