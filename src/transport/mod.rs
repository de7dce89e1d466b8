// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The boundary to the radio stack. The engine drives a [`Transport`] with [`Command`]s and
//! learns about their outcome from [`TransportEvent`]s, which carry only coarse identity and
//! arrive in no particular order.

mod recording;

pub use self::recording::RecordingTransport;

use crate::api::{
    AdapterState, Advertisement, Characteristic, Descriptor, PeripheralId, Service,
    TransportError, UuidFilter, WriteType,
};
use crate::Result;
use std::fmt::Debug;

/// Work the engine asks the transport to perform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start scanning, or restart with a new filter if already scanning.
    StartScan(UuidFilter),
    StopScan,
    Connect(PeripheralId),
    CancelConnect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId, UuidFilter),
    DiscoverCharacteristics(Service, UuidFilter),
    DiscoverDescriptors(Characteristic, UuidFilter),
    Read(Characteristic),
    Write(Characteristic, Vec<u8>, WriteType),
    ReadDescriptor(Descriptor),
    WriteDescriptor(Descriptor, Vec<u8>),
    /// Enable or disable notify/indicate on a characteristic.
    SetNotify(Characteristic, bool),
    ReadRssi(PeripheralId),
}

/// Something the transport observed, usually the completion of an earlier [`Command`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(AdapterState),
    Advertisement(Advertisement),
    Connected(PeripheralId),
    ConnectFailed(PeripheralId, TransportError),
    /// A link went down. Carries an error when the drop was not asked for.
    Disconnected(PeripheralId, Option<TransportError>),
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<Service>,
        error: Option<TransportError>,
    },
    CharacteristicsDiscovered {
        service: Service,
        characteristics: Vec<Characteristic>,
        error: Option<TransportError>,
    },
    DescriptorsDiscovered {
        characteristic: Characteristic,
        descriptors: Vec<Descriptor>,
        error: Option<TransportError>,
    },
    /// A characteristic value arrived, either answering a read or as a notification.
    ValueUpdated {
        characteristic: Characteristic,
        value: Vec<u8>,
        error: Option<TransportError>,
    },
    ValueWritten {
        characteristic: Characteristic,
        error: Option<TransportError>,
    },
    DescriptorValueUpdated {
        descriptor: Descriptor,
        value: Vec<u8>,
        error: Option<TransportError>,
    },
    DescriptorValueWritten {
        descriptor: Descriptor,
        error: Option<TransportError>,
    },
    NotifyStateChanged {
        characteristic: Characteristic,
        enabled: bool,
        error: Option<TransportError>,
    },
    RssiRead {
        peripheral: PeripheralId,
        rssi: i16,
        error: Option<TransportError>,
    },
}

/// A lower-level Bluetooth stack the engine can drive.
///
/// `issue` must not block waiting for the operation to finish; completions are reported
/// later through [`Engine::handle_event`](crate::Engine::handle_event) or an
/// [`EventSink`](crate::EventSink). An `Err` from `issue` means the command was rejected
/// outright, and fails the request that caused it.
pub trait Transport: Send + Sync + Debug {
    fn state(&self) -> AdapterState;

    fn issue(&self, command: Command) -> Result<()>;
}
