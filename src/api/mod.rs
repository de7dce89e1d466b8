// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The `api` module contains the value types shared by applications and transports, and the
//! async [`Central`] trait implemented by [`Engine`](crate::Engine).

mod uuid_filter;

pub use self::uuid_filter::{uuid_from_u16, uuid_from_u32, BleUuid, UuidFilter};

use crate::fingerprint::Fingerprint;
use crate::{RequestKind, Result};
use async_trait::async_trait;
use bitflags::bitflags;
use futures::stream::Stream;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Stable identity of a remote peripheral, as assigned by the transport.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeripheralId(Uuid);

impl PeripheralId {
    pub const fn from_uuid(uuid: Uuid) -> Self {
        PeripheralId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PeripheralId {
    fn default() -> Self {
        PeripheralId(Uuid::nil())
    }
}

impl Display for PeripheralId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for PeripheralId {
    fn from(uuid: Uuid) -> Self {
        PeripheralId(uuid)
    }
}

impl FromStr for PeripheralId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(PeripheralId)
    }
}

/// The readiness of the underlying radio, as reported by the transport.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Only a powered-on adapter accepts new requests.
    pub fn is_available(&self) -> bool {
        *self == AdapterState::PoweredOn
    }
}

/// Connection state of a peripheral as believed by the engine.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum PeripheralState {
    Disconnected,
    Connecting,
    Connected,
}

/// An error payload reported by the transport alongside a completion event. It is handed to
/// the application verbatim.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub code: Option<i64>,
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        TransportError {
            code: Some(code),
            message: message.into(),
        }
    }
}

bitflags! {
    /// A set of properties that indicate what operations are supported by a Characteristic.
    #[cfg_attr(
        feature = "serde",
        derive(Serialize, Deserialize),
        serde(crate = "serde_cr")
    )]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// A GATT service discovered on a peripheral.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Service {
    /// The peripheral hosting this service.
    pub peripheral: PeripheralId,
    /// The UUID for this service.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

/// A Bluetooth characteristic. Characteristics are the main way you will interact with other
/// bluetooth devices. Characteristics are identified by a UUID which may be standardized
/// (like 0x2803, which identifies a characteristic for reading heart rate measurements) but more
/// often are specific to a particular device.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Characteristic {
    pub peripheral: PeripheralId,
    /// The UUID of the service this characteristic belongs to.
    pub service_uuid: Uuid,
    /// The UUID for this characteristic. This uniquely identifies its behavior.
    pub uuid: Uuid,
    /// The set of properties for this characteristic, which indicate what functionality it
    /// supports. Transports that cannot report properties leave this empty.
    pub properties: CharPropFlags,
}

impl Characteristic {
    pub(crate) fn supports_notify(&self) -> bool {
        self.properties.is_empty()
            || self
                .properties
                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }
}

/// A descriptor attached to a characteristic.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Descriptor {
    pub peripheral: PeripheralId,
    /// The UUID of the service the owning characteristic belongs to.
    pub service_uuid: Uuid,
    /// The UUID of the characteristic this descriptor belongs to.
    pub characteristic_uuid: Uuid,
    /// The UUID for this descriptor.
    pub uuid: Uuid,
}

/// One advertisement observed during a scan.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub peripheral: PeripheralId,
    pub local_name: Option<String>,
    /// Advertised service UUIDs, used to match scan filters.
    pub services: BTreeSet<Uuid>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    pub tx_power_level: Option<i16>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Ordering key stamped by the engine when the record is ingested; later advertisements get
    /// larger values.
    pub sequence: u64,
}

/// A notification sent from a peripheral due to a change in a subscribed characteristic's
/// value.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNotification {
    /// The characteristic whose value changed.
    pub characteristic: Characteristic,
    /// The new value of the characteristic.
    #[cfg_attr(feature = "serde", serde(with = "serde_bytes"))]
    pub value: Vec<u8>,
}

/// The type of write operation to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteType {
    /// A write operation where the device is expected to respond with a confirmation or error.
    /// Also known as a request.
    WithResponse,
    /// A write-without-response, also known as a command. Completes as soon as it is handed
    /// to the transport.
    WithoutResponse,
}

/// Events reported on the [`Central::events`] stream.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    StateUpdate(AdapterState),
    /// First advertisement from a peripheral since the engine started.
    DeviceDiscovered(PeripheralId),
    DeviceConnected(PeripheralId),
    DeviceDisconnected(PeripheralId),
    /// A live connection was dropped without being asked to.
    ConnectionLost {
        id: PeripheralId,
        error: TransportError,
    },
    /// The transport reported a completion that matches no outstanding request. This means
    /// the transport and the engine are out of sync.
    Desynchronized {
        kind: RequestKind,
        fingerprint: Fingerprint,
    },
}

/// One-shot completion callback. Receives exactly one terminal result per request.
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Called at most once when a live connection drops unexpectedly.
pub type AbruptionHandler = Box<dyn FnOnce(TransportError) + Send>;

/// Called for every unsolicited value update on a subscribed characteristic.
pub type NotificationHandler = Box<dyn FnMut(ValueNotification) + Send>;

/// Called for every advertisement accepted by a scan request's filter.
pub type AdvertisementHandler = Box<dyn FnMut(Advertisement) + Send>;

/// Central is the "client" of BLE. All of its operations are correlated against the events
/// reported by the transport and resolve exactly once, either with the transport's answer or
/// with [`Error::TimedOut`](crate::Error::TimedOut).
#[async_trait]
pub trait Central: Send + Sync + Clone {
    /// Retrieve a stream of `CentralEvent`s.
    async fn events(&self) -> Result<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>>;

    /// Returns a stream of every value notification delivered to any subscription.
    async fn notifications(&self) -> Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>>;

    /// Current readiness of the transport.
    fn adapter_state(&self) -> AdapterState;

    /// Returns the engine's belief about a peripheral's connection.
    fn current_state(&self, peripheral: &PeripheralId) -> PeripheralState;

    /// Scans for `duration`, returning the advertisements accepted by `filter` sorted by
    /// peripheral identity. Several scans may run at once; they share one physical scan.
    async fn scan(&self, filter: UuidFilter, duration: Duration) -> Result<Vec<Advertisement>>;

    /// Stops every outstanding scan. Each of them fails with
    /// [`Error::ScanAborted`](crate::Error::ScanAborted).
    async fn stop_scan(&self) -> Result<()>;

    /// Connects to a peripheral. `on_abrupt` is called if the connection later drops without
    /// being asked to.
    async fn connect(
        &self,
        peripheral: &PeripheralId,
        on_abrupt: Option<AbruptionHandler>,
    ) -> Result<()>;

    /// Terminates a connection to the device.
    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Cancels a connection attempt that has not completed yet.
    async fn cancel_connect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Discovers the services of a connected peripheral. Resolves once every UUID in `filter`
    /// has been discovered.
    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        filter: UuidFilter,
    ) -> Result<Vec<Service>>;

    /// Discovers the characteristics of a service.
    async fn discover_characteristics(
        &self,
        service: &Service,
        filter: UuidFilter,
    ) -> Result<Vec<Characteristic>>;

    /// Discovers the descriptors of a characteristic.
    async fn discover_descriptors(
        &self,
        characteristic: &Characteristic,
        filter: UuidFilter,
    ) -> Result<Vec<Descriptor>>;

    /// Sends a read request to the device.
    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>>;

    /// Write some data to the characteristic.
    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>>;

    async fn write_descriptor(&self, descriptor: &Descriptor, data: &[u8]) -> Result<()>;

    /// Enables notify or indicate for the characteristic. Every later value update is handed
    /// to `handler` until [`Central::unsubscribe`] succeeds or the connection ends.
    async fn subscribe(
        &self,
        characteristic: &Characteristic,
        handler: NotificationHandler,
    ) -> Result<()>;

    /// Disables notify or indicate for the specified characteristic.
    async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<()>;

    /// Reads the current signal strength of a connected peripheral.
    async fn read_rssi(&self, peripheral: &PeripheralId) -> Result<i16>;
}
