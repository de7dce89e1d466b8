// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Engine configuration.

use crate::request::RequestKind;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::time::Duration;

/// Default deadlines and channel sizes. Every `submit_*` call may override its deadline.
///
/// With the `serde` feature enabled the struct can be loaded from partial documents; missing
/// fields keep their defaults.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", default)
)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub cancel_connect_timeout: Duration,
    /// Used for service, characteristic and descriptor discovery.
    pub discovery_timeout: Duration,
    /// Used for reads, writes, descriptor access, (un)subscribing and RSSI reads.
    pub io_timeout: Duration,
    /// Scan duration for `submit_scan` calls that pass no duration.
    pub scan_duration: Duration,
    /// Capacity of the event and notification broadcast channels.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            cancel_connect_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(5),
            scan_duration: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// The default deadline for requests of `kind`.
    pub fn timeout_for(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Scan => self.scan_duration,
            RequestKind::Connect => self.connect_timeout,
            RequestKind::Disconnect => self.disconnect_timeout,
            RequestKind::CancelConnect => self.cancel_connect_timeout,
            RequestKind::ServiceDiscovery
            | RequestKind::CharacteristicDiscovery
            | RequestKind::DescriptorDiscovery => self.discovery_timeout,
            RequestKind::Read
            | RequestKind::Write
            | RequestKind::ReadDescriptor
            | RequestKind::WriteDescriptor
            | RequestKind::Subscribe
            | RequestKind::Unsubscribe
            | RequestKind::ReadRssi => self.io_timeout,
        }
    }
}
