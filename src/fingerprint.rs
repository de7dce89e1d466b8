// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Correlation keys shared by requests and the transport events that resolve them.

use crate::api::{BleUuid, Characteristic, Descriptor, PeripheralId, Service, UuidFilter};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Identity of the resource a request targets.
///
/// Fingerprints are pure functions of their inputs: the same peripheral, attribute path and
/// filter always give equal fingerprints, whichever object they were derived from.
/// Characteristic properties are not part of the identity.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Fingerprint {
    Peripheral(PeripheralId),
    Service {
        peripheral: PeripheralId,
        service: Uuid,
    },
    Characteristic {
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    },
    Descriptor {
        peripheral: PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    /// A discovery request: the scope being discovered plus the UUIDs it waits for.
    Filtered {
        scope: Box<Fingerprint>,
        filter: UuidFilter,
    },
    /// A scan request, which has no peripheral scope.
    Scan(UuidFilter),
}

impl Fingerprint {
    pub fn filtered(scope: Fingerprint, filter: UuidFilter) -> Self {
        Fingerprint::Filtered {
            scope: Box::new(scope),
            filter,
        }
    }

    /// The peripheral this fingerprint belongs to, if any.
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            Fingerprint::Peripheral(peripheral)
            | Fingerprint::Service { peripheral, .. }
            | Fingerprint::Characteristic { peripheral, .. }
            | Fingerprint::Descriptor { peripheral, .. } => Some(peripheral),
            Fingerprint::Filtered { scope, .. } => scope.peripheral(),
            Fingerprint::Scan(_) => None,
        }
    }

    /// The scope of a discovery fingerprint, or the fingerprint itself for everything else.
    pub fn scope(&self) -> &Fingerprint {
        match self {
            Fingerprint::Filtered { scope, .. } => scope,
            other => other,
        }
    }

    pub fn filter(&self) -> Option<&UuidFilter> {
        match self {
            Fingerprint::Filtered { filter, .. } | Fingerprint::Scan(filter) => Some(filter),
            _ => None,
        }
    }
}

impl From<&PeripheralId> for Fingerprint {
    fn from(peripheral: &PeripheralId) -> Self {
        Fingerprint::Peripheral(*peripheral)
    }
}

impl From<&Service> for Fingerprint {
    fn from(service: &Service) -> Self {
        Fingerprint::Service {
            peripheral: service.peripheral,
            service: service.uuid,
        }
    }
}

impl From<&Characteristic> for Fingerprint {
    fn from(characteristic: &Characteristic) -> Self {
        Fingerprint::Characteristic {
            peripheral: characteristic.peripheral,
            service: characteristic.service_uuid,
            characteristic: characteristic.uuid,
        }
    }
}

impl From<&Descriptor> for Fingerprint {
    fn from(descriptor: &Descriptor) -> Self {
        Fingerprint::Descriptor {
            peripheral: descriptor.peripheral,
            service: descriptor.service_uuid,
            characteristic: descriptor.characteristic_uuid,
            descriptor: descriptor.uuid,
        }
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Fingerprint::Peripheral(peripheral) => write!(f, "{}", peripheral),
            Fingerprint::Service {
                peripheral,
                service,
            } => write!(f, "{}/{}", peripheral, service.to_short_string()),
            Fingerprint::Characteristic {
                peripheral,
                service,
                characteristic,
            } => write!(
                f,
                "{}/{}/{}",
                peripheral,
                service.to_short_string(),
                characteristic.to_short_string()
            ),
            Fingerprint::Descriptor {
                peripheral,
                service,
                characteristic,
                descriptor,
            } => write!(
                f,
                "{}/{}/{}/{}",
                peripheral,
                service.to_short_string(),
                characteristic.to_short_string(),
                descriptor.to_short_string()
            ),
            Fingerprint::Filtered { scope, filter } => write!(f, "{} {}", scope, filter),
            Fingerprint::Scan(filter) => write!(f, "scan {}", filter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{uuid_from_u16, CharPropFlags};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(fingerprint: &Fingerprint) -> u64 {
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        hasher.finish()
    }

    fn characteristic(properties: CharPropFlags) -> Characteristic {
        Characteristic {
            peripheral: PeripheralId::from_uuid(Uuid::from_u128(7)),
            service_uuid: uuid_from_u16(0x180d),
            uuid: uuid_from_u16(0x2a37),
            properties,
        }
    }

    #[test]
    fn equal_targets_give_equal_fingerprints() {
        let a = Fingerprint::from(&characteristic(CharPropFlags::NOTIFY));
        let b = Fingerprint::from(&characteristic(CharPropFlags::READ));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn filtered_fingerprints_ignore_uuid_order() {
        let peripheral = PeripheralId::from_uuid(Uuid::from_u128(1));
        let a = Fingerprint::filtered(
            (&peripheral).into(),
            UuidFilter::only([uuid_from_u16(1), uuid_from_u16(2)]),
        );
        let b = Fingerprint::filtered(
            (&peripheral).into(),
            UuidFilter::only([uuid_from_u16(2), uuid_from_u16(1)]),
        );
        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::filtered((&peripheral).into(), UuidFilter::Any));
    }

    #[test]
    fn scope_and_peripheral_of_nested_fingerprints() {
        let c = characteristic(CharPropFlags::empty());
        let scope = Fingerprint::from(&c);
        let discovery = Fingerprint::filtered(scope.clone(), UuidFilter::Any);
        assert_eq!(discovery.scope(), &scope);
        assert_eq!(discovery.peripheral(), Some(&c.peripheral));
        assert_eq!(Fingerprint::Scan(UuidFilter::Any).peripheral(), None);
    }
}
