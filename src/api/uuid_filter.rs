// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! UUID sets used to filter scans and discoveries, and helpers for BLE short UUIDs.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 32-bit BLE short UUID to a full 128-bit UUID by filling in the standard Bluetooth Base
/// UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID by filling in the standard Bluetooth Base
/// UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// An extension trait for `Uuid` which provides BLE-specific methods.
pub trait BleUuid {
    /// If the UUID is a valid 16-bit BLE short UUID then return its short form, otherwise return
    /// `None`.
    fn to_ble_u16(&self) -> Option<u16>;

    /// Convert the UUID to a string, using short format if applicable.
    fn to_short_string(&self) -> String;
}

impl BleUuid for Uuid {
    fn to_ble_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn to_short_string(&self) -> String {
        let value = self.as_u128();
        if let Some(uuid16) = self.to_ble_u16() {
            format!("{:#06x}", uuid16)
        } else if value & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID {
            format!("{:#010x}", (value >> 96) as u32)
        } else {
            self.to_string()
        }
    }
}

/// A set of UUIDs restricting a scan or a discovery, or [`UuidFilter::Any`] for no restriction.
///
/// The set is kept sorted so that two filters naming the same UUIDs compare and hash equal
/// regardless of the order they were given in.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UuidFilter {
    #[default]
    Any,
    Only(BTreeSet<Uuid>),
}

impl UuidFilter {
    pub fn only<I: IntoIterator<Item = Uuid>>(uuids: I) -> Self {
        UuidFilter::Only(uuids.into_iter().collect())
    }

    pub fn is_any(&self) -> bool {
        matches!(self, UuidFilter::Any)
    }

    pub fn uuids(&self) -> Option<&BTreeSet<Uuid>> {
        match self {
            UuidFilter::Any => None,
            UuidFilter::Only(uuids) => Some(uuids),
        }
    }

    /// Whether a single UUID passes the filter.
    pub fn accepts(&self, uuid: &Uuid) -> bool {
        match self {
            UuidFilter::Any => true,
            UuidFilter::Only(uuids) => uuids.contains(uuid),
        }
    }

    /// Scan matching: an advertisement passes if the filter is unrestricted or shares at least
    /// one UUID with the advertised set.
    pub fn overlaps(&self, advertised: &BTreeSet<Uuid>) -> bool {
        match self {
            UuidFilter::Any => true,
            UuidFilter::Only(uuids) => !uuids.is_disjoint(advertised),
        }
    }

    /// Discovery matching: satisfied once every requested UUID is available.
    pub fn is_satisfied_by(&self, available: &BTreeSet<Uuid>) -> bool {
        match self {
            UuidFilter::Any => true,
            UuidFilter::Only(uuids) => uuids.is_subset(available),
        }
    }

    /// Combines the filters of several concurrent requests into the one filter that serves
    /// them all: unrestricted if any of them is, otherwise the union of their UUIDs. Returns
    /// `None` when there are no filters at all.
    pub fn union<'a, I>(filters: I) -> Option<UuidFilter>
    where
        I: IntoIterator<Item = &'a UuidFilter>,
    {
        let mut combined: Option<BTreeSet<Uuid>> = None;
        for filter in filters {
            match filter {
                UuidFilter::Any => return Some(UuidFilter::Any),
                UuidFilter::Only(uuids) => combined
                    .get_or_insert_with(BTreeSet::new)
                    .extend(uuids.iter().copied()),
            }
        }
        combined.map(UuidFilter::Only)
    }
}

impl From<Option<Vec<Uuid>>> for UuidFilter {
    fn from(uuids: Option<Vec<Uuid>>) -> Self {
        match uuids {
            None => UuidFilter::Any,
            Some(uuids) => UuidFilter::only(uuids),
        }
    }
}

impl FromIterator<Uuid> for UuidFilter {
    fn from_iter<I: IntoIterator<Item = Uuid>>(iter: I) -> Self {
        UuidFilter::only(iter)
    }
}

impl Display for UuidFilter {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            UuidFilter::Any => write!(f, "*"),
            UuidFilter::Only(uuids) => {
                write!(f, "{{")?;
                for (i, uuid) in uuids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", uuid.to_short_string())?;
                }
                write!(f, "}}")
            }
        }
    }
}
