// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Joins discovery completions against every discovery request outstanding on the same
//! scope. The transport coalesces discoveries, so one completion may satisfy several
//! requests while others keep waiting for UUIDs that have not shown up yet.

use crate::api::{Characteristic, Descriptor, PeripheralId, Service, TransportError};
use crate::common::util::lock;
use crate::dispatch::CallbackQueue;
use crate::fingerprint::Fingerprint;
use crate::request::{Registry, RequestKind};
use dashmap::DashMap;
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Something discovery can find.
pub(crate) trait Attribute: Clone + Send + 'static {
    fn uuid(&self) -> Uuid;
}

impl Attribute for Service {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl Attribute for Characteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl Attribute for Descriptor {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// Discovery requests of one kind together with everything discovered so far, per scope.
#[derive(Debug)]
pub(crate) struct DiscoveryJoin<A> {
    registry: Arc<Registry<Vec<A>>>,
    cache: DashMap<Fingerprint, BTreeMap<Uuid, A>>,
    // Serializes the merge-then-partition step so concurrent completions on one scope
    // cannot resolve a request against a half-merged cache.
    join: Mutex<()>,
}

impl<A: Attribute> DiscoveryJoin<A> {
    pub fn new(kind: RequestKind) -> Self {
        DiscoveryJoin {
            registry: Arc::new(Registry::new(kind)),
            cache: DashMap::new(),
            join: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry<Vec<A>>> {
        &self.registry
    }

    /// Merges newly discovered items into the scope's cache, then resolves every pending
    /// request on that scope whose filter is satisfied by the cache. Requests still missing
    /// UUIDs stay pending. Returns the number of requests resolved.
    ///
    /// Items for a peripheral that `is_connected` rejects are joined against but not cached,
    /// so a completion that outlives its session leaves nothing behind.
    pub fn on_discovered<F>(
        &self,
        callbacks: &CallbackQueue,
        scope: Fingerprint,
        items: Vec<A>,
        error: Option<TransportError>,
        is_connected: F,
    ) -> usize
    where
        F: FnOnce(&PeripheralId) -> bool,
    {
        let _join = lock(&self.join);
        let cached: BTreeMap<Uuid, A> = if scope.peripheral().is_some_and(is_connected) {
            let mut entry = self.cache.entry(scope.clone()).or_default();
            entry.extend(items.into_iter().map(|item| (item.uuid(), item)));
            entry.clone()
        } else {
            debug!("Not caching discovery on {}, it has no session", scope);
            items.into_iter().map(|item| (item.uuid(), item)).collect()
        };
        let available: BTreeSet<Uuid> = cached.keys().copied().collect();

        let satisfied = self.registry.take_where(|request| {
            request.fingerprint.scope() == &scope
                && request
                    .fingerprint
                    .filter()
                    .is_some_and(|filter| filter.is_satisfied_by(&available))
        });
        trace!(
            "{} join on {}: {} satisfied, {} still pending",
            self.registry.kind(),
            scope,
            satisfied.len(),
            self.registry.len()
        );

        let resolved = satisfied.len();
        for request in satisfied {
            let result = match &error {
                Some(error) => Err(error.clone().into()),
                None => {
                    let filter = request.fingerprint.filter().cloned().unwrap_or_default();
                    Ok(cached
                        .values()
                        .filter(|item| filter.accepts(&item.uuid()))
                        .cloned()
                        .collect())
                }
            };
            request.resolve(callbacks, result);
        }
        resolved
    }

    /// Everything discovered so far on `scope`, ordered by UUID.
    pub fn cached(&self, scope: &Fingerprint) -> Vec<A> {
        self.cache
            .get(scope)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget_peripheral(&self, peripheral: &PeripheralId) {
        let _join = lock(&self.join);
        self.cache
            .retain(|scope, _| scope.peripheral() != Some(peripheral));
    }
}
