// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::api::{Characteristic, NotificationHandler, PeripheralId, ValueNotification};
use crate::common::util::{broadcast_stream, lock, send_broadcast};
use crate::dispatch::CallbackQueue;
use crate::fingerprint::Fingerprint;
use dashmap::DashMap;
use futures::stream::Stream;
use log::debug;
use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

type SharedHandler = Arc<Mutex<NotificationHandler>>;

/// Long-lived notification handlers for subscribed characteristics. A subscription outlives
/// the request that created it and ends on unsubscribe or when the session goes away.
pub(crate) struct Subscriptions {
    handlers: DashMap<Fingerprint, SharedHandler>,
    notifications_channel: broadcast::Sender<ValueNotification>,
}

impl Subscriptions {
    pub fn new(capacity: usize) -> Self {
        let (notifications_channel, _) = broadcast::channel(capacity.max(1));
        Subscriptions {
            handlers: DashMap::new(),
            notifications_channel,
        }
    }

    /// Installs a handler, replacing any previous one for the same characteristic.
    pub fn insert(&self, fingerprint: Fingerprint, handler: NotificationHandler) {
        debug!("Subscribed to {}", fingerprint);
        self.handlers
            .insert(fingerprint, Arc::new(Mutex::new(handler)));
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self.handlers.remove(fingerprint).is_some();
        if removed {
            debug!("Unsubscribed from {}", fingerprint);
        }
        removed
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.handlers.contains_key(fingerprint)
    }

    /// Drops every subscription on `peripheral`.
    pub fn remove_peripheral(&self, peripheral: &PeripheralId) {
        self.handlers
            .retain(|fingerprint, _| fingerprint.peripheral() != Some(peripheral));
    }

    /// Routes an unsolicited value update. Returns `false` if the characteristic is not
    /// subscribed.
    pub fn notify(
        &self,
        callbacks: &CallbackQueue,
        characteristic: &Characteristic,
        value: &[u8],
    ) -> bool {
        let handler = match self.handlers.get(&Fingerprint::from(characteristic)) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };
        let notification = ValueNotification {
            characteristic: characteristic.clone(),
            value: value.to_vec(),
        };
        send_broadcast(&self.notifications_channel, notification.clone());
        callbacks.deliver(move || {
            let mut handler = lock(&handler);
            (*handler)(notification);
        });
        true
    }

    pub fn notification_stream(&self) -> Pin<Box<dyn Stream<Item = ValueNotification> + Send>> {
        broadcast_stream(self.notifications_channel.subscribe())
    }
}

impl Debug for Subscriptions {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Subscriptions")
            .field("subscribed", &self.handlers.len())
            .finish()
    }
}
