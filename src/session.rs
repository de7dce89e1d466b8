// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::api::{AbruptionHandler, CentralEvent, PeripheralId};
use crate::common::util::{broadcast_stream, lock, send_broadcast};
use dashmap::DashMap;
use futures::stream::Stream;
use log::debug;
use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// A connection the engine believes to be live.
pub(crate) struct Session {
    pub peripheral: PeripheralId,
    // Only ever taken out by value when the session closes.
    on_abrupt: Mutex<Option<AbruptionHandler>>,
}

impl Session {
    pub fn into_abruption_handler(self) -> Option<AbruptionHandler> {
        self.on_abrupt
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("peripheral", &self.peripheral)
            .field("on_abrupt", &lock(&self.on_abrupt).is_some())
            .finish()
    }
}

/// Live sessions, plus the broadcast channel for [`CentralEvent`]s. Its locking is separate
/// from the request registries.
#[derive(Debug)]
pub(crate) struct SessionRegistry {
    sessions: DashMap<PeripheralId, Session>,
    events_channel: broadcast::Sender<CentralEvent>,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        let (events_channel, _) = broadcast::channel(capacity.max(1));
        SessionRegistry {
            sessions: DashMap::new(),
            events_channel,
        }
    }

    /// Opens a session. Returns `false`, keeping the existing session and its handler, if
    /// one is already open.
    pub fn open(&self, peripheral: PeripheralId, on_abrupt: Option<AbruptionHandler>) -> bool {
        let mut opened = false;
        self.sessions.entry(peripheral).or_insert_with(|| {
            opened = true;
            Session {
                peripheral,
                on_abrupt: Mutex::new(on_abrupt),
            }
        });
        if opened {
            debug!("Session opened for {}", peripheral);
            self.emit(CentralEvent::DeviceConnected(peripheral));
        }
        opened
    }

    pub fn close(&self, peripheral: &PeripheralId) -> Option<Session> {
        let (_, session) = self.sessions.remove(peripheral)?;
        debug!("Session closed for {}", peripheral);
        self.emit(CentralEvent::DeviceDisconnected(*peripheral));
        Some(session)
    }

    pub fn contains(&self, peripheral: &PeripheralId) -> bool {
        self.sessions.contains_key(peripheral)
    }

    pub fn peripherals(&self) -> Vec<PeripheralId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn emit(&self, event: CentralEvent) {
        send_broadcast(&self.events_channel, event);
    }

    pub fn event_stream(&self) -> Pin<Box<dyn Stream<Item = CentralEvent> + Send>> {
        broadcast_stream(self.events_channel.subscribe())
    }
}
