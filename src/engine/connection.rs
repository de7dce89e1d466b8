// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{outcome, Engine, Shared};
use crate::api::{
    AbruptionHandler, CentralEvent, Completion, PeripheralId, PeripheralState, TransportError,
};
use crate::fingerprint::Fingerprint;
use crate::request::RequestId;
use crate::session::Session;
use crate::transport::Command;
use crate::Result;
use log::{debug, info, warn};
use std::time::Duration;

impl Engine {
    /// Connects to `peripheral`. Once connected, `on_abrupt` is called if the link later drops
    /// without being asked to. Connecting to a peripheral that is already connected completes
    /// straight away and keeps the existing session.
    pub fn submit_connect(
        &self,
        peripheral: &PeripheralId,
        on_abrupt: Option<AbruptionHandler>,
        timeout: Option<Duration>,
        completion: Completion<()>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        if shared.sessions.contains(peripheral) {
            debug!("{} is already connected", peripheral);
            shared.callbacks.deliver(move || completion(Ok(())));
            return Ok(shared.ids.next());
        }
        Ok(shared.submit(
            &shared.connects,
            peripheral.into(),
            on_abrupt,
            Command::Connect(*peripheral),
            timeout,
            completion,
        ))
    }

    pub fn submit_disconnect(
        &self,
        peripheral: &PeripheralId,
        timeout: Option<Duration>,
        completion: Completion<()>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        Ok(shared.submit(
            &shared.disconnects,
            peripheral.into(),
            (),
            Command::Disconnect(*peripheral),
            timeout,
            completion,
        ))
    }

    /// Cancels a connection attempt. Outstanding connect requests are not retracted; they
    /// resolve through whatever the transport reports next.
    pub fn submit_cancel_connect(
        &self,
        peripheral: &PeripheralId,
        timeout: Option<Duration>,
        completion: Completion<()>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        Ok(shared.submit(
            &shared.cancel_connects,
            peripheral.into(),
            (),
            Command::CancelConnect(*peripheral),
            timeout,
            completion,
        ))
    }

    pub(super) fn peripheral_state(&self, peripheral: &PeripheralId) -> PeripheralState {
        let shared = &self.shared;
        if shared.sessions.contains(peripheral) {
            PeripheralState::Connected
        } else if shared.connects.contains(&peripheral.into()) {
            PeripheralState::Connecting
        } else {
            PeripheralState::Disconnected
        }
    }

    /// Peripherals with a live session.
    pub fn connected_peripherals(&self) -> Vec<PeripheralId> {
        self.shared.sessions.peripherals()
    }
}

impl Shared {
    /// Every outstanding connect for the peripheral completes; the first abruption handler
    /// supplied becomes the session's.
    pub(super) fn on_connected(&self, peripheral: PeripheralId) {
        let fingerprint = Fingerprint::Peripheral(peripheral);
        let mut pending = self
            .connects
            .take_where(|request| request.fingerprint == fingerprint);
        if pending.is_empty() {
            warn!(
                "Ignoring connect completion for {}, no connect is outstanding",
                peripheral
            );
            return;
        }
        let on_abrupt = pending
            .iter_mut()
            .find_map(|request| request.context.take());
        if self.sessions.open(peripheral, on_abrupt) {
            info!("Connected to {}", peripheral);
            self.forget_attributes(&peripheral);
        }
        for request in pending {
            request.resolve(&self.callbacks, Ok(()));
        }
    }

    pub(super) fn on_connect_failed(&self, peripheral: PeripheralId, error: TransportError) {
        let fingerprint = Fingerprint::Peripheral(peripheral);
        let pending = self
            .connects
            .take_where(|request| request.fingerprint == fingerprint);
        if pending.is_empty() {
            warn!(
                "Ignoring connect failure for {} ({}), no connect is outstanding",
                peripheral, error
            );
            return;
        }
        info!("Connecting to {} failed: {}", peripheral, error);
        for request in pending {
            request.resolve(&self.callbacks, Err(error.clone().into()));
        }
    }

    /// Works out why a link went down. Exactly one cause applies, checked in this order: an
    /// error on a live session is an abruption, then an outstanding disconnect, then an
    /// outstanding cancel-connect.
    pub(super) fn on_disconnected(&self, peripheral: PeripheralId, error: Option<TransportError>) {
        let fingerprint = Fingerprint::Peripheral(peripheral);

        if let Some(error) = &error {
            if let Some(session) = self.teardown(&peripheral) {
                warn!("Connection to {} lost: {}", peripheral, error);
                if let Some(on_abrupt) = session.into_abruption_handler() {
                    let error = error.clone();
                    self.callbacks.deliver(move || on_abrupt(error));
                }
                self.sessions.emit(CentralEvent::ConnectionLost {
                    id: peripheral,
                    error: error.clone(),
                });
                return;
            }
        }

        let disconnects = self
            .disconnects
            .take_where(|request| request.fingerprint == fingerprint);
        if !disconnects.is_empty() {
            self.teardown(&peripheral);
            debug!("Disconnected from {}", peripheral);
            for request in disconnects {
                request.resolve(&self.callbacks, outcome((), error.clone()));
            }
            return;
        }

        let cancels = self
            .cancel_connects
            .take_where(|request| request.fingerprint == fingerprint);
        if !cancels.is_empty() {
            self.teardown(&peripheral);
            debug!("Connection attempt to {} cancelled", peripheral);
            for request in cancels {
                request.resolve(&self.callbacks, outcome((), error.clone()));
            }
            return;
        }

        if self.teardown(&peripheral).is_some() {
            warn!(
                "{} disconnected without error or request, dropping its stale session",
                peripheral
            );
        } else {
            warn!(
                "Disconnect for {} matched no session or request ({:?})",
                peripheral, error
            );
        }
    }

    /// Closes a session along with everything that only lives as long as it does.
    pub(super) fn teardown(&self, peripheral: &PeripheralId) -> Option<Session> {
        let session = self.sessions.close(peripheral)?;
        self.subscriptions.remove_peripheral(peripheral);
        self.forget_attributes(peripheral);
        Some(session)
    }

    fn forget_attributes(&self, peripheral: &PeripheralId) {
        self.services.forget_peripheral(peripheral);
        self.characteristics.forget_peripheral(peripheral);
        self.descriptors.forget_peripheral(peripheral);
    }
}
