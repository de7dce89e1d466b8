// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{outcome, Engine, Shared};
use crate::api::{
    Characteristic, Completion, Descriptor, NotificationHandler, PeripheralId, Service,
    TransportError, UuidFilter, WriteType,
};
use crate::fingerprint::Fingerprint;
use crate::request::RequestId;
use crate::transport::Command;
use crate::{Error, Result};
use log::{debug, trace, warn};
use std::time::Duration;

impl Engine {
    /// Discovers services on a connected peripheral. Completes once every UUID in `filter`
    /// has been discovered, with the discovered services that `filter` accepts.
    pub fn submit_discover_services(
        &self,
        peripheral: &PeripheralId,
        filter: UuidFilter,
        timeout: Option<Duration>,
        completion: Completion<Vec<Service>>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(peripheral)?;
        let command = Command::DiscoverServices(*peripheral, filter.clone());
        Ok(shared.submit(
            shared.services.registry(),
            Fingerprint::filtered(peripheral.into(), filter),
            (),
            command,
            timeout,
            completion,
        ))
    }

    pub fn submit_discover_characteristics(
        &self,
        service: &Service,
        filter: UuidFilter,
        timeout: Option<Duration>,
        completion: Completion<Vec<Characteristic>>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(&service.peripheral)?;
        let command = Command::DiscoverCharacteristics(service.clone(), filter.clone());
        Ok(shared.submit(
            shared.characteristics.registry(),
            Fingerprint::filtered(service.into(), filter),
            (),
            command,
            timeout,
            completion,
        ))
    }

    pub fn submit_discover_descriptors(
        &self,
        characteristic: &Characteristic,
        filter: UuidFilter,
        timeout: Option<Duration>,
        completion: Completion<Vec<Descriptor>>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(&characteristic.peripheral)?;
        let command = Command::DiscoverDescriptors(characteristic.clone(), filter.clone());
        Ok(shared.submit(
            shared.descriptors.registry(),
            Fingerprint::filtered(characteristic.into(), filter),
            (),
            command,
            timeout,
            completion,
        ))
    }

    /// Services discovered so far on a peripheral, ordered by UUID.
    pub fn services(&self, peripheral: &PeripheralId) -> Vec<Service> {
        self.shared.services.cached(&peripheral.into())
    }

    /// Characteristics discovered so far on a service, ordered by UUID.
    pub fn characteristics(&self, service: &Service) -> Vec<Characteristic> {
        self.shared.characteristics.cached(&service.into())
    }

    pub fn is_subscribed(&self, characteristic: &Characteristic) -> bool {
        self.shared.subscriptions.contains(&characteristic.into())
    }

    pub fn submit_read(
        &self,
        characteristic: &Characteristic,
        timeout: Option<Duration>,
        completion: Completion<Vec<u8>>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(&characteristic.peripheral)?;
        Ok(shared.submit(
            &shared.reads,
            characteristic.into(),
            (),
            Command::Read(characteristic.clone()),
            timeout,
            completion,
        ))
    }

    /// Writes `data`. A [`WriteType::WithoutResponse`] write gets no acknowledgement from
    /// the peripheral, so it completes as soon as the transport accepts it.
    pub fn submit_write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
        timeout: Option<Duration>,
        completion: Completion<()>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(&characteristic.peripheral)?;
        let command = Command::Write(characteristic.clone(), data.to_vec(), write_type);
        match write_type {
            WriteType::WithResponse => Ok(shared.submit(
                &shared.writes,
                characteristic.into(),
                (),
                command,
                timeout,
                completion,
            )),
            WriteType::WithoutResponse => {
                trace!("Issuing {:?} without tracking", command);
                let result = shared.transport.issue(command);
                shared.callbacks.deliver(move || completion(result));
                Ok(shared.ids.next())
            }
        }
    }

    pub fn submit_read_descriptor(
        &self,
        descriptor: &Descriptor,
        timeout: Option<Duration>,
        completion: Completion<Vec<u8>>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(&descriptor.peripheral)?;
        Ok(shared.submit(
            &shared.descriptor_reads,
            descriptor.into(),
            (),
            Command::ReadDescriptor(descriptor.clone()),
            timeout,
            completion,
        ))
    }

    pub fn submit_write_descriptor(
        &self,
        descriptor: &Descriptor,
        data: &[u8],
        timeout: Option<Duration>,
        completion: Completion<()>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(&descriptor.peripheral)?;
        Ok(shared.submit(
            &shared.descriptor_writes,
            descriptor.into(),
            (),
            Command::WriteDescriptor(descriptor.clone(), data.to_vec()),
            timeout,
            completion,
        ))
    }

    /// Enables notifications. Once the transport confirms, `handler` receives every value
    /// update for the characteristic until it is unsubscribed or the session ends.
    pub fn submit_subscribe(
        &self,
        characteristic: &Characteristic,
        handler: NotificationHandler,
        timeout: Option<Duration>,
        completion: Completion<()>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(&characteristic.peripheral)?;
        if !characteristic.supports_notify() {
            return Err(Error::NotSupported(format!(
                "{} supports neither notify nor indicate",
                Fingerprint::from(characteristic)
            )));
        }
        Ok(shared.submit(
            &shared.subscribes,
            characteristic.into(),
            Some(handler),
            Command::SetNotify(characteristic.clone(), true),
            timeout,
            completion,
        ))
    }

    pub fn submit_unsubscribe(
        &self,
        characteristic: &Characteristic,
        timeout: Option<Duration>,
        completion: Completion<()>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(&characteristic.peripheral)?;
        Ok(shared.submit(
            &shared.unsubscribes,
            characteristic.into(),
            (),
            Command::SetNotify(characteristic.clone(), false),
            timeout,
            completion,
        ))
    }

    pub fn submit_read_rssi(
        &self,
        peripheral: &PeripheralId,
        timeout: Option<Duration>,
        completion: Completion<i16>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        shared.check_connected(peripheral)?;
        Ok(shared.submit(
            &shared.rssi_reads,
            peripheral.into(),
            (),
            Command::ReadRssi(*peripheral),
            timeout,
            completion,
        ))
    }
}

impl Shared {
    /// A value update is a notification if the characteristic is subscribed, and a read
    /// response otherwise. Errors are never notifications.
    pub(super) fn on_value_updated(
        &self,
        characteristic: Characteristic,
        value: Vec<u8>,
        error: Option<TransportError>,
    ) -> Result<()> {
        if error.is_none() && self.subscriptions.notify(&self.callbacks, &characteristic, &value)
        {
            return Ok(());
        }
        self.resolve_single(&self.reads, (&characteristic).into(), outcome(value, error))
    }

    pub(super) fn on_notify_state_changed(
        &self,
        characteristic: Characteristic,
        enabled: bool,
        error: Option<TransportError>,
    ) -> Result<()> {
        let fingerprint = Fingerprint::from(&characteristic);

        if let Some(error) = error {
            // The enabled flag reports the unchanged state here, so it cannot tell a failed
            // subscribe from a failed unsubscribe.
            if let Some(request) = self.subscribes.take_first(&fingerprint) {
                request.resolve(&self.callbacks, Err(error.into()));
                return Ok(());
            }
            return self.resolve_single(&self.unsubscribes, fingerprint, Err(error.into()));
        }

        if enabled {
            let Some(mut request) = self.subscribes.take_first(&fingerprint) else {
                return self.unanswered(&self.subscribes, fingerprint);
            };
            let result = match request.context.take() {
                Some(handler) if self.sessions.contains(&characteristic.peripheral) => {
                    self.subscriptions.insert(fingerprint, handler);
                    Ok(())
                }
                Some(_) => {
                    warn!(
                        "Subscribed to {} after its session closed",
                        characteristic.uuid
                    );
                    Err(Error::NotConnected)
                }
                None => Ok(()),
            };
            request.resolve(&self.callbacks, result);
            Ok(())
        } else {
            let Some(request) = self.unsubscribes.take_first(&fingerprint) else {
                return self.unanswered(&self.unsubscribes, fingerprint);
            };
            if !self.subscriptions.remove(&fingerprint) {
                debug!("Unsubscribed from {}, which had no subscription", fingerprint);
            }
            request.resolve(&self.callbacks, Ok(()));
            Ok(())
        }
    }
}
