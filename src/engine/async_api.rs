// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::Engine;
use crate::api::{
    AbruptionHandler, AdapterState, Advertisement, Central, CentralEvent, Characteristic,
    Descriptor, NotificationHandler, PeripheralId, PeripheralState, Service, UuidFilter,
    ValueNotification, WriteType,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::channel::oneshot;
use futures::stream::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Submits a request with the configured deadline and waits for its completion.
macro_rules! submit_and_wait {
    ($self:ident, $submit:ident$(, $arg:expr)*) => {{
        let (sender, receiver) = oneshot::channel();
        $self.$submit($($arg,)* None, Box::new(move |result| {
            let _ = sender.send(result);
        }))?;
        receiver.await.map_err(|_| Error::Dropped)?
    }};
}

#[async_trait]
impl Central for Engine {
    async fn events(&self) -> Result<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>> {
        Ok(self.shared.sessions.event_stream())
    }

    async fn notifications(&self) -> Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>> {
        Ok(self.shared.subscriptions.notification_stream())
    }

    fn adapter_state(&self) -> AdapterState {
        self.shared.transport.state()
    }

    fn current_state(&self, peripheral: &PeripheralId) -> PeripheralState {
        self.peripheral_state(peripheral)
    }

    async fn scan(&self, filter: UuidFilter, duration: Duration) -> Result<Vec<Advertisement>> {
        submit_and_wait!(self, submit_scan, filter, Some(duration))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.shared.scans.abort_all(true);
        Ok(())
    }

    async fn connect(
        &self,
        peripheral: &PeripheralId,
        on_abrupt: Option<AbruptionHandler>,
    ) -> Result<()> {
        submit_and_wait!(self, submit_connect, peripheral, on_abrupt)
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        submit_and_wait!(self, submit_disconnect, peripheral)
    }

    async fn cancel_connect(&self, peripheral: &PeripheralId) -> Result<()> {
        submit_and_wait!(self, submit_cancel_connect, peripheral)
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        filter: UuidFilter,
    ) -> Result<Vec<Service>> {
        submit_and_wait!(self, submit_discover_services, peripheral, filter)
    }

    async fn discover_characteristics(
        &self,
        service: &Service,
        filter: UuidFilter,
    ) -> Result<Vec<Characteristic>> {
        submit_and_wait!(self, submit_discover_characteristics, service, filter)
    }

    async fn discover_descriptors(
        &self,
        characteristic: &Characteristic,
        filter: UuidFilter,
    ) -> Result<Vec<Descriptor>> {
        submit_and_wait!(self, submit_discover_descriptors, characteristic, filter)
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        submit_and_wait!(self, submit_read, characteristic)
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        submit_and_wait!(self, submit_write, characteristic, data, write_type)
    }

    async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        submit_and_wait!(self, submit_read_descriptor, descriptor)
    }

    async fn write_descriptor(&self, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        submit_and_wait!(self, submit_write_descriptor, descriptor, data)
    }

    async fn subscribe(
        &self,
        characteristic: &Characteristic,
        handler: NotificationHandler,
    ) -> Result<()> {
        submit_and_wait!(self, submit_subscribe, characteristic, handler)
    }

    async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<()> {
        submit_and_wait!(self, submit_unsubscribe, characteristic)
    }

    async fn read_rssi(&self, peripheral: &PeripheralId) -> Result<i16> {
        submit_and_wait!(self, submit_read_rssi, peripheral)
    }
}
