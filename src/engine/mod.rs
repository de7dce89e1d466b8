// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The engine ties the registries, the scan aggregator and the session registry to one
//! transport. Every operation is submitted as a request with its own deadline; transport
//! events are routed back to the request they complete.

mod async_api;
mod connection;
mod gatt;

use crate::api::{
    AbruptionHandler, AdapterState, Advertisement, AdvertisementHandler, CentralEvent,
    Characteristic, Completion, Descriptor, NotificationHandler, PeripheralId, Service,
    TransportError, UuidFilter,
};
use crate::common::util::lock;
use crate::config::EngineConfig;
use crate::discovery::DiscoveryJoin;
use crate::dispatch::CallbackQueue;
use crate::fingerprint::Fingerprint;
use crate::request::{Registry, Request, RequestId, RequestIds, RequestKind, TimeoutArbiter};
use crate::scan::{Checkout, ScanAggregator};
use crate::session::SessionRegistry;
use crate::subscription::Subscriptions;
use crate::transport::{Command, Transport, TransportEvent};
use crate::{Error, Result};
use futures::channel::oneshot;
use log::{debug, error, info, trace, warn};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::sleep;

enum LoopMessage {
    Event(TransportEvent),
    Flush(oneshot::Sender<()>),
}

/// Feeds transport events to an [`Engine`]'s event loop. Events are handled one at a time
/// in the order they were sent.
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<LoopMessage>,
}

impl EventSink {
    pub fn send(&self, event: TransportEvent) -> Result<()> {
        self.sender
            .send(LoopMessage::Event(event))
            .map_err(|_| Error::Dropped)
    }
}

impl Debug for EventSink {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Handle to a correlation engine. Clones share the same state; independent engines share
/// nothing.
#[derive(Clone, Debug)]
pub struct Engine {
    shared: Arc<Shared>,
}

struct Shared {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    arbiter: TimeoutArbiter,
    callbacks: CallbackQueue,
    ids: RequestIds,
    // The state most recently announced through `StateUpdate`, kept only to spot
    // transitions. Availability checks ask the transport, which knows before its
    // `StateChanged` event has been handled.
    reported_state: Mutex<AdapterState>,
    loop_sender: mpsc::UnboundedSender<LoopMessage>,
    connects: Arc<Registry<(), Option<AbruptionHandler>>>,
    disconnects: Arc<Registry<()>>,
    cancel_connects: Arc<Registry<()>>,
    services: DiscoveryJoin<Service>,
    characteristics: DiscoveryJoin<Characteristic>,
    descriptors: DiscoveryJoin<Descriptor>,
    reads: Arc<Registry<Vec<u8>>>,
    writes: Arc<Registry<()>>,
    descriptor_reads: Arc<Registry<Vec<u8>>>,
    descriptor_writes: Arc<Registry<()>>,
    subscribes: Arc<Registry<(), Option<NotificationHandler>>>,
    unsubscribes: Arc<Registry<()>>,
    rssi_reads: Arc<Registry<i16>>,
    scans: Arc<ScanAggregator>,
    sessions: SessionRegistry,
    subscriptions: Subscriptions,
}

impl Debug for Shared {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Shared")
            .field("transport", &self.transport)
            .field("reported_state", &*lock(&self.reported_state))
            .field("sessions", &self.sessions)
            .field("scans", &self.scans)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl Engine {
    /// Creates an engine driving `transport`. Must be called from within a tokio runtime,
    /// which runs the engine's timers, event loop and callback delivery.
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Result<Engine> {
        let runtime = Handle::try_current().map_err(|e| Error::Other(Box::new(e)))?;
        let callbacks = CallbackQueue::new(&runtime);
        let (loop_sender, loop_receiver) = mpsc::unbounded_channel();
        let initial_state = transport.state();
        let shared = Arc::new(Shared {
            arbiter: TimeoutArbiter::new(runtime.clone()),
            ids: RequestIds::default(),
            reported_state: Mutex::new(initial_state),
            loop_sender,
            connects: Arc::new(Registry::new(RequestKind::Connect)),
            disconnects: Arc::new(Registry::new(RequestKind::Disconnect)),
            cancel_connects: Arc::new(Registry::new(RequestKind::CancelConnect)),
            services: DiscoveryJoin::new(RequestKind::ServiceDiscovery),
            characteristics: DiscoveryJoin::new(RequestKind::CharacteristicDiscovery),
            descriptors: DiscoveryJoin::new(RequestKind::DescriptorDiscovery),
            reads: Arc::new(Registry::new(RequestKind::Read)),
            writes: Arc::new(Registry::new(RequestKind::Write)),
            descriptor_reads: Arc::new(Registry::new(RequestKind::ReadDescriptor)),
            descriptor_writes: Arc::new(Registry::new(RequestKind::WriteDescriptor)),
            subscribes: Arc::new(Registry::new(RequestKind::Subscribe)),
            unsubscribes: Arc::new(Registry::new(RequestKind::Unsubscribe)),
            rssi_reads: Arc::new(Registry::new(RequestKind::ReadRssi)),
            scans: Arc::new(ScanAggregator::new(transport.clone(), callbacks.clone())),
            sessions: SessionRegistry::new(config.event_capacity),
            subscriptions: Subscriptions::new(config.event_capacity),
            callbacks,
            transport,
            config,
        });
        runtime.spawn(run_event_loop(Arc::downgrade(&shared), loop_receiver));
        debug!("Engine started, adapter is {:?}", initial_state);
        Ok(Engine { shared })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// A sink the transport can push events into from any thread.
    pub fn event_sink(&self) -> EventSink {
        EventSink {
            sender: self.shared.loop_sender.clone(),
        }
    }

    /// Routes one transport event synchronously. Returns
    /// [`Error::UnmatchedEvent`] when a completion that must match an outstanding request
    /// matched nothing; the same condition is also reported as
    /// [`CentralEvent::Desynchronized`].
    pub fn handle_event(&self, event: TransportEvent) -> Result<()> {
        self.shared.handle_event(event)
    }

    /// Waits until every event already sent through an [`EventSink`] has been handled and
    /// every callback queued so far has run.
    pub async fn flush(&self) {
        let (sender, receiver) = oneshot::channel();
        if self.shared.loop_sender.send(LoopMessage::Flush(sender)).is_ok() {
            let _ = receiver.await;
        }
        self.shared.callbacks.flush().await;
    }

    /// Starts, or joins, a scan. `completion` receives the advertisements accepted by
    /// `filter`, one per peripheral sorted by peripheral id, once `duration` has elapsed.
    /// `on_update` sees every accepted advertisement as it arrives.
    pub fn submit_scan(
        &self,
        filter: UuidFilter,
        duration: Option<Duration>,
        on_update: Option<AdvertisementHandler>,
        completion: Completion<Vec<Advertisement>>,
    ) -> Result<RequestId> {
        let shared = &self.shared;
        shared.check_available()?;
        let id = shared.ids.next();
        let duration = duration.unwrap_or(shared.config.scan_duration);
        shared.scans.checkin(id, filter, on_update, completion);
        let scans = shared.scans.clone();
        let timer = shared.arbiter.runtime().spawn(async move {
            sleep(duration).await;
            scans.checkout(id, Checkout::Elapsed);
        });
        shared.scans.attach_timer(id, timer.abort_handle());
        Ok(id)
    }

    /// Stops a single scan request early. Returns `false` if it had already finished.
    pub fn cancel_scan(&self, id: RequestId) -> bool {
        self.shared.scans.checkout(id, Checkout::Aborted)
    }

    /// The filter the transport is currently scanning with, if any.
    pub fn active_scan_filter(&self) -> Option<UuidFilter> {
        self.shared.scans.active_filter()
    }
}

async fn run_event_loop(shared: Weak<Shared>, mut receiver: mpsc::UnboundedReceiver<LoopMessage>) {
    while let Some(message) = receiver.recv().await {
        match message {
            LoopMessage::Event(event) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                // Unmatched events are already reported by handle_event.
                let _ = shared.handle_event(event);
            }
            LoopMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!("Engine event loop finished");
}

impl Shared {
    fn check_available(&self) -> Result<()> {
        let state = self.transport.state();
        if state.is_available() {
            Ok(())
        } else {
            debug!("Rejecting request, adapter is {:?}", state);
            Err(Error::Unavailable(state))
        }
    }

    fn check_connected(&self, peripheral: &PeripheralId) -> Result<()> {
        if self.sessions.contains(peripheral) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Inserts a request, arms its deadline and issues its command. A command rejected by
    /// the transport resolves the request with the rejection.
    fn submit<T, C>(
        self: &Arc<Self>,
        registry: &Arc<Registry<T, C>>,
        fingerprint: Fingerprint,
        context: C,
        command: Command,
        timeout: Option<Duration>,
        completion: Completion<T>,
    ) -> RequestId
    where
        T: Send + 'static,
        C: Send + 'static,
    {
        let id = self.ids.next();
        let kind = registry.kind();
        let timeout = timeout.unwrap_or_else(|| self.config.timeout_for(kind));
        registry.insert(id, fingerprint, context, completion);

        let engine = Arc::downgrade(self);
        let callbacks = self.callbacks.clone();
        self.arbiter
            .arm(registry, id, timeout, move |request: Request<T, C>| {
                let peripheral = request.fingerprint.peripheral().copied();
                request.resolve(&callbacks, Err(Error::TimedOut(timeout)));
                if kind.compensates_on_timeout() {
                    if let (Some(engine), Some(peripheral)) = (engine.upgrade(), peripheral) {
                        engine.compensate(kind, peripheral);
                    }
                }
            });

        trace!("Issuing {:?} for {} request {}", command, kind, id);
        if let Err(e) = self.transport.issue(command) {
            warn!("Transport rejected {} request {}: {}", kind, id, e);
            if let Some(request) = registry.take(id) {
                request.resolve(&self.callbacks, Err(e));
            }
        }
        id
    }

    /// Cleans up transport work left behind by a request that timed out.
    fn compensate(self: &Arc<Self>, kind: RequestKind, peripheral: PeripheralId) {
        if kind != RequestKind::Connect {
            return;
        }
        info!("Cancelling timed out connection attempt to {}", peripheral);
        self.submit(
            &self.cancel_connects,
            (&peripheral).into(),
            (),
            Command::CancelConnect(peripheral),
            None,
            Box::new(move |result: Result<()>| match result {
                Ok(()) => debug!("Connection attempt to {} cancelled", peripheral),
                Err(e) => warn!("Cancelling connection attempt to {} failed: {}", peripheral, e),
            }),
        );
    }

    /// Reports a completion that should have matched a request but did not.
    fn unmatched(&self, kind: RequestKind, fingerprint: Fingerprint) -> Result<()> {
        error!(
            "Transport reported a {} completion for {} with no outstanding request",
            kind, fingerprint
        );
        self.sessions.emit(CentralEvent::Desynchronized {
            kind,
            fingerprint: fingerprint.clone(),
        });
        Err(Error::UnmatchedEvent { kind, fingerprint })
    }

    /// Resolves the oldest request in `registry` for `fingerprint`.
    fn resolve_single<T, C>(
        &self,
        registry: &Registry<T, C>,
        fingerprint: Fingerprint,
        result: Result<T>,
    ) -> Result<()>
    where
        T: Send + 'static,
    {
        match registry.take_first(&fingerprint) {
            Some(request) => {
                debug!("{} request {} resolved", registry.kind(), request.id);
                request.resolve(&self.callbacks, result);
                Ok(())
            }
            None => self.unanswered(registry, fingerprint),
        }
    }

    /// Accounts for a completion that found no pending request. A completion for a request
    /// that already timed out is only late.
    fn unanswered<T, C>(&self, registry: &Registry<T, C>, fingerprint: Fingerprint) -> Result<()>
    where
        T: Send + 'static,
    {
        let kind = registry.kind();
        if registry.take_expired(&fingerprint) {
            warn!("{} completion for {} arrived after its request timed out", kind, fingerprint);
            Ok(())
        } else if kind.requires_match() {
            self.unmatched(kind, fingerprint)
        } else {
            debug!("{} completion for {} matched nothing", kind, fingerprint);
            Ok(())
        }
    }

    fn handle_event(&self, event: TransportEvent) -> Result<()> {
        trace!("Transport event: {:?}", event);
        match event {
            TransportEvent::StateChanged(state) => {
                self.on_state_changed(state);
                Ok(())
            }
            TransportEvent::Advertisement(advertisement) => {
                let peripheral = advertisement.peripheral;
                if self.scans.on_advertisement(advertisement) {
                    self.sessions
                        .emit(CentralEvent::DeviceDiscovered(peripheral));
                }
                Ok(())
            }
            TransportEvent::Connected(peripheral) => {
                self.on_connected(peripheral);
                Ok(())
            }
            TransportEvent::ConnectFailed(peripheral, error) => {
                self.on_connect_failed(peripheral, error);
                Ok(())
            }
            TransportEvent::Disconnected(peripheral, error) => {
                self.on_disconnected(peripheral, error);
                Ok(())
            }
            TransportEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => {
                self.services.on_discovered(
                    &self.callbacks,
                    (&peripheral).into(),
                    services,
                    error,
                    |p| self.sessions.contains(p),
                );
                Ok(())
            }
            TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                error,
            } => {
                self.characteristics.on_discovered(
                    &self.callbacks,
                    (&service).into(),
                    characteristics,
                    error,
                    |p| self.sessions.contains(p),
                );
                Ok(())
            }
            TransportEvent::DescriptorsDiscovered {
                characteristic,
                descriptors,
                error,
            } => {
                self.descriptors.on_discovered(
                    &self.callbacks,
                    (&characteristic).into(),
                    descriptors,
                    error,
                    |p| self.sessions.contains(p),
                );
                Ok(())
            }
            TransportEvent::ValueUpdated {
                characteristic,
                value,
                error,
            } => self.on_value_updated(characteristic, value, error),
            TransportEvent::ValueWritten {
                characteristic,
                error,
            } => self.resolve_single(&self.writes, (&characteristic).into(), outcome((), error)),
            TransportEvent::DescriptorValueUpdated {
                descriptor,
                value,
                error,
            } => self.resolve_single(
                &self.descriptor_reads,
                (&descriptor).into(),
                outcome(value, error),
            ),
            TransportEvent::DescriptorValueWritten { descriptor, error } => self.resolve_single(
                &self.descriptor_writes,
                (&descriptor).into(),
                outcome((), error),
            ),
            TransportEvent::NotifyStateChanged {
                characteristic,
                enabled,
                error,
            } => self.on_notify_state_changed(characteristic, enabled, error),
            TransportEvent::RssiRead {
                peripheral,
                rssi,
                error,
            } => self.resolve_single(&self.rssi_reads, (&peripheral).into(), outcome(rssi, error)),
        }
    }

    fn on_state_changed(&self, state: AdapterState) {
        let previous = std::mem::replace(&mut *lock(&self.reported_state), state);
        if previous == state {
            return;
        }
        info!("Adapter state changed from {:?} to {:?}", previous, state);
        self.sessions.emit(CentralEvent::StateUpdate(state));
        if !state.is_available() {
            self.scans.abort_all(false);
        }
    }
}

/// Turns an event's optional error payload into a request result.
fn outcome<T>(value: T, error: Option<TransportError>) -> Result<T> {
    match error {
        Some(error) => Err(error.into()),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;

    #[tokio::test]
    async fn unavailable_adapter_rejects_without_creating_requests() {
        let transport = Arc::new(RecordingTransport::new(AdapterState::PoweredOff));
        let engine = Engine::new(transport.clone(), EngineConfig::default()).unwrap();
        let result = engine.submit_scan(
            UuidFilter::Any,
            None,
            None,
            Box::new(|_: Result<Vec<Advertisement>>| {}),
        );
        assert!(matches!(result, Err(Error::Unavailable(AdapterState::PoweredOff))));
        assert!(transport.commands().is_empty());
        assert_eq!(engine.shared.scans.len(), 0);
    }

    #[tokio::test]
    async fn event_sink_events_are_handled_before_flush_returns() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = Engine::new(transport, EngineConfig::default()).unwrap();
        let sink = engine.event_sink();
        sink.send(TransportEvent::StateChanged(AdapterState::Resetting))
            .unwrap();
        engine.flush().await;
        assert_eq!(
            *lock(&engine.shared.reported_state),
            AdapterState::Resetting
        );
    }

    #[test]
    fn outcome_prefers_the_error() {
        assert!(matches!(outcome(1, None), Ok(1)));
        assert!(matches!(
            outcome(1, Some(TransportError::new("nope"))),
            Err(Error::Transport(_))
        ));
    }
}
