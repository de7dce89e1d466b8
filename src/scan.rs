// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Lets any number of scan requests share one physical scan. The transport always scans
//! with the union of the outstanding filters, and each advertisement is fanned out to every
//! request whose filter it matches.

use crate::api::{Advertisement, AdvertisementHandler, Completion, PeripheralId, UuidFilter};
use crate::common::util::lock;
use crate::dispatch::CallbackQueue;
use crate::fingerprint::Fingerprint;
use crate::request::RequestId;
use crate::transport::{Command, Transport};
use crate::{Error, Result};
use dashmap::DashSet;
use log::{debug, trace, warn};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

/// How a scan request left the aggregator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Checkout {
    /// Its duration elapsed; it completes with what it found.
    Elapsed,
    /// It was stopped early; it fails with [`Error::ScanAborted`].
    Aborted,
}

struct ScanRequest {
    filter: UuidFilter,
    found: BTreeMap<PeripheralId, Advertisement>,
    on_update: Option<Arc<Mutex<AdvertisementHandler>>>,
    completion: Completion<Vec<Advertisement>>,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct ScanState {
    requests: BTreeMap<RequestId, ScanRequest>,
    // The filter most recently handed to the transport, or `None` if stopped.
    active: Option<UuidFilter>,
}

impl ScanState {
    fn union(&self) -> Option<UuidFilter> {
        UuidFilter::union(self.requests.values().map(|request| &request.filter))
    }
}

/// A scan started on behalf of a check-in. If the transport rejects it, the request fails
/// and the aggregator goes back to `previous`.
struct Started {
    id: RequestId,
    filter: UuidFilter,
    previous: Option<UuidFilter>,
}

struct Outgoing {
    command: Command,
    started: Option<Started>,
}

#[derive(Default)]
struct Outbox {
    pending: VecDeque<Outgoing>,
    draining: bool,
}

pub(crate) struct ScanAggregator {
    transport: Arc<dyn Transport>,
    callbacks: CallbackQueue,
    state: Mutex<ScanState>,
    // Commands are queued while `state` is held and issued after it is released, by
    // whichever caller finds the outbox idle. Lock order is `state` then `outbox`.
    outbox: Mutex<Outbox>,
    sequence: AtomicU64,
    seen: DashSet<PeripheralId>,
}

impl ScanAggregator {
    pub fn new(transport: Arc<dyn Transport>, callbacks: CallbackQueue) -> Self {
        ScanAggregator {
            transport,
            callbacks,
            state: Mutex::new(ScanState::default()),
            outbox: Mutex::new(Outbox::default()),
            sequence: AtomicU64::new(0),
            seen: DashSet::new(),
        }
    }

    /// The filter the transport is currently scanning with, if it is scanning at all.
    pub fn active_filter(&self) -> Option<UuidFilter> {
        lock(&self.state).active.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).requests.len()
    }

    fn enqueue(&self, command: Command, started: Option<Started>) {
        lock(&self.outbox)
            .pending
            .push_back(Outgoing { command, started });
    }

    /// Issues queued commands in order, with no lock held across the transport call. A
    /// caller that finds another drain in progress (on this thread or another) leaves its
    /// commands to that drain.
    fn drain(&self) {
        {
            let mut outbox = lock(&self.outbox);
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let next = {
                let mut outbox = lock(&self.outbox);
                match outbox.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };
            trace!("Issuing {:?}", next.command);
            if let Err(e) = self.transport.issue(next.command) {
                match next.started {
                    Some(started) => self.on_start_rejected(started, e),
                    None => warn!("Transport rejected scan update: {}", e),
                }
            }
        }
    }

    fn on_start_rejected(&self, started: Started, error: Error) {
        warn!("Transport rejected scan for request {}: {}", started.id, error);
        let request = {
            let mut state = lock(&self.state);
            if state.active.as_ref() == Some(&started.filter) {
                state.active = started.previous;
            }
            let request = state.requests.remove(&started.id);
            self.reissue(&mut state);
            request
        };
        if let Some(request) = request {
            if let Some(timer) = request.timer {
                timer.abort();
            }
            let completion = request.completion;
            self.callbacks.deliver(move || completion(Err(error)));
        }
    }

    /// Registers a scan request and (re)starts the physical scan with the combined filter.
    /// If the transport rejects the command the request fails.
    pub fn checkin(
        &self,
        id: RequestId,
        filter: UuidFilter,
        on_update: Option<AdvertisementHandler>,
        completion: Completion<Vec<Advertisement>>,
    ) {
        {
            let mut state = lock(&self.state);
            debug!("Scan request {} checked in for {}", id, Fingerprint::Scan(filter.clone()));
            state.requests.insert(
                id,
                ScanRequest {
                    filter,
                    found: BTreeMap::new(),
                    on_update: on_update.map(|handler| Arc::new(Mutex::new(handler))),
                    completion,
                    timer: None,
                },
            );
            if let Some(combined) = state.union() {
                debug!("Scanning with {}", combined);
                let previous = state.active.replace(combined.clone());
                self.enqueue(
                    Command::StartScan(combined.clone()),
                    Some(Started {
                        id,
                        filter: combined,
                        previous,
                    }),
                );
            }
        }
        self.drain();
    }

    pub fn attach_timer(&self, id: RequestId, timer: AbortHandle) {
        match lock(&self.state).requests.get_mut(&id) {
            Some(request) => request.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Removes one request and narrows or stops the physical scan accordingly. Returns
    /// `false` if the request had already left.
    pub fn checkout(&self, id: RequestId, how: Checkout) -> bool {
        let request = {
            let mut state = lock(&self.state);
            let request = state.requests.remove(&id);
            if request.is_some() {
                self.reissue(&mut state);
            }
            request
        };
        let Some(mut request) = request else {
            trace!("Scan request {} already checked out", id);
            return false;
        };
        debug!("Scan request {} checked out ({:?})", id, how);
        self.drain();

        let timer = request.timer.take();
        let result = match how {
            Checkout::Elapsed => Ok(request.found.into_values().collect()),
            Checkout::Aborted => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                Err(Error::ScanAborted)
            }
        };
        let completion = request.completion;
        self.callbacks.deliver(move || completion(result));
        true
    }

    /// Queues whatever command brings the transport in line with the remaining requests.
    fn reissue(&self, state: &mut ScanState) {
        let remaining = state.union();
        if remaining == state.active {
            return;
        }
        let command = match &remaining {
            Some(filter) => {
                debug!("Narrowing scan to {}", filter);
                Command::StartScan(filter.clone())
            }
            None => {
                debug!("No scan requests left, stopping scan");
                Command::StopScan
            }
        };
        state.active = remaining;
        self.enqueue(command, None);
    }

    /// Aborts every outstanding scan request. `issue_stop` is false when the radio is
    /// already gone and there is nothing to stop.
    pub fn abort_all(&self, issue_stop: bool) -> usize {
        let aborted: Vec<ScanRequest> = {
            let mut state = lock(&self.state);
            if state.active.take().is_some() && issue_stop {
                self.enqueue(Command::StopScan, None);
            }
            std::mem::take(&mut state.requests).into_values().collect()
        };
        self.drain();

        let count = aborted.len();
        for request in aborted {
            if let Some(timer) = request.timer {
                timer.abort();
            }
            let completion = request.completion;
            self.callbacks
                .deliver(move || completion(Err(Error::ScanAborted)));
        }
        if count > 0 {
            debug!("Aborted {} scan request(s)", count);
        }
        count
    }

    /// Fans an advertisement out to every request whose filter it matches, replacing any
    /// earlier record from the same peripheral. Returns `true` the first time a peripheral
    /// is seen.
    pub fn on_advertisement(&self, mut advertisement: Advertisement) -> bool {
        advertisement.sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let first_sighting = self.seen.insert(advertisement.peripheral);

        let mut updates = Vec::new();
        {
            let mut state = lock(&self.state);
            for (id, request) in state.requests.iter_mut() {
                if !request.filter.overlaps(&advertisement.services) {
                    continue;
                }
                trace!("Advertisement from {} matched scan {}", advertisement.peripheral, id);
                request
                    .found
                    .insert(advertisement.peripheral, advertisement.clone());
                if let Some(handler) = &request.on_update {
                    updates.push(handler.clone());
                }
            }
        }
        for handler in updates {
            let advertisement = advertisement.clone();
            self.callbacks.deliver(move || {
                let mut handler = lock(&handler);
                (*handler)(advertisement);
            });
        }
        first_sighting
    }
}

impl Debug for ScanAggregator {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ScanAggregator")
            .field("requests", &self.len())
            .field("active", &self.active_filter())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{uuid_from_u16, TransportError};
    use crate::request::RequestIds;
    use crate::transport::RecordingTransport;
    use tokio::runtime::Handle;
    use uuid::Uuid;

    const A: Uuid = uuid_from_u16(0xfe00);
    const B: Uuid = uuid_from_u16(0xfe01);
    const C: Uuid = uuid_from_u16(0xfe02);

    type Outcome = Arc<Mutex<Option<std::result::Result<Vec<PeripheralId>, String>>>>;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        callbacks: CallbackQueue,
        scans: ScanAggregator,
        ids: RequestIds,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = Arc::new(RecordingTransport::default());
            let callbacks = CallbackQueue::new(&Handle::current());
            let scans = ScanAggregator::new(transport.clone(), callbacks.clone());
            Fixture {
                transport,
                callbacks,
                scans,
                ids: RequestIds::default(),
            }
        }

        fn checkin(&self, filter: UuidFilter) -> (RequestId, Outcome) {
            let id = self.ids.next();
            let outcome: Outcome = Arc::new(Mutex::new(None));
            let sink = outcome.clone();
            self.scans.checkin(
                id,
                filter,
                None,
                Box::new(move |result: Result<Vec<Advertisement>>| {
                    *sink.lock().unwrap() = Some(
                        result
                            .map(|found| found.iter().map(|a| a.peripheral).collect())
                            .map_err(|e| e.to_string()),
                    );
                }),
            );
            (id, outcome)
        }
    }

    fn advertisement(peripheral: u128, services: &[Uuid]) -> Advertisement {
        Advertisement {
            peripheral: PeripheralId::from_uuid(Uuid::from_u128(peripheral)),
            services: services.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn filters_are_combined_and_narrowed() {
        let f = Fixture::new();
        let (first, _) = f.checkin(UuidFilter::only([A]));
        let (second, _) = f.checkin(UuidFilter::only([B]));
        let (third, _) = f.checkin(UuidFilter::Any);
        assert!(f.scans.checkout(third, Checkout::Aborted));
        assert!(f.scans.checkout(first, Checkout::Elapsed));
        assert!(f.scans.checkout(second, Checkout::Elapsed));
        assert!(!f.scans.checkout(second, Checkout::Elapsed));

        assert_eq!(
            f.transport.take_commands(),
            vec![
                Command::StartScan(UuidFilter::only([A])),
                Command::StartScan(UuidFilter::only([A, B])),
                Command::StartScan(UuidFilter::Any),
                Command::StartScan(UuidFilter::only([A, B])),
                Command::StartScan(UuidFilter::only([B])),
                Command::StopScan,
            ]
        );
        assert_eq!(f.scans.active_filter(), None);
    }

    #[tokio::test]
    async fn advertisements_fan_out_to_every_matching_request() {
        let f = Fixture::new();
        let (r1, any) = f.checkin(UuidFilter::Any);
        let (r2, only_a) = f.checkin(UuidFilter::only([A]));

        assert!(f.scans.on_advertisement(advertisement(1, &[A, B])));
        assert!(f.scans.on_advertisement(advertisement(2, &[C])));
        assert!(!f.scans.on_advertisement(advertisement(1, &[A])));
        f.scans.checkout(r1, Checkout::Elapsed);
        f.scans.checkout(r2, Checkout::Elapsed);
        f.callbacks.flush().await;

        let p = |n| PeripheralId::from_uuid(Uuid::from_u128(n));
        assert_eq!(*any.lock().unwrap(), Some(Ok(vec![p(1), p(2)])));
        assert_eq!(*only_a.lock().unwrap(), Some(Ok(vec![p(1)])));
    }

    #[tokio::test]
    async fn latest_advertisement_wins() {
        let f = Fixture::new();
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        let id = f.ids.next();
        f.scans.checkin(
            id,
            UuidFilter::Any,
            None,
            Box::new(move |result: Result<Vec<Advertisement>>| {
                *sink.lock().unwrap() = result.unwrap();
            }),
        );
        let mut first = advertisement(1, &[]);
        first.rssi = -80;
        let mut second = advertisement(1, &[]);
        second.rssi = -40;
        f.scans.on_advertisement(first);
        f.scans.on_advertisement(second);
        f.scans.checkout(id, Checkout::Elapsed);
        f.callbacks.flush().await;

        let found = found.lock().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rssi, -40);
        assert_eq!(found[0].sequence, 2);
    }

    #[tokio::test]
    async fn abort_all_fails_every_request() {
        let f = Fixture::new();
        let (_, first) = f.checkin(UuidFilter::Any);
        let (_, second) = f.checkin(UuidFilter::only([A]));
        assert_eq!(f.scans.abort_all(true), 2);
        f.callbacks.flush().await;

        let aborted = Some(Err(Error::ScanAborted.to_string()));
        assert_eq!(*first.lock().unwrap(), aborted);
        assert_eq!(*second.lock().unwrap(), aborted);
        assert_eq!(f.transport.commands().last(), Some(&Command::StopScan));
    }

    #[tokio::test]
    async fn rejected_scan_fails_its_request() {
        let f = Fixture::new();
        f.transport
            .reject_commands(Some(TransportError::new("scan busy")));
        let (_, outcome) = f.checkin(UuidFilter::Any);
        f.callbacks.flush().await;

        assert_eq!(*outcome.lock().unwrap(), Some(Err("Transport reported failure: scan busy".into())));
        assert_eq!(f.scans.len(), 0);
        assert_eq!(f.scans.active_filter(), None);
    }

    #[tokio::test]
    async fn rejected_widening_keeps_the_previous_scan() {
        let f = Fixture::new();
        let (_, first) = f.checkin(UuidFilter::only([A]));
        f.transport
            .reject_commands(Some(TransportError::new("scan busy")));
        let (_, second) = f.checkin(UuidFilter::only([B]));
        f.callbacks.flush().await;

        assert_eq!(
            f.transport.take_commands(),
            vec![
                Command::StartScan(UuidFilter::only([A])),
                Command::StartScan(UuidFilter::only([A, B])),
            ]
        );
        assert_eq!(f.scans.active_filter(), Some(UuidFilter::only([A])));
        assert_eq!(f.scans.len(), 1);
        assert_eq!(*first.lock().unwrap(), None);
        assert!(matches!(&*second.lock().unwrap(), Some(Err(_))));
    }
}
