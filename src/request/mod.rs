// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Outstanding requests and the per-kind registries that own them.
//!
//! A request is pending exactly as long as it is present in its registry's map. Both the
//! event path and the timeout path resolve a request by taking it out of the map under the
//! registry lock, so whichever gets there first owns the completion and the other finds
//! nothing.

mod timeout;

pub(crate) use self::timeout::TimeoutArbiter;

use crate::api::Completion;
use crate::common::util::lock;
use crate::dispatch::CallbackQueue;
use crate::fingerprint::Fingerprint;
use crate::Result;
use log::debug;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::task::AbortHandle;

/// Handle identifying one submitted request, unique within an engine.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out increasing request ids.
#[derive(Debug, Default)]
pub(crate) struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn next(&self) -> RequestId {
        RequestId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// The operation a request performs. Each kind has its own registry.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Scan,
    Connect,
    Disconnect,
    CancelConnect,
    ServiceDiscovery,
    CharacteristicDiscovery,
    DescriptorDiscovery,
    Read,
    Write,
    ReadDescriptor,
    WriteDescriptor,
    Subscribe,
    Unsubscribe,
    ReadRssi,
}

impl RequestKind {
    /// Kinds whose completion events must always match an outstanding request. An unmatched
    /// event of one of these kinds means the transport and the engine disagree.
    pub fn requires_match(&self) -> bool {
        matches!(
            self,
            RequestKind::Read
                | RequestKind::Write
                | RequestKind::ReadDescriptor
                | RequestKind::WriteDescriptor
                | RequestKind::Subscribe
                | RequestKind::Unsubscribe
                | RequestKind::ReadRssi
        )
    }

    /// Kinds that leave work running in the transport when they time out, and so need a
    /// compensating cancel.
    pub fn compensates_on_timeout(&self) -> bool {
        *self == RequestKind::Connect
    }
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            RequestKind::Scan => "scan",
            RequestKind::Connect => "connect",
            RequestKind::Disconnect => "disconnect",
            RequestKind::CancelConnect => "cancel-connect",
            RequestKind::ServiceDiscovery => "service discovery",
            RequestKind::CharacteristicDiscovery => "characteristic discovery",
            RequestKind::DescriptorDiscovery => "descriptor discovery",
            RequestKind::Read => "read",
            RequestKind::Write => "write",
            RequestKind::ReadDescriptor => "descriptor read",
            RequestKind::WriteDescriptor => "descriptor write",
            RequestKind::Subscribe => "subscribe",
            RequestKind::Unsubscribe => "unsubscribe",
            RequestKind::ReadRssi => "RSSI read",
        };
        f.write_str(name)
    }
}

/// One outstanding operation. `C` carries kind-specific data that has to survive until
/// resolution, such as the abruption handler of a connect.
pub(crate) struct Request<T, C = ()> {
    pub id: RequestId,
    pub fingerprint: Fingerprint,
    pub context: C,
    completion: Completion<T>,
    timer: Option<AbortHandle>,
}

impl<T: Send + 'static, C> Request<T, C> {
    /// Queues the completion on the callback domain and stops the timer.
    pub fn resolve(mut self, callbacks: &CallbackQueue, result: Result<T>) -> C {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let completion = self.completion;
        callbacks.deliver(move || completion(result));
        self.context
    }

    /// Forgets the timer without aborting it. Used by the timer task itself.
    fn disarm(&mut self) {
        self.timer = None;
    }
}

impl<T, C> Debug for Request<T, C> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("timer", &self.timer.is_some())
            .finish()
    }
}

/// How many timed out fingerprints a registry remembers, so that their completions can
/// still be told apart from events nothing asked for.
const EXPIRED_MEMORY: usize = 16;

/// Outstanding requests of one kind, keyed by id so that equal fingerprints resolve in
/// submission order.
pub(crate) struct Registry<T, C = ()> {
    kind: RequestKind,
    pending: Mutex<BTreeMap<RequestId, Request<T, C>>>,
    expired: Mutex<VecDeque<Fingerprint>>,
}

impl<T: Send + 'static, C> Registry<T, C> {
    pub fn new(kind: RequestKind) -> Self {
        Registry {
            kind,
            pending: Mutex::new(BTreeMap::new()),
            expired: Mutex::new(VecDeque::new()),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn insert(
        &self,
        id: RequestId,
        fingerprint: Fingerprint,
        context: C,
        completion: Completion<T>,
    ) {
        debug!("Pending {} request {} for {}", self.kind, id, fingerprint);
        lock(&self.pending).insert(
            id,
            Request {
                id,
                fingerprint,
                context,
                completion,
                timer: None,
            },
        );
    }

    /// Attaches the timeout task to a request. If the request already resolved the timer is
    /// aborted straight away.
    pub fn attach_timer(&self, id: RequestId, timer: AbortHandle) {
        match lock(&self.pending).get_mut(&id) {
            Some(request) => request.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Takes a request out by id. Taking an id twice returns `None` the second time.
    pub fn take(&self, id: RequestId) -> Option<Request<T, C>> {
        lock(&self.pending).remove(&id)
    }

    /// Takes a request out because its deadline passed, remembering its fingerprint for
    /// [`Registry::take_expired`].
    pub fn expire(&self, id: RequestId) -> Option<Request<T, C>> {
        let request = lock(&self.pending).remove(&id)?;
        let mut expired = lock(&self.expired);
        if expired.len() == EXPIRED_MEMORY {
            expired.pop_front();
        }
        expired.push_back(request.fingerprint.clone());
        Some(request)
    }

    /// Forgets one timed out request for `fingerprint`. Returns `false` if none timed out
    /// recently.
    pub fn take_expired(&self, fingerprint: &Fingerprint) -> bool {
        let mut expired = lock(&self.expired);
        match expired.iter().position(|f| f == fingerprint) {
            Some(index) => expired.remove(index).is_some(),
            None => false,
        }
    }

    /// Takes the oldest request whose fingerprint equals `fingerprint`.
    pub fn take_first(&self, fingerprint: &Fingerprint) -> Option<Request<T, C>> {
        let mut pending = lock(&self.pending);
        let id = pending
            .values()
            .find(|request| &request.fingerprint == fingerprint)
            .map(|request| request.id)?;
        pending.remove(&id)
    }

    /// Partitions the pending set, taking every request for which `satisfied` holds and
    /// leaving the rest pending.
    pub fn take_where<P>(&self, mut satisfied: P) -> Vec<Request<T, C>>
    where
        P: FnMut(&Request<T, C>) -> bool,
    {
        let mut pending = lock(&self.pending);
        let ids: Vec<RequestId> = pending
            .values()
            .filter(|request| satisfied(request))
            .map(|request| request.id)
            .collect();
        ids.iter().filter_map(|id| pending.remove(id)).collect()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        lock(&self.pending)
            .values()
            .any(|request| &request.fingerprint == fingerprint)
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl<T, C> Debug for Registry<T, C> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Registry").field("kind", &self.kind).finish()
    }
}
