// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{Registry, Request, RequestId};
use log::{trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::sleep;

/// Runs one independent timer task per request. A timer that fires takes its request out of
/// the registry and hands it to the expiry callback; if the event path took the request
/// first, the timer does nothing.
#[derive(Debug, Clone)]
pub(crate) struct TimeoutArbiter {
    runtime: Handle,
}

impl TimeoutArbiter {
    pub fn new(runtime: Handle) -> Self {
        TimeoutArbiter { runtime }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn arm<T, C, F>(
        &self,
        registry: &Arc<Registry<T, C>>,
        id: RequestId,
        timeout: Duration,
        on_expire: F,
    ) where
        T: Send + 'static,
        C: Send + 'static,
        F: FnOnce(Request<T, C>) + Send + 'static,
    {
        let pending = registry.clone();
        let task = self.runtime.spawn(async move {
            sleep(timeout).await;
            match pending.expire(id) {
                Some(mut request) => {
                    warn!(
                        "{} request {} for {} timed out after {:?}",
                        pending.kind(),
                        id,
                        request.fingerprint,
                        timeout
                    );
                    request.disarm();
                    on_expire(request);
                }
                None => trace!("Timer for {} fired after it resolved", id),
            }
        });
        registry.attach_timer(id, task.abort_handle());
    }
}
