// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The application-facing callback domain. Every completion, abruption, notification and
//! scan update runs on a single task, so the application sees one total order of callbacks
//! even though they are produced by concurrent timers and event handlers.

use futures::channel::oneshot;
use log::{error, warn};
use std::fmt::{self, Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct CallbackQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl CallbackQueue {
    pub fn new(runtime: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Application callback panicked, continuing with the next one");
                }
            }
        });
        CallbackQueue { sender }
    }

    /// Queues `job` behind every callback queued before it.
    pub fn deliver<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("Callback queue has shut down, dropping callback");
        }
    }

    /// Resolves once every callback queued so far has run.
    pub async fn flush(&self) {
        let (sender, receiver) = oneshot::channel();
        self.deliver(move || {
            let _ = sender.send(());
        });
        let _ = receiver.await;
    }
}

impl Debug for CallbackQueue {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}
