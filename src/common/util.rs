// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use futures::stream::{Stream, StreamExt};
use log::trace;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Locks a mutex, recovering the guard if a previous holder panicked. No engine state is left
/// half-updated across a panic because application callbacks never run under these locks.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn send_broadcast<T: Debug>(sender: &broadcast::Sender<T>, item: T) {
    if let Err(lost) = sender.send(item) {
        trace!("Lost broadcast, while nothing subscribed: {:?}", lost.0);
    }
}

/// Turns a broadcast receiver into a stream, skipping over items lost to lagging.
pub fn broadcast_stream<T>(
    receiver: broadcast::Receiver<T>,
) -> Pin<Box<dyn Stream<Item = T> + Send>>
where
    T: Clone + Send + 'static,
{
    Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }))
}
