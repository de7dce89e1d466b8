// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! ble-correlator tracks outstanding Bluetooth LE central operations (scan, connect,
//! discover, read, write, subscribe, disconnect) and matches the loosely-correlated
//! completion events of a lower-level transport back to the exact request(s) that caused
//! them.
//!
//! Every request races an independent timeout against its completion event, and exactly
//! one of the two resolves it. The radio stack itself is not part of this crate: it is
//! reached through the [`Transport`](transport::Transport) trait, and reports back through
//! [`TransportEvent`](transport::TransportEvent)s.
//!
//! # Usage
//!
//! ```no_run
//! use ble_correlator::api::{Central, UuidFilter};
//! use ble_correlator::transport::RecordingTransport;
//! use ble_correlator::{Engine, EngineConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> ble_correlator::Result<()> {
//! let transport = Arc::new(RecordingTransport::default());
//! let engine = Engine::new(transport.clone(), EngineConfig::default())?;
//!
//! // The transport feeds its completion events back through the sink.
//! let _sink = engine.event_sink();
//!
//! let found = engine.scan(UuidFilter::Any, Duration::from_secs(5)).await?;
//! for advertisement in found {
//!     println!("{}: {:?}", advertisement.peripheral, advertisement.local_name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
mod common;
pub mod config;
mod discovery;
mod dispatch;
mod engine;
pub mod fingerprint;
mod request;
mod scan;
mod session;
mod subscription;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{Engine, EventSink};
pub use request::{RequestId, RequestKind};

use crate::api::{AdapterState, Central, PeripheralId, TransportError};
use crate::fingerprint::Fingerprint;
use static_assertions::assert_impl_all;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::result;
use std::time::Duration;

/// The main error type returned by most methods in ble-correlator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bluetooth is unavailable (adapter state: {0:?})")]
    Unavailable(AdapterState),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Transport reported failure: {0}")]
    Transport(#[from] TransportError),

    #[error("No outstanding {kind} request matches {fingerprint}")]
    UnmatchedEvent {
        kind: RequestKind,
        fingerprint: Fingerprint,
    },

    #[error("Scan was stopped before its duration elapsed")]
    ScanAborted,

    #[error("Not connected")]
    NotConnected,

    #[error("The operation is not supported: {0}")]
    NotSupported(String),

    #[error("Request was dropped before it completed")]
    Dropped,

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Convenience type for a result using the ble-correlator [`Error`] type.
pub type Result<T> = result::Result<T, Error>;

// Ensure that the exported types implement all the expected traits.
assert_impl_all!(Engine: Central, Clone, Debug, Send, Sized, Sync);
assert_impl_all!(EventSink: Clone, Debug, Send, Sync);
assert_impl_all!(
    PeripheralId: Clone,
    Debug,
    Display,
    Hash,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    Send,
    Sized,
    Sync
);
assert_impl_all!(Fingerprint: Clone, Debug, Display, Hash, Eq, Send, Sync);
