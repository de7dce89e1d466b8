// ble-correlator Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{Command, Transport};
use crate::api::{AdapterState, TransportError};
use crate::common::util::lock;
use crate::Result;
use log::trace;
use std::sync::Mutex;

/// An in-memory [`Transport`] that remembers every command it is given and never talks to a
/// radio. Completions are injected by whoever owns the engine.
#[derive(Debug)]
pub struct RecordingTransport {
    state: Mutex<AdapterState>,
    commands: Mutex<Vec<Command>>,
    rejection: Mutex<Option<TransportError>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        RecordingTransport::new(AdapterState::PoweredOn)
    }
}

impl RecordingTransport {
    pub fn new(state: AdapterState) -> Self {
        RecordingTransport {
            state: Mutex::new(state),
            commands: Mutex::new(Vec::new()),
            rejection: Mutex::new(None),
        }
    }

    /// Changes the reported adapter state. The engine only hears about it once a
    /// `TransportEvent::StateChanged` is delivered.
    pub fn set_state(&self, state: AdapterState) {
        *lock(&self.state) = state;
    }

    /// While set, every issued command is recorded and then rejected with `error`.
    pub fn reject_commands(&self, error: Option<TransportError>) {
        *lock(&self.rejection) = error;
    }

    /// Everything issued so far, oldest first.
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.commands).clone()
    }

    pub fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut *lock(&self.commands))
    }

    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Command) -> bool,
    {
        lock(&self.commands).iter().filter(|c| predicate(c)).count()
    }
}

impl Transport for RecordingTransport {
    fn state(&self) -> AdapterState {
        *lock(&self.state)
    }

    fn issue(&self, command: Command) -> Result<()> {
        trace!("Issuing {:?}", command);
        lock(&self.commands).push(command);
        match &*lock(&self.rejection) {
            Some(error) => Err(error.clone().into()),
            None => Ok(()),
        }
    }
}
