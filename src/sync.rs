// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request/response channels between the routing manager and the NFCC.
//!
//! A [`Channel`] pairs one kind of command with its completion event. The
//! caller holds the channel guard for the whole round trip so at most one
//! request is ever outstanding per channel; the completion is signalled from
//! the NFCC callback thread without touching the guard.

use crate::error::{Result, RoutingError};
use crate::nci::{Command, Event, Status};
use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Named request/response channels.
///
/// [`ChannelId::Routing`] is shared by technology routing, protocol routing,
/// system code routing and the Felica host registration: their completions
/// are indistinguishable, so none of these commands may be issued while
/// another one is outstanding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelId {
    EeRegister,
    ModeSet,
    Routing,
    Aid,
    ApduPattern,
    EeUpdate,
}

impl Command {
    /// Channel completing this command, `None` for commands without a
    /// completion event.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Command::EeRegister => Some(ChannelId::EeRegister),
            Command::EeModeSet { .. } => Some(ChannelId::ModeSet),
            Command::SetTechnologyRouting { .. }
            | Command::SetProtocolRouting { .. }
            | Command::AddSystemCodeRouting { .. }
            | Command::RemoveSystemCodeRouting { .. }
            | Command::RegisterFelicaSystemCodeOnHost { .. }
            | Command::DeregisterFelicaSystemCodeOnHost { .. } => Some(ChannelId::Routing),
            Command::AddAidRouting { .. }
            | Command::RemoveAidRouting { .. }
            | Command::RemoveAllAidRouting => Some(ChannelId::Aid),
            Command::AddApduPatternRouting { .. } | Command::RemoveApduPatternRouting { .. } => {
                Some(ChannelId::ApduPattern)
            }
            Command::UpdateNow => Some(ChannelId::EeUpdate),
            Command::EeDeregister
            | Command::ConfigureUiccListenTech { .. }
            | Command::SetIsoDepListenTech { .. }
            | Command::RegisterAidOnHost { .. } => None,
        }
    }
}

impl Event {
    /// Channel signalled by this event.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Event::EeRegistered { .. } => Some(ChannelId::EeRegister),
            Event::EeModeSet { .. } => Some(ChannelId::ModeSet),
            Event::TechnologyRoutingSet { .. }
            | Event::ProtocolRoutingSet { .. }
            | Event::SystemCodeAdded { .. }
            | Event::SystemCodeRemoved { .. }
            | Event::CeRegistered { .. }
            | Event::CeDeregistered { .. } => Some(ChannelId::Routing),
            Event::AidAdded { .. } | Event::AidRemoved { .. } => Some(ChannelId::Aid),
            Event::ApduPatternAdded { .. } | Event::ApduPatternRemoved { .. } => {
                Some(ChannelId::ApduPattern)
            }
            Event::EeUpdated { .. } => Some(ChannelId::EeUpdate),
            _ => None,
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One request/response channel.
///
/// `T` is the completion carried by the event, `S` is state only the holder
/// of the channel guard may read or mutate.
#[derive(Debug)]
pub struct Channel<T, S = ()> {
    id: ChannelId,
    guard: Mutex<S>,
    completion: Mutex<Option<T>>,
    condvar: Condvar,
}

impl<T, S: Default> Channel<T, S> {
    pub fn new(id: ChannelId) -> Self {
        Channel::with_state(id, S::default())
    }
}

impl<T, S> Channel<T, S> {
    pub fn with_state(id: ChannelId, state: S) -> Self {
        Channel {
            id,
            guard: Mutex::new(state),
            completion: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Acquire the channel guard, blocking while another transaction is in
    /// progress.
    pub fn begin(&self) -> Transaction<'_, T, S> {
        let state = lock(&self.guard);
        Transaction { channel: self, state }
    }

    /// Record the completion of the outstanding request and wake up its
    /// caller. Completions arriving with no request outstanding are dropped
    /// by the next transaction.
    pub fn signal(&self, completion: T) {
        let mut slot = lock(&self.completion);
        *slot = Some(completion);
        self.condvar.notify_all();
    }

    fn clear(&self) {
        lock(&self.completion).take();
    }
}

/// Exclusive use of a channel.
pub struct Transaction<'a, T, S> {
    channel: &'a Channel<T, S>,
    state: MutexGuard<'a, S>,
}

impl<T, S> Transaction<'_, T, S> {
    /// Guarded channel state.
    pub fn state(&mut self) -> &mut S {
        &mut self.state
    }

    /// Issue `command` through `issue` and block until its completion.
    pub fn round_trip(&mut self, command: &Command, issue: impl FnOnce() -> Status) -> Result<T> {
        self.issue(command, issue)?;
        Ok(self.wait())
    }

    /// Issue `command` through `issue` and block until its completion or
    /// until `timeout` expires.
    pub fn round_trip_timeout(
        &mut self,
        command: &Command,
        timeout: Duration,
        issue: impl FnOnce() -> Status,
    ) -> Result<T> {
        self.issue(command, issue)?;
        self.wait_timeout(timeout).ok_or(RoutingError::TimedOut {
            command: command.name(),
            timeout_ms: timeout.as_millis(),
        })
    }

    fn issue(&mut self, command: &Command, issue: impl FnOnce() -> Status) -> Result<()> {
        // Completions left over from an abandoned request belong to no one.
        self.channel.clear();
        match issue() {
            Status::Ok => Ok(()),
            status => Err(RoutingError::Rejected { command: command.name(), status }),
        }
    }

    pub fn wait(&mut self) -> T {
        let mut slot = lock(&self.channel.completion);
        loop {
            if let Some(completion) = slot.take() {
                return completion;
            }
            slot = self.channel.condvar.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<T> {
        let slot = lock(&self.channel.completion);
        let (mut slot, _) = self
            .channel
            .condvar
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

/// A value published once and observed by any number of waiters until it is
/// reset.
#[derive(Debug)]
pub struct Latch<T> {
    value: Mutex<Option<T>>,
    condvar: Condvar,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        Latch { value: Mutex::new(None), condvar: Condvar::new() }
    }

    pub fn publish(&self, value: T) {
        *lock(&self.value) = Some(value);
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        lock(&self.value).take();
    }

    pub fn get(&self) -> Option<T> {
        lock(&self.value).clone()
    }

    /// Block until a value is published.
    pub fn wait(&self) -> T {
        let mut value = lock(&self.value);
        loop {
            if let Some(value) = value.as_ref() {
                return value.clone();
            }
            value = self.condvar.wait(value).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let value = lock(&self.value);
        let (value, _) = self
            .condvar
            .wait_timeout_while(value, timeout, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        value.clone()
    }
}
