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

//! Secure element directory.

use crate::nci::{technology, EeHandle, EeInfo, EeStatus, GenericSeId, Status};
use crate::sync::lock;
use core::time::Duration;
use log::{debug, info};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Power configuration of the NFCC towards its secure elements.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerConfig {
    /// Secure elements powered and reachable by the host.
    Full,
    /// NFCC in low power, secure elements powered from the field only.
    Low,
}

/// Directory of the secure elements attached to the NFCC.
pub trait SecureElementDirectory: Send + Sync {
    /// Live handle of the secure element `id`, [`EeHandle::INVALID`] when
    /// it is not attached.
    fn resolve_handle(&self, id: GenericSeId) -> EeHandle;

    fn active_handles(&self) -> Vec<EeHandle>;

    /// Listen technologies supported by `handle`, 0 when unknown.
    fn supported_technologies(&self, handle: EeHandle) -> u8;

    fn is_active(&self, handle: EeHandle) -> bool;

    fn set_power_config(&self, config: PowerConfig) -> Status;

    /// EE list reported by the NFCC.
    fn ee_discovered(&self, _ees: &[EeInfo]) {}

    /// Result of an EE mode set, observed independently of the routing
    /// manager's own wait.
    fn mode_set(&self, _handle: EeHandle, _status: Status, _ee_status: EeStatus) {}
}

#[derive(Debug)]
struct RegistryState {
    ees: Vec<EeInfo>,
    power_config: PowerConfig,
}

/// In-memory [`SecureElementDirectory`] fed from EE discovery and mode set
/// events.
#[derive(Debug)]
pub struct EeRegistry {
    state: Mutex<RegistryState>,
    mode_changed: Condvar,
}

impl Default for EeRegistry {
    fn default() -> Self {
        EeRegistry::new()
    }
}

impl EeRegistry {
    pub fn new() -> EeRegistry {
        EeRegistry {
            state: Mutex::new(RegistryState { ees: vec![], power_config: PowerConfig::Low }),
            mode_changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.state)
    }

    /// Generic identifier of the EE `handle`.
    pub fn generic_id(handle: EeHandle) -> Option<GenericSeId> {
        match handle {
            EeHandle::HOST => Some(GenericSeId::HOST),
            EeHandle::ESE => Some(GenericSeId::ESE),
            EeHandle::UICC1 => Some(GenericSeId::UICC),
            EeHandle::UICC2 => Some(GenericSeId::UICC2),
            EeHandle::UICC3 => Some(GenericSeId::UICC3),
            _ => None,
        }
    }

    pub fn ees(&self) -> Vec<EeInfo> {
        self.lock().ees.clone()
    }

    pub fn power_config(&self) -> PowerConfig {
        self.lock().power_config
    }

    pub fn status(&self, handle: EeHandle) -> Option<EeStatus> {
        self.lock().ees.iter().find(|ee| ee.handle == handle).map(|ee| ee.status)
    }

    /// Block until `handle` reaches `status` or `timeout` expires.
    pub fn wait_for_status(&self, handle: EeHandle, status: EeStatus, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .mode_changed
            .wait_timeout_while(state, timeout, |state| {
                !state.ees.iter().any(|ee| ee.handle == handle && ee.status == status)
            })
            .unwrap_or_else(PoisonError::into_inner);
        state.ees.iter().any(|ee| ee.handle == handle && ee.status == status)
    }
}

impl SecureElementDirectory for EeRegistry {
    fn resolve_handle(&self, id: GenericSeId) -> EeHandle {
        if id == GenericSeId::HOST {
            return EeHandle::HOST;
        }
        self.lock()
            .ees
            .iter()
            .map(|ee| ee.handle)
            .find(|handle| EeRegistry::generic_id(*handle) == Some(id))
            .unwrap_or(EeHandle::INVALID)
    }

    fn active_handles(&self) -> Vec<EeHandle> {
        self.lock()
            .ees
            .iter()
            .filter(|ee| ee.status == EeStatus::Active)
            .map(|ee| ee.handle)
            .collect()
    }

    fn supported_technologies(&self, handle: EeHandle) -> u8 {
        if handle.is_host() {
            return technology::A | technology::B | technology::F;
        }
        self.lock().ees.iter().find(|ee| ee.handle == handle).map_or(0, |ee| ee.technologies)
    }

    fn is_active(&self, handle: EeHandle) -> bool {
        self.status(handle) == Some(EeStatus::Active)
    }

    fn set_power_config(&self, config: PowerConfig) -> Status {
        debug!("set_power_config({:?})", config);
        self.lock().power_config = config;
        Status::Ok
    }

    fn ee_discovered(&self, ees: &[EeInfo]) {
        info!("{} execution environment(s) discovered", ees.len());
        self.lock().ees = ees.to_vec();
        self.mode_changed.notify_all();
    }

    fn mode_set(&self, handle: EeHandle, status: Status, ee_status: EeStatus) {
        if !status.is_ok() {
            return;
        }
        let mut state = self.lock();
        if let Some(ee) = state.ees.iter_mut().find(|ee| ee.handle == handle) {
            ee.status = ee_status;
        }
        drop(state);
        self.mode_changed.notify_all();
    }
}
