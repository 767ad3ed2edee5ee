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

//! Wired connections to secure elements.

use crate::error::{Result, RoutingError};
use crate::manager::{RoutingManager, Shared};
use crate::nci::{EeHandle, EeMode, EeStatus, GenericSeId, Status};
use crate::secure_element::{PowerConfig, SecureElementDirectory};
use crate::sync::lock;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Users of the NFCC keeping the secure elements powered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Consumer {
    Discovery,
    SeConnection,
    HostCardEmulation,
}

/// Tracks who needs the secure elements powered and switches the power
/// configuration on the first acquisition and the last release.
pub struct PowerSwitch {
    directory: Arc<dyn SecureElementDirectory>,
    consumers: Mutex<HashMap<Consumer, usize>>,
}

impl PowerSwitch {
    pub fn new(directory: Arc<dyn SecureElementDirectory>) -> PowerSwitch {
        PowerSwitch { directory, consumers: Mutex::new(HashMap::new()) }
    }

    pub fn acquire(&self, consumer: Consumer) -> Status {
        let mut consumers = lock(&self.consumers);
        let powered = !consumers.is_empty();
        *consumers.entry(consumer).or_default() += 1;
        if powered {
            return Status::Ok;
        }
        debug!("power switch: {:?} powers up", consumer);
        self.directory.set_power_config(PowerConfig::Full)
    }

    /// Release one acquisition of `consumer`. The power is lowered only
    /// when no consumer remains.
    pub fn release(&self, consumer: Consumer) -> Status {
        let mut consumers = lock(&self.consumers);
        match consumers.get_mut(&consumer) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return Status::Ok;
            }
            Some(_) => {
                consumers.remove(&consumer);
            }
            None => return Status::Ok,
        }
        if !consumers.is_empty() {
            debug!("power switch: still held by {:?}", consumers.keys().collect::<Vec<_>>());
            return Status::Ok;
        }
        debug!("power switch: {:?} powers down", consumer);
        self.directory.set_power_config(PowerConfig::Low)
    }

    pub fn is_held(&self, consumer: Consumer) -> bool {
        lock(&self.consumers).contains_key(&consumer)
    }

    pub fn is_powered(&self) -> bool {
        !lock(&self.consumers).is_empty()
    }
}

/// Progress of a connection-open request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    PoweringUp,
    ModeSetPending,
    ModeSetOk,
    ModeSetFailed,
    RecoveryWait,
    RecoveryOk,
    RecoveryFailed,
    Connected,
    Failed,
}

/// Wired (host to secure element) connection.
pub struct WiredConnection {
    shared: Arc<Shared>,
    state: Mutex<ConnectionState>,
    handle: Mutex<Option<EeHandle>>,
}

impl WiredConnection {
    pub fn new(manager: &RoutingManager) -> WiredConnection {
        WiredConnection {
            shared: manager.shared().clone(),
            state: Mutex::new(ConnectionState::Idle),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn transition(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        debug!("wired connection: {:?} -> {:?}", *current, state);
        *current = state;
    }

    /// Activate the secure element `id` for a wired connection.
    ///
    /// A mode set that fails or is never answered is accepted when the NFCC
    /// reports a successful EE recovery within the recovery timeout; the
    /// connection is then usable in a degraded mode.
    pub fn open_connection(&self, id: GenericSeId) -> bool {
        info!("+ open_connection({:#04x})", id.0);
        let shared = &self.shared;
        self.transition(ConnectionState::PoweringUp);
        shared.recovery.reset();
        let status = shared.power_switch.acquire(Consumer::SeConnection);
        if status != Status::Ok {
            error!("open_connection: failed to power the secure elements: {:?}", status);
            self.transition(ConnectionState::Failed);
            shared.power_switch.release(Consumer::SeConnection);
            return false;
        }

        match self.activate(id) {
            Ok(handle) => {
                *lock(&self.handle) = Some(handle);
                self.transition(ConnectionState::Connected);
                true
            }
            Err(err) => {
                error!("open_connection: {}", err);
                self.transition(ConnectionState::Failed);
                shared.power_switch.release(Consumer::SeConnection);
                false
            }
        }
    }

    fn activate(&self, id: GenericSeId) -> Result<EeHandle> {
        let shared = &self.shared;
        let handle = shared.directory.resolve_handle(id);
        if !handle.is_valid() || handle.is_host() {
            return Err(RoutingError::InvalidRoute(id.0));
        }

        self.transition(ConnectionState::ModeSetPending);
        let err = match shared.set_ee_mode(handle, EeMode::Activate) {
            Ok(ack) if ack.ee_status == EeStatus::Active => {
                self.transition(ConnectionState::ModeSetOk);
                return Ok(handle);
            }
            Ok(ack) => RoutingError::Failed { command: "ee_mode_set", status: ack.status },
            Err(err) => err,
        };

        warn!("open_connection: activating {} failed ({}), waiting for recovery", handle, err);
        self.transition(ConnectionState::ModeSetFailed);
        self.transition(ConnectionState::RecoveryWait);
        match shared.recovery.wait_timeout(shared.policy.recovery_timeout) {
            Some(true) => {
                warn!("open_connection: {} recovered, continuing in degraded mode", handle);
                self.transition(ConnectionState::RecoveryOk);
                Ok(handle)
            }
            _ => {
                self.transition(ConnectionState::RecoveryFailed);
                Err(err)
            }
        }
    }

    /// Deactivate the secure element and give the power back.
    pub fn close_connection(&self) -> bool {
        info!("+ close_connection()");
        let Some(handle) = lock(&self.handle).take() else {
            debug!("close_connection: not connected");
            return true;
        };
        let result = self.shared.set_ee_mode(handle, EeMode::Deactivate);
        self.transition(ConnectionState::Idle);
        self.shared.power_switch.release(Consumer::SeConnection);
        match result {
            Ok(_) => true,
            Err(err) => {
                error!("close_connection: {}", err);
                false
            }
        }
    }

    pub fn activate_se_interface(&self) -> bool {
        debug!("+ activate_se_interface()");
        self.set_interface_mode(EeMode::Activate)
    }

    pub fn deactivate_se_interface(&self) -> bool {
        debug!("+ deactivate_se_interface()");
        self.set_interface_mode(EeMode::Deactivate)
    }

    fn set_interface_mode(&self, mode: EeMode) -> bool {
        let Some(handle) = *lock(&self.handle) else {
            error!("set_interface_mode: not connected");
            return false;
        };
        match self.shared.set_ee_mode(handle, mode) {
            Ok(_) => true,
            Err(err) => {
                error!("set_interface_mode({:?}): {}", mode, err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_element::EeRegistry;

    #[test]
    fn power_follows_the_consumer_set() {
        let registry = Arc::new(EeRegistry::new());
        let switch = PowerSwitch::new(registry.clone());
        assert_eq!(registry.power_config(), PowerConfig::Low);

        switch.acquire(Consumer::Discovery);
        switch.acquire(Consumer::SeConnection);
        assert_eq!(registry.power_config(), PowerConfig::Full);

        switch.release(Consumer::SeConnection);
        assert_eq!(registry.power_config(), PowerConfig::Full);
        assert!(!switch.is_held(Consumer::SeConnection));

        switch.release(Consumer::Discovery);
        assert_eq!(registry.power_config(), PowerConfig::Low);
        assert!(!switch.is_powered());
    }

    #[test]
    fn repeated_acquisitions_are_counted() {
        let registry = Arc::new(EeRegistry::new());
        let switch = PowerSwitch::new(registry.clone());
        switch.acquire(Consumer::SeConnection);
        switch.acquire(Consumer::SeConnection);
        switch.release(Consumer::SeConnection);
        assert_eq!(registry.power_config(), PowerConfig::Full);
        switch.release(Consumer::SeConnection);
        assert_eq!(registry.power_config(), PowerConfig::Low);
        // Releasing a consumer that holds nothing is a no-op.
        assert_eq!(switch.release(Consumer::Discovery), Status::Ok);
    }
}
