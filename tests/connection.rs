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

mod common;

use common::{commands_where, init_logger, initialize, setup, FakeConfig, FakeNfcc};
use nfc_routing::nci::{Command, EeMode, EeStatus};
use nfc_routing::secure_element::PowerConfig;
use nfc_routing::{
    ConnectionState, Consumer, EeHandle, EeInfo, EeRegistry, GenericSeId, RoutingManager,
    RoutingPolicy, SecureElementDirectory, Status, WiredConnection,
};
use std::sync::Arc;
use std::time::Duration;

/// Directory whose power configuration can never be changed.
struct StuckPower(EeRegistry);

impl SecureElementDirectory for StuckPower {
    fn resolve_handle(&self, id: GenericSeId) -> EeHandle {
        self.0.resolve_handle(id)
    }

    fn active_handles(&self) -> Vec<EeHandle> {
        self.0.active_handles()
    }

    fn supported_technologies(&self, handle: EeHandle) -> u8 {
        self.0.supported_technologies(handle)
    }

    fn is_active(&self, handle: EeHandle) -> bool {
        self.0.is_active(handle)
    }

    fn set_power_config(&self, _config: PowerConfig) -> Status {
        Status::Failed
    }

    fn ee_discovered(&self, ees: &[EeInfo]) {
        self.0.ee_discovered(ees)
    }

    fn mode_set(&self, handle: EeHandle, status: Status, ee_status: EeStatus) {
        self.0.mode_set(handle, status, ee_status)
    }
}

fn policy() -> RoutingPolicy {
    RoutingPolicy {
        nfcee_timeout: Duration::from_millis(50),
        recovery_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[test]
fn open_and_close_connection() {
    let (manager, nfcc, registry) = setup(FakeConfig::default(), policy());
    initialize(&manager, &nfcc);
    let connection = WiredConnection::new(&manager);

    assert!(connection.open_connection(GenericSeId::ESE));
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(manager.power_switch().is_held(Consumer::SeConnection));
    assert_eq!(registry.power_config(), PowerConfig::Full);

    assert!(connection.deactivate_se_interface());
    assert!(connection.activate_se_interface());

    assert!(connection.close_connection());
    assert_eq!(connection.state(), ConnectionState::Idle);
    assert_eq!(registry.power_config(), PowerConfig::Low);
    assert_eq!(
        commands_where(&nfcc, |command| matches!(command, Command::EeModeSet { .. })).last(),
        Some(&Command::EeModeSet { handle: EeHandle::ESE, mode: EeMode::Deactivate })
    );
}

#[test]
fn mode_set_timeout_is_accepted_after_recovery() {
    let config =
        FakeConfig { swallow_mode_set: true, recover_after_swallow: true, ..Default::default() };
    let (manager, nfcc, _) = setup(config, policy());
    initialize(&manager, &nfcc);
    let connection = WiredConnection::new(&manager);

    assert!(connection.open_connection(GenericSeId::ESE));
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(manager.power_switch().is_held(Consumer::SeConnection));
}

#[test]
fn mode_set_timeout_without_recovery_fails() {
    let config = FakeConfig { swallow_mode_set: true, ..Default::default() };
    let policy = RoutingPolicy { recovery_timeout: Duration::from_millis(50), ..policy() };
    let (manager, nfcc, registry) = setup(config, policy);
    initialize(&manager, &nfcc);
    let connection = WiredConnection::new(&manager);

    assert!(!connection.open_connection(GenericSeId::ESE));
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(!manager.power_switch().is_powered());
    assert_eq!(registry.power_config(), PowerConfig::Low);
}

#[test]
fn failed_connection_keeps_power_for_other_consumers() {
    let config = FakeConfig { swallow_mode_set: true, ..Default::default() };
    let policy = RoutingPolicy { recovery_timeout: Duration::from_millis(50), ..policy() };
    let (manager, nfcc, registry) = setup(config, policy);
    initialize(&manager, &nfcc);
    manager.power_switch().acquire(Consumer::Discovery);
    let connection = WiredConnection::new(&manager);

    assert!(!connection.open_connection(GenericSeId::ESE));
    assert_eq!(registry.power_config(), PowerConfig::Full);
}

#[test]
fn unknown_secure_element_is_not_activated() {
    let (manager, nfcc, _) = setup(FakeConfig::default(), policy());
    initialize(&manager, &nfcc);
    let connection = WiredConnection::new(&manager);

    assert!(!connection.open_connection(GenericSeId::UICC2));
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(nfcc.commands().is_empty());
}

#[test]
fn power_up_failure_aborts_connection() {
    init_logger();
    let nfcc = FakeNfcc::new(FakeConfig::default());
    let manager =
        RoutingManager::new(nfcc.clone(), Arc::new(StuckPower(EeRegistry::new())), policy());
    nfcc.attach(manager.event_sink());
    initialize(&manager, &nfcc);
    let connection = WiredConnection::new(&manager);

    assert!(!connection.open_connection(GenericSeId::ESE));
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(!manager.power_switch().is_powered());
    assert!(nfcc.commands().is_empty());
}
