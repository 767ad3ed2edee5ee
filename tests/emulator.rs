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

//! End-to-end tests against the emulated NFCC.

use bytes::Bytes;
use nfc_routing::emulator::{self, EmulatorConfig, EmulatorHandle, Stimulus};
use nfc_routing::nci::{power, technology, EeStatus, PowerMasks};
use nfc_routing::{
    ConnectionState, EeHandle, EeInfo, EeRegistry, GenericSeId, HostEmulationListener,
    RoutingManager, RoutingPolicy, WiredConnection,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

fn ees() -> Vec<EeInfo> {
    vec![
        EeInfo {
            handle: EeHandle::ESE,
            status: EeStatus::Active,
            technologies: technology::A | technology::B,
            hci_access: false,
        },
        EeInfo {
            handle: EeHandle::UICC1,
            status: EeStatus::Active,
            technologies: technology::A | technology::B | technology::F,
            hci_access: false,
        },
    ]
}

fn start(
    config: EmulatorConfig,
    policy: RoutingPolicy,
) -> (RoutingManager, EmulatorHandle, JoinHandle<anyhow::Result<()>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (nfcc, nfcc_task) = emulator::new(config);
    let manager =
        RoutingManager::new(Arc::new(nfcc.clone()), Arc::new(EeRegistry::new()), policy);
    let nfcc_task = tokio::spawn(nfcc_task.run(manager.event_sink()));
    (manager, nfcc, nfcc_task)
}

#[tokio::test(flavor = "multi_thread")]
async fn initialize_and_apply_default_routes() {
    let policy = RoutingPolicy { offhost_route: 0xC0, ..Default::default() };
    let (manager, nfcc, nfcc_task) =
        start(EmulatorConfig { ees: ees(), scbr_supported: false, ..Default::default() }, policy);

    let engine = manager.clone();
    let committed = task::spawn_blocking(move || {
        engine.initialize()
            && engine.apply_default_routes()
            && engine.add_aid_routing(&[0xA0, 0x00, 0x00, 0x00, 0x03], 1, 0, 0x3F)
            && engine.commit_routing()
    })
    .await
    .unwrap();
    assert!(committed);

    let routing = nfcc.listen_mode_routing().await;
    assert_eq!(routing.updates, 1);
    assert_eq!(routing.aids.len(), 1);
    assert_eq!(routing.aids[0].handle, EeHandle::ESE);
    // Nfc-A is routed to the off-host NFCEE, A and B to the default UICC.
    let ese = routing.technology.get(&EeHandle::ESE).copied().unwrap();
    assert_eq!(ese.switch_on, technology::A);
    let uicc = routing.technology.get(&EeHandle::UICC1).copied().unwrap();
    assert_eq!(uicc.switch_on, technology::A | technology::B);
    // Without system code routing T3T stays on the host.
    let host = routing.protocol.get(&EeHandle::HOST).copied().unwrap();
    assert_eq!(
        host,
        PowerMasks::from_power_state(nfc_routing::nci::protocol::T3T, power::HOST_SAFE)
    );
    assert_eq!(nfcc.uicc_listen_technologies(EeHandle::ESE).await, Some(technology::A));
    assert_eq!(nfcc.iso_dep_listen_technologies().await, technology::A);
    assert!(nfcc.host_wildcard_aid().await);

    nfcc_task.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn t3t_identifier_round_trip() {
    let policy = RoutingPolicy { sys_code: 0xFEFE, sys_code_route: 0, ..Default::default() };
    let (manager, nfcc, nfcc_task) =
        start(EmulatorConfig { ees: ees(), ..Default::default() }, policy);

    let engine = manager.clone();
    let handle = task::spawn_blocking(move || {
        assert!(engine.initialize());
        engine.register_t3t_identifier(&[
            0x88, 0xB4, 0x02, 0xFE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0xFF, 0xFF, 0xFF,
        ])
    })
    .await
    .unwrap()
    .unwrap();

    assert!(manager.is_scbr_supported());
    assert_eq!(nfcc.felica_registration(handle).await, Some(0x88B4));
    let routing = nfcc.listen_mode_routing().await;
    assert_eq!(routing.system_codes.get(&0x88B4), Some(&(EeHandle::HOST, power::SWITCH_ON)));
    assert_eq!(
        routing.system_codes.get(&0xFEFE),
        Some(&(EeHandle::HOST, 0x19 & power::HOST_SAFE))
    );

    let engine = manager.clone();
    task::spawn_blocking(move || engine.deregister_t3t_identifier(handle)).await.unwrap();
    let routing = nfcc.listen_mode_routing().await;
    assert!(routing.system_codes.get(&0x88B4).is_none());
    assert_eq!(nfcc.felica_registration(handle).await, None);

    nfcc_task.abort();
}

struct Forwarder {
    tx: Mutex<mpsc::UnboundedSender<Bytes>>,
}

impl HostEmulationListener for Forwarder {
    fn notify_activated(&self, _technology: u8) {}

    fn notify_deactivated(&self, _technology: u8) {}

    fn notify_data(&self, _technology: u8, data: Bytes) {
        let _ = self.tx.lock().unwrap().send(data);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fragmented_data_reaches_listener_once() {
    let (manager, nfcc, nfcc_task) = start(EmulatorConfig::default(), RoutingPolicy::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.set_host_emulation_listener(Arc::new(Forwarder { tx: Mutex::new(tx) }));

    let unit: Bytes = (0..600u32).map(|n| n as u8).collect::<Vec<_>>().into();
    nfcc.stimulate(Stimulus::CeActivated { technology: technology::A }).unwrap();
    nfcc.stimulate(Stimulus::CeData { technology: technology::A, data: unit.clone() }).unwrap();
    nfcc.stimulate(Stimulus::CeData {
        technology: technology::A,
        data: Bytes::from_static(&[0x90, 0x00]),
    })
    .unwrap();

    assert_eq!(rx.recv().await, Some(unit));
    assert_eq!(rx.recv().await, Some(Bytes::from_static(&[0x90, 0x00])));

    nfcc_task.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn swallowed_mode_set_recovers() {
    let config = EmulatorConfig {
        ees: ees(),
        swallow_mode_set: true,
        recovery_delay: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let policy = RoutingPolicy {
        nfcee_timeout: Duration::from_millis(200),
        recovery_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let (manager, nfcc, nfcc_task) = start(config, policy);

    let engine = manager.clone();
    let state = task::spawn_blocking(move || {
        assert!(engine.initialize());
        // The EE list is delivered right after the registration.
        while engine.ee_info().is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }
        let connection = WiredConnection::new(&engine);
        connection.open_connection(GenericSeId::ESE);
        connection.state()
    })
    .await
    .unwrap();
    assert_eq!(state, ConnectionState::Connected);

    nfcc.set_swallow_mode_set(false).await;
    nfcc_task.abort();
}
