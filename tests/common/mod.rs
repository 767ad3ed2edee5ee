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

//! Scripted NFCC answering every command from its own callback thread.

#![allow(dead_code)]

use nfc_routing::nci::{technology, Command, EeMode, EeStatus, Event};
use nfc_routing::sync::ChannelId;
use nfc_routing::{
    EeHandle, EeInfo, EeRegistry, EventSink, NciVersion, Nfcc, RoutingManager, RoutingPolicy,
    Status,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn ee(handle: EeHandle, technologies: u8) -> EeInfo {
    EeInfo { handle, status: EeStatus::Active, technologies, hci_access: false }
}

/// Behavior of a [`FakeNfcc`].
#[derive(Clone, Debug)]
pub struct FakeConfig {
    pub nci_version: NciVersion,
    pub ees: Vec<EeInfo>,
    /// Deliver the EE list after registration.
    pub report_ees: bool,
    pub scbr_supported: bool,
    pub swallow_mode_set: bool,
    /// Deliver a successful recovery after a swallowed mode set.
    pub recover_after_swallow: bool,
    /// Commands whose completion event carries a failure status.
    pub failing: HashSet<&'static str>,
    /// Delay before each completion event.
    pub latency: Duration,
}

impl Default for FakeConfig {
    fn default() -> Self {
        FakeConfig {
            nci_version: NciVersion::Version20,
            ees: vec![
                ee(EeHandle::ESE, technology::A | technology::B),
                ee(EeHandle::UICC1, technology::A | technology::B | technology::F),
            ],
            report_ees: true,
            scbr_supported: true,
            swallow_mode_set: false,
            recover_after_swallow: false,
            failing: HashSet::new(),
            latency: Duration::from_millis(1),
        }
    }
}

pub struct FakeNfcc {
    config: FakeConfig,
    sink: Arc<Mutex<Option<EventSink>>>,
    command_tx: Mutex<mpsc::Sender<Command>>,
    in_flight: Arc<Mutex<HashSet<ChannelId>>>,
    violations: Arc<AtomicUsize>,
    commands: Mutex<Vec<Command>>,
}

impl FakeNfcc {
    pub fn new(config: FakeConfig) -> Arc<FakeNfcc> {
        let (command_tx, command_rx) = mpsc::channel::<Command>();
        let sink: Arc<Mutex<Option<EventSink>>> = Arc::new(Mutex::new(None));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let nfcc = Arc::new(FakeNfcc {
            config: config.clone(),
            sink: sink.clone(),
            command_tx: Mutex::new(command_tx),
            in_flight: in_flight.clone(),
            violations: Arc::new(AtomicUsize::new(0)),
            commands: Mutex::new(vec![]),
        });

        thread::spawn(move || {
            let mut ees = config.ees.clone();
            let mut next_ce_handle = 0x0301;
            for command in command_rx {
                thread::sleep(config.latency);
                let failed = config.failing.contains(command.name());
                let status = if failed { Status::Failed } else { Status::Ok };
                let events = match command {
                    Command::EeRegister if config.report_ees => vec![
                        Event::EeRegistered { status },
                        Event::EeDiscovered { status: Status::Ok, ees: ees.clone() },
                    ],
                    Command::EeRegister => vec![Event::EeRegistered { status }],
                    Command::EeModeSet { handle, mode } => {
                        let ee_status = match mode {
                            EeMode::Activate => EeStatus::Active,
                            EeMode::Deactivate => EeStatus::Inactive,
                        };
                        if let Some(ee) = ees.iter_mut().find(|ee| ee.handle == handle) {
                            ee.status = ee_status;
                        }
                        vec![Event::EeModeSet { status, handle, ee_status }]
                    }
                    Command::SetTechnologyRouting { .. } => {
                        vec![Event::TechnologyRoutingSet { status }]
                    }
                    Command::SetProtocolRouting { .. } => {
                        vec![Event::ProtocolRoutingSet { status }]
                    }
                    Command::AddAidRouting { .. } => vec![Event::AidAdded { status }],
                    Command::RemoveAidRouting { .. } | Command::RemoveAllAidRouting => {
                        vec![Event::AidRemoved { status }]
                    }
                    Command::AddSystemCodeRouting { .. } => {
                        vec![Event::SystemCodeAdded { status }]
                    }
                    Command::RemoveSystemCodeRouting { .. } => {
                        vec![Event::SystemCodeRemoved { status }]
                    }
                    Command::AddApduPatternRouting { .. } => {
                        vec![Event::ApduPatternAdded { status }]
                    }
                    Command::RemoveApduPatternRouting { .. } => {
                        vec![Event::ApduPatternRemoved { status }]
                    }
                    Command::UpdateNow => vec![Event::EeUpdated { status }],
                    Command::RegisterFelicaSystemCodeOnHost { .. } => {
                        next_ce_handle += 1;
                        vec![Event::CeRegistered { status, handle: next_ce_handle - 1 }]
                    }
                    Command::DeregisterFelicaSystemCodeOnHost { handle } => {
                        vec![Event::CeDeregistered { handle }]
                    }
                    Command::EeDeregister => vec![Event::EeDeregistered],
                    _ => vec![],
                };
                if let Some(channel) = command.channel() {
                    in_flight.lock().unwrap().remove(&channel);
                }
                let sink = sink.lock().unwrap().clone();
                if let Some(sink) = sink {
                    for event in events {
                        sink.deliver(event);
                    }
                }
            }
        });
        nfcc
    }

    pub fn attach(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Number of commands issued while another request was outstanding on
    /// the same channel.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
    }

    fn deliver_later(&self, event: Event, delay: Duration) {
        let sink = self.sink.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if let Some(sink) = sink.lock().unwrap().clone() {
                sink.deliver(event);
            }
        });
    }
}

impl Nfcc for FakeNfcc {
    fn nci_version(&self) -> NciVersion {
        self.config.nci_version
    }

    fn send(&self, command: Command) -> Status {
        self.commands.lock().unwrap().push(command.clone());
        match command {
            Command::AddSystemCodeRouting { .. } | Command::RemoveSystemCodeRouting { .. }
                if !self.config.scbr_supported =>
            {
                return Status::NotSupported
            }
            Command::EeModeSet { .. } if self.config.swallow_mode_set => {
                if self.config.recover_after_swallow {
                    self.deliver_later(
                        Event::RecoveryComplete { recovered: true },
                        Duration::from_millis(10),
                    );
                }
                return Status::Ok;
            }
            _ => (),
        }
        if let Some(channel) = command.channel() {
            if !self.in_flight.lock().unwrap().insert(channel) {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.command_tx.lock().unwrap().send(command).unwrap();
        Status::Ok
    }
}

/// Manager wired to a fresh [`FakeNfcc`] and [`EeRegistry`].
pub fn setup(
    config: FakeConfig,
    policy: RoutingPolicy,
) -> (RoutingManager, Arc<FakeNfcc>, Arc<EeRegistry>) {
    init_logger();
    let nfcc = FakeNfcc::new(config);
    let registry = Arc::new(EeRegistry::new());
    let manager = RoutingManager::new(nfcc.clone(), registry.clone(), policy);
    nfcc.attach(manager.event_sink());
    (manager, nfcc, registry)
}

/// Initialize `manager` and wait until the EE list reached it.
pub fn initialize(manager: &RoutingManager, nfcc: &FakeNfcc) {
    assert!(manager.initialize());
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.ee_info().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    nfcc.clear_commands();
}

/// Commands matching `filter`.
pub fn commands_where(nfcc: &FakeNfcc, filter: impl Fn(&Command) -> bool) -> Vec<Command> {
    nfcc.commands().into_iter().filter(|command| filter(command)).collect()
}
