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

//! Emulated NFCC.
//!
//! The emulator applies the routing commands to an in-memory listen mode
//! routing table and answers every command with its completion event from
//! its own task, the way a controller answers from its callback thread.

use crate::events::EventSink;
use crate::nci::{
    Command, EeHandle, EeInfo, EeMode, EeStatus, Event, NciVersion, Nfcc, PowerMasks, Status,
};
use anyhow::Result;
use bytes::Bytes;
use core::time::Duration;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time;

const MAX_AID_LEN: usize = 16;
const MAX_DATA_PACKET_PAYLOAD_SIZE: usize = 255;
/// First handle assigned to Felica host registrations.
const FIRST_CE_HANDLE: u16 = 0x0301;
/// Period of the timer driving delayed notifications.
const TICK_PERIOD: Duration = Duration::from_millis(10);

/// Configuration of an emulated NFCC.
#[derive(Clone, Debug)]
pub struct EmulatorConfig {
    pub nci_version: NciVersion,
    /// EEs reported on registration.
    pub ees: Vec<EeInfo>,
    /// System code based routing support.
    pub scbr_supported: bool,
    /// Never answer EE mode set commands.
    pub swallow_mode_set: bool,
    /// Report an EE recovery after this delay when a mode set is swallowed.
    pub recovery_delay: Option<Duration>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig {
            nci_version: NciVersion::Version20,
            ees: vec![],
            scbr_supported: true,
            swallow_mode_set: false,
            recovery_delay: None,
        }
    }
}

/// AID routing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AidRoute {
    pub aid: Bytes,
    pub handle: EeHandle,
    pub power_state: u8,
    pub aid_info: u8,
}

/// APDU pattern routing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApduRoute {
    pub pattern: Bytes,
    pub mask: Bytes,
    pub handle: EeHandle,
    pub power_state: u8,
}

/// Listen mode routing table of the emulated NFCC.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenModeRouting {
    pub technology: BTreeMap<EeHandle, PowerMasks>,
    pub protocol: BTreeMap<EeHandle, PowerMasks>,
    pub aids: Vec<AidRoute>,
    /// Power state and destination by system code.
    pub system_codes: BTreeMap<u16, (EeHandle, u8)>,
    pub apdu_patterns: Vec<ApduRoute>,
    /// Number of routing table updates requested.
    pub updates: usize,
}

/// Stimuli injected on the RF side of the emulated NFCC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stimulus {
    CeActivated { technology: u8 },
    /// Data unit received from the remote reader. Fragmented on delivery.
    CeData { technology: u8, data: Bytes },
    CeDeactivated { technology: u8 },
    EeStatusChanged { handle: EeHandle, ee_status: EeStatus },
    RecoveryComplete { recovered: bool },
}

/// State of an emulated NFCC.
#[derive(Debug)]
struct State {
    ees: Vec<EeInfo>,
    routing: ListenModeRouting,
    uicc_listen_technologies: HashMap<EeHandle, u8>,
    iso_dep_listen_technologies: u8,
    host_wildcard_aid: bool,
    felica_registrations: HashMap<u16, u16>,
    next_ce_handle: u16,
    swallow_mode_set: bool,
    recovery_delay: Option<Duration>,
    pending_recovery: Option<time::Instant>,
}

/// [`Nfcc`] side of an emulated NFCC.
#[derive(Clone)]
pub struct EmulatorHandle {
    nci_version: NciVersion,
    scbr_supported: bool,
    command_tx: mpsc::UnboundedSender<Command>,
    stimulus_tx: mpsc::UnboundedSender<Stimulus>,
    state: Arc<Mutex<State>>,
}

/// Task driving an emulated NFCC.
pub struct EmulatorTask {
    command_rx: mpsc::UnboundedReceiver<Command>,
    stimulus_rx: mpsc::UnboundedReceiver<Stimulus>,
    state: Arc<Mutex<State>>,
}

struct Controller {
    sink: EventSink,
    state: Arc<Mutex<State>>,
}

/// Create an emulated NFCC.
pub fn new(config: EmulatorConfig) -> (EmulatorHandle, EmulatorTask) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (stimulus_tx, stimulus_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Mutex::new(State {
        ees: config.ees,
        routing: ListenModeRouting::default(),
        uicc_listen_technologies: HashMap::new(),
        iso_dep_listen_technologies: 0,
        host_wildcard_aid: false,
        felica_registrations: HashMap::new(),
        next_ce_handle: FIRST_CE_HANDLE,
        swallow_mode_set: config.swallow_mode_set,
        recovery_delay: config.recovery_delay,
        pending_recovery: None,
    }));
    (
        EmulatorHandle {
            nci_version: config.nci_version,
            scbr_supported: config.scbr_supported,
            command_tx,
            stimulus_tx,
            state: state.clone(),
        },
        EmulatorTask { command_rx, stimulus_rx, state },
    )
}

impl EmulatorHandle {
    /// Inject an RF side stimulus.
    pub fn stimulate(&self, stimulus: Stimulus) -> Result<()> {
        self.stimulus_tx.send(stimulus)?;
        Ok(())
    }

    /// Snapshot of the listen mode routing table.
    pub async fn listen_mode_routing(&self) -> ListenModeRouting {
        self.state.lock().await.routing.clone()
    }

    /// Listen technologies configured for the UICC `handle`.
    pub async fn uicc_listen_technologies(&self, handle: EeHandle) -> Option<u8> {
        self.state.lock().await.uicc_listen_technologies.get(&handle).copied()
    }

    pub async fn iso_dep_listen_technologies(&self) -> u8 {
        self.state.lock().await.iso_dep_listen_technologies
    }

    pub async fn ee_status(&self, handle: EeHandle) -> Option<EeStatus> {
        self.state.lock().await.ees.iter().find(|ee| ee.handle == handle).map(|ee| ee.status)
    }

    /// Whether the wildcard AID is registered on the host.
    pub async fn host_wildcard_aid(&self) -> bool {
        self.state.lock().await.host_wildcard_aid
    }

    /// System code of the Felica host registration `handle`.
    pub async fn felica_registration(&self, handle: u16) -> Option<u16> {
        self.state.lock().await.felica_registrations.get(&handle).copied()
    }

    pub async fn set_swallow_mode_set(&self, swallow_mode_set: bool) {
        self.state.lock().await.swallow_mode_set = swallow_mode_set;
    }

    /// Synchronous part of command processing: the checks a controller
    /// performs before accepting a command.
    fn validate(&self, command: &Command) -> Status {
        match command {
            Command::AddSystemCodeRouting { .. } | Command::RemoveSystemCodeRouting { .. }
                if !self.nci_version.supports_system_code_routing() || !self.scbr_supported =>
            {
                Status::NotSupported
            }
            Command::AddAidRouting { aid, .. } if aid.len() > MAX_AID_LEN => Status::InvalidParam,
            Command::AddAidRouting { aid, .. }
                if aid.is_empty() && !self.nci_version.supports_system_code_routing() =>
            {
                Status::NotSupported
            }
            Command::AddApduPatternRouting { pattern, mask, .. } if pattern.len() != mask.len() => {
                Status::InvalidParam
            }
            Command::SetTechnologyRouting { handle, .. }
            | Command::SetProtocolRouting { handle, .. }
            | Command::EeModeSet { handle, .. }
                if !handle.is_valid() =>
            {
                Status::InvalidParam
            }
            _ => Status::Ok,
        }
    }
}

impl Nfcc for EmulatorHandle {
    fn nci_version(&self) -> NciVersion {
        self.nci_version
    }

    fn send(&self, command: Command) -> Status {
        match self.validate(&command) {
            Status::Ok => (),
            status => {
                debug!("rejecting {}: {:?}", command.name(), status);
                return status;
            }
        }
        match self.command_tx.send(command) {
            Ok(()) => Status::Ok,
            Err(_) => Status::Failed,
        }
    }
}

impl Controller {
    fn send_event(&self, event: Event) {
        self.sink.deliver(event)
    }

    async fn ee_register(&self) -> Result<()> {
        info!("+ ee_register()");
        let ees = self.state.lock().await.ees.clone();
        self.send_event(Event::EeRegistered { status: Status::Ok });
        self.send_event(Event::EeDiscovered { status: Status::Ok, ees });
        Ok(())
    }

    async fn ee_mode_set(&self, handle: EeHandle, mode: EeMode) -> Result<()> {
        info!("+ ee_mode_set({}, {:?})", handle, mode);
        let mut state = self.state.lock().await;
        if state.swallow_mode_set {
            warn!("ee_mode_set: not answering");
            if let Some(delay) = state.recovery_delay {
                state.pending_recovery = Some(time::Instant::now() + delay);
            }
            return Ok(());
        }

        let ee_status = match mode {
            EeMode::Activate => EeStatus::Active,
            EeMode::Deactivate => EeStatus::Inactive,
        };
        let event = match state.ees.iter_mut().find(|ee| ee.handle == handle) {
            Some(ee) => {
                ee.status = ee_status;
                Event::EeModeSet { status: Status::Ok, handle, ee_status }
            }
            None => {
                Event::EeModeSet { status: Status::Failed, handle, ee_status: EeStatus::Removed }
            }
        };
        drop(state);
        self.send_event(event);
        Ok(())
    }

    async fn set_technology_routing(&self, handle: EeHandle, masks: PowerMasks) -> Result<()> {
        debug!("+ set_technology_routing({}, {:?})", handle, masks);
        let mut state = self.state.lock().await;
        if masks.is_empty() {
            state.routing.technology.remove(&handle);
        } else {
            state.routing.technology.insert(handle, masks);
        }
        drop(state);
        self.send_event(Event::TechnologyRoutingSet { status: Status::Ok });
        Ok(())
    }

    async fn set_protocol_routing(&self, handle: EeHandle, masks: PowerMasks) -> Result<()> {
        debug!("+ set_protocol_routing({}, {:?})", handle, masks);
        let mut state = self.state.lock().await;
        if masks.is_empty() {
            state.routing.protocol.remove(&handle);
        } else {
            state.routing.protocol.insert(handle, masks);
        }
        drop(state);
        self.send_event(Event::ProtocolRoutingSet { status: Status::Ok });
        Ok(())
    }

    async fn add_aid_routing(&self, route: AidRoute) -> Result<()> {
        debug!("+ add_aid_routing({:02x?}, {})", route.aid.as_ref(), route.handle);
        let mut state = self.state.lock().await;
        state.routing.aids.retain(|entry| entry.aid != route.aid);
        state.routing.aids.push(route);
        drop(state);
        self.send_event(Event::AidAdded { status: Status::Ok });
        Ok(())
    }

    async fn remove_aid_routing(&self, aid: Option<Bytes>) -> Result<()> {
        debug!("+ remove_aid_routing({:02x?})", aid.as_deref());
        let mut state = self.state.lock().await;
        let status = match aid {
            Some(aid) => {
                let len = state.routing.aids.len();
                state.routing.aids.retain(|entry| entry.aid != aid);
                if state.routing.aids.len() < len {
                    Status::Ok
                } else {
                    Status::Failed
                }
            }
            None => {
                state.routing.aids.clear();
                Status::Ok
            }
        };
        drop(state);
        self.send_event(Event::AidRemoved { status });
        Ok(())
    }

    async fn add_system_code_routing(
        &self,
        system_code: u16,
        handle: EeHandle,
        power_state: u8,
    ) -> Result<()> {
        debug!("+ add_system_code_routing({:#06x}, {})", system_code, handle);
        self.state.lock().await.routing.system_codes.insert(system_code, (handle, power_state));
        self.send_event(Event::SystemCodeAdded { status: Status::Ok });
        Ok(())
    }

    async fn remove_system_code_routing(&self, system_code: u16) -> Result<()> {
        debug!("+ remove_system_code_routing({:#06x})", system_code);
        let removed = self.state.lock().await.routing.system_codes.remove(&system_code);
        let status = if removed.is_some() { Status::Ok } else { Status::Failed };
        self.send_event(Event::SystemCodeRemoved { status });
        Ok(())
    }

    async fn add_apdu_pattern_routing(&self, route: ApduRoute) -> Result<()> {
        debug!("+ add_apdu_pattern_routing({:02x?}, {})", route.pattern.as_ref(), route.handle);
        let mut state = self.state.lock().await;
        state.routing.apdu_patterns.retain(|entry| entry.pattern != route.pattern);
        state.routing.apdu_patterns.push(route);
        drop(state);
        self.send_event(Event::ApduPatternAdded { status: Status::Ok });
        Ok(())
    }

    async fn remove_apdu_pattern_routing(&self, pattern: Bytes) -> Result<()> {
        debug!("+ remove_apdu_pattern_routing({:02x?})", pattern.as_ref());
        let mut state = self.state.lock().await;
        let len = state.routing.apdu_patterns.len();
        state.routing.apdu_patterns.retain(|entry| entry.pattern != pattern);
        let status =
            if state.routing.apdu_patterns.len() < len { Status::Ok } else { Status::Failed };
        drop(state);
        self.send_event(Event::ApduPatternRemoved { status });
        Ok(())
    }

    async fn update_now(&self) -> Result<()> {
        debug!("+ update_now()");
        self.state.lock().await.routing.updates += 1;
        self.send_event(Event::EeUpdated { status: Status::Ok });
        Ok(())
    }

    async fn register_felica_system_code(&self, system_code: u16) -> Result<()> {
        debug!("+ register_felica_system_code_on_host({:#06x})", system_code);
        let mut state = self.state.lock().await;
        let handle = state.next_ce_handle;
        state.next_ce_handle += 1;
        state.felica_registrations.insert(handle, system_code);
        drop(state);
        self.send_event(Event::CeRegistered { status: Status::Ok, handle });
        Ok(())
    }

    async fn deregister_felica_system_code(&self, handle: u16) -> Result<()> {
        debug!("+ deregister_felica_system_code_on_host({:#06x})", handle);
        self.state.lock().await.felica_registrations.remove(&handle);
        self.send_event(Event::CeDeregistered { handle });
        Ok(())
    }

    async fn receive_command(&self, command: Command) -> Result<()> {
        match command {
            Command::EeRegister => self.ee_register().await,
            Command::EeDeregister => {
                info!("+ ee_deregister()");
                self.send_event(Event::EeDeregistered);
                Ok(())
            }
            Command::EeModeSet { handle, mode } => self.ee_mode_set(handle, mode).await,
            Command::SetTechnologyRouting { handle, masks } => {
                self.set_technology_routing(handle, masks).await
            }
            Command::SetProtocolRouting { handle, masks } => {
                self.set_protocol_routing(handle, masks).await
            }
            Command::AddAidRouting { handle, aid, power_state, aid_info } => {
                self.add_aid_routing(AidRoute { aid, handle, power_state, aid_info }).await
            }
            Command::RemoveAidRouting { aid } => self.remove_aid_routing(Some(aid)).await,
            Command::RemoveAllAidRouting => self.remove_aid_routing(None).await,
            Command::AddSystemCodeRouting { system_code, handle, power_state } => {
                self.add_system_code_routing(system_code, handle, power_state).await
            }
            Command::RemoveSystemCodeRouting { system_code } => {
                self.remove_system_code_routing(system_code).await
            }
            Command::AddApduPatternRouting { handle, pattern, mask, power_state } => {
                self.add_apdu_pattern_routing(ApduRoute { pattern, mask, handle, power_state })
                    .await
            }
            Command::RemoveApduPatternRouting { pattern } => {
                self.remove_apdu_pattern_routing(pattern).await
            }
            Command::UpdateNow => self.update_now().await,
            Command::ConfigureUiccListenTech { handle, technologies } => {
                debug!("+ configure_uicc_listen_tech({}, {:#04x})", handle, technologies);
                self.state.lock().await.uicc_listen_technologies.insert(handle, technologies);
                Ok(())
            }
            Command::SetIsoDepListenTech { technologies } => {
                debug!("+ set_iso_dep_listen_tech({:#04x})", technologies);
                self.state.lock().await.iso_dep_listen_technologies = technologies;
                Ok(())
            }
            Command::RegisterAidOnHost { aid } => {
                debug!("+ register_aid_on_host({:02x?})", aid.as_ref());
                self.state.lock().await.host_wildcard_aid = aid.is_empty();
                Ok(())
            }
            Command::RegisterFelicaSystemCodeOnHost { system_code, .. } => {
                self.register_felica_system_code(system_code).await
            }
            Command::DeregisterFelicaSystemCodeOnHost { handle } => {
                self.deregister_felica_system_code(handle).await
            }
        }
    }

    async fn receive_stimulus(&self, stimulus: Stimulus) -> Result<()> {
        match stimulus {
            Stimulus::CeActivated { technology } => {
                self.send_event(Event::CeActivated { technology })
            }
            Stimulus::CeDeactivated { technology } => {
                self.send_event(Event::CeDeactivated { technology })
            }
            Stimulus::CeData { technology, mut data } => {
                // Segment the data unit into packets of the maximum payload
                // size; every segment but the last is flagged to continue.
                loop {
                    let chunk_length = std::cmp::min(MAX_DATA_PACKET_PAYLOAD_SIZE, data.len());
                    let chunk = data.split_to(chunk_length);
                    let status = if data.is_empty() { Status::Ok } else { Status::Continue };
                    self.send_event(Event::CeData { technology, status, data: chunk });
                    if data.is_empty() {
                        break;
                    }
                }
            }
            Stimulus::EeStatusChanged { handle, ee_status } => {
                let mut state = self.state.lock().await;
                if let Some(ee) = state.ees.iter_mut().find(|ee| ee.handle == handle) {
                    ee.status = ee_status;
                }
                let ees = state.ees.clone();
                drop(state);
                self.send_event(Event::NewEe { handle, ee_status });
                self.send_event(Event::EeDiscovered { status: Status::Ok, ees });
            }
            Stimulus::RecoveryComplete { recovered } => {
                self.send_event(Event::RecoveryComplete { recovered })
            }
        }
        Ok(())
    }

    /// Timer handler, delivers the delayed notifications that are due.
    async fn tick(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.pending_recovery {
            Some(deadline) if deadline <= time::Instant::now() => {
                state.pending_recovery = None;
                drop(state);
                info!("EE recovery complete");
                self.send_event(Event::RecoveryComplete { recovered: true });
            }
            _ => (),
        }
        Ok(())
    }
}

impl EmulatorTask {
    /// Main routine of the emulated NFCC. Returns once the command channel
    /// is closed.
    pub async fn run(self, sink: EventSink) -> Result<()> {
        let EmulatorTask { mut command_rx, mut stimulus_rx, state } = self;
        let nfcc = Controller { sink, state };

        // Timer for tick events.
        let mut timer = time::interval(TICK_PERIOD);

        loop {
            select! {
                command = command_rx.recv() => match command {
                    Some(command) => nfcc.receive_command(command).await?,
                    None => return Ok(()),
                },
                Some(stimulus) = stimulus_rx.recv() => nfcc.receive_stimulus(stimulus).await?,
                _ = timer.tick() => nfcc.tick().await?,
            }
        }
    }
}
