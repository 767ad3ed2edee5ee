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

//! Implementation of the listen mode routing manager.
//!
//! Every operation that talks to the NFCC acquires the [`Channel`] of its
//! command kind, issues the command and blocks until the matching event is
//! delivered to the [`EventSink`] from the NFCC callback thread. Errors are
//! logged and reported to callers as `bool`, [`Status`] or `Option`.

use crate::card_emulation::{CardEmulationDataPath, HostEmulationListener};
use crate::connection::PowerSwitch;
use crate::error::{Result, RoutingError};
use crate::events::EventSink;
use crate::nci::{
    power, protocol, technology, Command, EeHandle, EeInfo, EeMode, EeStatus, GenericSeId,
    NciVersion, Nfcc, PowerMasks, Status,
};
use crate::policy::{RoutingPolicy, ROUTE_ESE, ROUTE_HOST};
use crate::route_table::{derive_default_routes, EmptyAidPolicy, RouteEntry, RoutingTables};
use crate::secure_element::SecureElementDirectory;
use crate::sync::{lock, Channel, ChannelId, Latch, Transaction};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Routing entry kinds accepted by [`RoutingManager::set_routing_entry`]
/// and [`RoutingManager::clear_routing_entry`].
pub mod routing_type {
    pub const TECHNOLOGY: u8 = 0x01;
    pub const PROTOCOL: u8 = 0x02;
    pub const AID: u8 = 0x04;
}

const MAX_AID_LEN: usize = 16;
/// Route selection category of the empty AID entry.
const AID_INFO_EMPTY: u8 = 0x10;
/// System code followed by NFCID2 and PMm.
const T3T_IDENTIFIER_LEN: usize = 2 + 8 + 8;
const SYS_CODE_PWR_STATE_HOST: u8 = power::SWITCH_ON;
/// Locations reset by [`RoutingManager::clear_routing_entry`].
const CLEARED_LOCATIONS: [EeHandle; 4] =
    [EeHandle::HOST, EeHandle::UICC1, EeHandle::ESE, EeHandle::UICC2];

/// Completion carried by a routing event.
pub(crate) trait Completion {
    fn status(&self) -> Status;
}

impl Completion for Status {
    fn status(&self) -> Status {
        *self
    }
}

/// Completion of a routing channel request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct RoutingAck {
    pub status: Status,
    /// Handle of a Felica system code registered on the host.
    pub handle: Option<u16>,
}

impl Completion for RoutingAck {
    fn status(&self) -> Status {
        self.status
    }
}

/// Completion of an EE mode set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ModeSetAck {
    pub status: Status,
    pub handle: EeHandle,
    pub ee_status: EeStatus,
}

impl Completion for ModeSetAck {
    fn status(&self) -> Status {
        self.status
    }
}

/// Felica host registrations with a system code route, by registration
/// handle. Guarded by the routing channel.
pub(crate) type SystemCodeHandles = HashMap<u16, u16>;

#[derive(Debug, Default)]
struct EngineState {
    se_tech_mask: u8,
    scbr_supported: bool,
}

/// State shared between the manager, its event sink and the wired
/// connections.
pub(crate) struct Shared {
    pub nfcc: Arc<dyn Nfcc>,
    pub directory: Arc<dyn SecureElementDirectory>,
    pub policy: RoutingPolicy,
    pub current_uicc_slot: AtomicU8,
    pub ee_register: Channel<Status>,
    pub mode_set: Channel<ModeSetAck>,
    pub routing: Channel<RoutingAck, SystemCodeHandles>,
    pub aid: Channel<Status>,
    pub apdu_pattern: Channel<Status>,
    pub ee_update: Channel<Status>,
    /// Last EE list reported by the NFCC.
    pub ee_info: Latch<Vec<EeInfo>>,
    pub recovery: Latch<bool>,
    /// Default routes derived from the policy and the last EE list.
    pub default_routes: Mutex<RoutingTables>,
    /// Routes committed to the NFCC.
    pub tables: Mutex<RoutingTables>,
    state: Mutex<EngineState>,
    pub card_emulation: CardEmulationDataPath,
    pub power_switch: PowerSwitch,
}

fn check<T: Completion>(command: &'static str, completion: T) -> Result<T> {
    match completion.status() {
        Status::Ok => Ok(completion),
        status => Err(RoutingError::Failed { command, status }),
    }
}

/// Log the outcome of a best-effort step.
fn succeeded<T>(operation: &str, result: Result<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => {
            error!("{}: {}", operation, err);
            false
        }
    }
}

/// Technology masks used for the AOSP default routes.
fn default_tech_masks(value: u8) -> PowerMasks {
    PowerMasks {
        switch_on: value,
        screen_lock: value,
        screen_off: value,
        screen_off_lock: value,
        ..Default::default()
    }
}

impl Shared {
    /// Issue `command` on the channel held by `tx` and wait for its
    /// completion.
    pub fn execute<T: Completion, S>(
        &self,
        tx: &mut Transaction<'_, T, S>,
        command: Command,
    ) -> Result<T> {
        debug!("> {}", command.name());
        let completion = tx.round_trip(&command, || self.nfcc.send(command.clone()))?;
        check(command.name(), completion)
    }

    /// Same as [`Shared::execute`] for events the NFCC may never deliver.
    pub fn execute_timeout<T: Completion, S>(
        &self,
        tx: &mut Transaction<'_, T, S>,
        command: Command,
        timeout: core::time::Duration,
    ) -> Result<T> {
        debug!("> {} (timeout {:?})", command.name(), timeout);
        let completion =
            tx.round_trip_timeout(&command, timeout, || self.nfcc.send(command.clone()))?;
        check(command.name(), completion)
    }

    /// Issue a command that has no completion event.
    fn fire(&self, command: Command) -> Result<()> {
        debug!("> {}", command.name());
        match self.nfcc.send(command.clone()) {
            Status::Ok => Ok(()),
            status => Err(RoutingError::Rejected { command: command.name(), status }),
        }
    }

    fn current_slot(&self) -> u8 {
        self.current_uicc_slot.load(Ordering::Relaxed)
    }

    pub fn route_location(&self, route: u8) -> EeHandle {
        self.policy.route_location(route, self.current_slot())
    }

    fn scbr_supported(&self) -> bool {
        lock(&self.state).scbr_supported
    }

    /// Recompute the default routes for the EE list `ees`.
    pub fn refresh_default_routes(&self, ees: &[EeInfo]) -> RoutingTables {
        let tables =
            derive_default_routes(&self.policy, self.current_slot(), ees, self.scbr_supported());
        *lock(&self.default_routes) = tables.clone();
        tables
    }

    /// EE mode set bounded by the NFCEE timeout.
    pub fn set_ee_mode(&self, handle: EeHandle, mode: EeMode) -> Result<ModeSetAck> {
        let mut tx = self.mode_set.begin();
        let timeout = self.policy.nfcee_timeout;
        self.execute_timeout(&mut tx, Command::EeModeSet { handle, mode }, timeout)
    }

    fn commit_technology(
        &self,
        tx: &mut Transaction<'_, RoutingAck, SystemCodeHandles>,
        location: EeHandle,
        masks: PowerMasks,
    ) -> Result<RouteEntry> {
        let entry = lock(&self.tables).technology.merged(location, masks);
        self.execute(tx, Command::SetTechnologyRouting { handle: location, masks: entry.masks })?;
        lock(&self.tables).technology.insert(entry);
        Ok(entry)
    }

    fn commit_protocol(
        &self,
        tx: &mut Transaction<'_, RoutingAck, SystemCodeHandles>,
        location: EeHandle,
        masks: PowerMasks,
    ) -> Result<RouteEntry> {
        let entry = lock(&self.tables).protocol.merged(location, masks);
        self.execute(tx, Command::SetProtocolRouting { handle: location, masks: entry.masks })?;
        lock(&self.tables).protocol.insert(entry);
        Ok(entry)
    }

    fn clear_technology(
        &self,
        tx: &mut Transaction<'_, RoutingAck, SystemCodeHandles>,
        location: EeHandle,
    ) -> Result<()> {
        let masks = PowerMasks::default();
        self.execute(tx, Command::SetTechnologyRouting { handle: location, masks })?;
        lock(&self.tables).technology.remove(location);
        Ok(())
    }

    fn clear_protocol(
        &self,
        tx: &mut Transaction<'_, RoutingAck, SystemCodeHandles>,
        location: EeHandle,
    ) -> Result<()> {
        let masks = PowerMasks::default();
        self.execute(tx, Command::SetProtocolRouting { handle: location, masks })?;
        lock(&self.tables).protocol.remove(location);
        Ok(())
    }

    /// Restart the listen technologies of the EE `handle`.
    fn reconfigure_listen_tech(&self, handle: EeHandle) {
        let technologies = self.policy.uicc_listen_tech_mask & 0x07;
        for technologies in [0, technologies] {
            let command = Command::ConfigureUiccListenTech { handle, technologies };
            if let Err(err) = self.fire(command) {
                warn!("failed to configure listen technologies of {}: {}", handle, err);
            }
        }
    }
}

/// Listen mode routing manager.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct RoutingManager {
    shared: Arc<Shared>,
}

impl RoutingManager {
    pub fn new(
        nfcc: Arc<dyn Nfcc>,
        directory: Arc<dyn SecureElementDirectory>,
        policy: RoutingPolicy,
    ) -> RoutingManager {
        let power_switch = PowerSwitch::new(directory.clone());
        RoutingManager {
            shared: Arc::new(Shared {
                nfcc,
                directory,
                policy,
                current_uicc_slot: AtomicU8::new(0),
                ee_register: Channel::new(ChannelId::EeRegister),
                mode_set: Channel::new(ChannelId::ModeSet),
                routing: Channel::new(ChannelId::Routing),
                aid: Channel::new(ChannelId::Aid),
                apdu_pattern: Channel::new(ChannelId::ApduPattern),
                ee_update: Channel::new(ChannelId::EeUpdate),
                ee_info: Latch::new(),
                recovery: Latch::new(),
                default_routes: Mutex::new(RoutingTables::default()),
                tables: Mutex::new(RoutingTables::default()),
                state: Mutex::new(EngineState::default()),
                card_emulation: CardEmulationDataPath::new(),
                power_switch,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Entry point for the events of the NFCC this manager drives.
    pub fn event_sink(&self) -> EventSink {
        EventSink::new(self.shared.clone())
    }

    pub fn set_host_emulation_listener(&self, listener: Arc<dyn HostEmulationListener>) {
        self.shared.card_emulation.set_listener(Some(listener));
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.shared.policy
    }

    pub fn power_switch(&self) -> &PowerSwitch {
        &self.shared.power_switch
    }

    pub fn nci_version(&self) -> NciVersion {
        self.shared.nfcc.nci_version()
    }

    /// Register with the NFCC and install the initial routes.
    ///
    /// Fails only when the EE registration fails, in which case the manager
    /// must not be used.
    pub fn initialize(&self) -> bool {
        info!("+ initialize()");
        let shared = &self.shared;
        let policy = &shared.policy;

        if let Err(err) = self.try_configure_ee_register(true) {
            error!("initialize: failed to register: {}", err);
            return false;
        }
        shared.card_emulation.clear();

        if policy.offhost_route != 0 || policy.felica_route != 0 {
            debug!(
                "initialize: technology routing (offhost {:#04x}, felica {:#04x})",
                policy.offhost_route, policy.felica_route
            );
            let ees = match shared.ee_info.get() {
                Some(ees) => ees,
                None => {
                    info!("initialize: waiting for EE info");
                    shared.ee_info.wait()
                }
            };
            for ee in ees.iter() {
                self.route_technologies_to_ee(ee);
            }
        }

        // The host only listens for ISO-DEP on Nfc-A.
        let technologies = technology::A & policy.host_listen_tech_mask;
        if let Err(err) = shared.fire(Command::SetIsoDepListenTech { technologies }) {
            error!("initialize: failed to configure CE ISO-DEP technologies: {}", err);
        }
        if let Err(err) = shared.fire(Command::RegisterAidOnHost { aid: Bytes::new() }) {
            error!("initialize: failed to register wildcard AID on host: {}", err);
        }

        if self.nci_version().supports_system_code_routing() && policy.sys_code != 0 {
            self.register_default_system_code();
        }

        let ees = shared.ee_info.get().unwrap_or_default();
        shared.refresh_default_routes(&ees);
        true
    }

    /// Route the off-host Nfc-A and Felica technologies to `ee` when it is
    /// the configured destination.
    fn route_technologies_to_ee(&self, ee: &EeInfo) {
        let shared = &self.shared;
        let policy = &shared.policy;
        let mut se_tech_mask = 0;
        if policy.offhost_route != 0
            && ee.handle == EeHandle::from_nfcee_id(policy.offhost_route)
            && ee.technologies & technology::A != 0
        {
            se_tech_mask |= technology::A;
        }
        if policy.felica_route != 0
            && ee.handle == EeHandle::from_nfcee_id(policy.felica_route)
            && ee.technologies & technology::F != 0
        {
            se_tech_mask |= technology::F;
        }
        debug!("initialize: EE {} technologies {:#04x}", ee.handle, se_tech_mask);
        if se_tech_mask == 0 {
            return;
        }

        let command =
            Command::ConfigureUiccListenTech { handle: ee.handle, technologies: se_tech_mask };
        if let Err(err) = shared.fire(command) {
            error!("initialize: failed to configure UICC listen technologies: {}", err);
        }
        let masks = PowerMasks {
            switch_on: se_tech_mask,
            switch_off: se_tech_mask,
            screen_lock: se_tech_mask,
            screen_off: se_tech_mask,
            screen_off_lock: se_tech_mask,
            ..Default::default()
        };
        let mut tx = shared.routing.begin();
        if let Err(err) = shared.commit_technology(&mut tx, ee.handle, masks) {
            error!("initialize: failed to configure UICC technology routing: {}", err);
        }
        lock(&shared.state).se_tech_mask |= se_tech_mask;
    }

    fn register_default_system_code(&self) {
        let shared = &self.shared;
        let policy = &shared.policy;
        let mut power_state = policy.sys_code_power;
        let location = match policy.sys_code_route {
            ROUTE_HOST => {
                power_state &= power::HOST_SAFE;
                EeHandle::HOST
            }
            ROUTE_ESE => EeHandle::ESE,
            route => self.uicc_route_loc_id(route),
        };
        if !location.is_valid() {
            error!(
                "initialize: system code route {:#04x} does not resolve",
                policy.sys_code_route
            );
            return;
        }

        let mut tx = shared.routing.begin();
        let command = Command::AddSystemCodeRouting {
            system_code: policy.sys_code,
            handle: location,
            power_state,
        };
        let scbr_supported = match shared.execute(&mut tx, command) {
            Ok(_) => {
                debug!("initialize: registered system code {:#06x}", policy.sys_code);
                true
            }
            Err(RoutingError::Rejected { status: Status::NotSupported, .. }) => {
                error!("initialize: SCBR not supported");
                false
            }
            Err(err @ RoutingError::Failed { .. }) => {
                error!("initialize: failed to register system code: {}", err);
                true
            }
            Err(err) => {
                error!("initialize: failed to register system code: {}", err);
                false
            }
        };
        lock(&shared.state).scbr_supported = scbr_supported;
    }

    /// Route the default technologies and protocols to the default EE.
    pub fn enable_routing_to_host(&self) {
        info!("+ enable_routing_to_host()");
        let shared = &self.shared;
        let policy = &shared.policy;
        let se_tech_mask = self.se_tech_mask();
        let scbr_supported = shared.scbr_supported();
        let default_ee = EeHandle::from_route(policy.default_ee);
        let felica = EeHandle::from_route(policy.felica_route);
        let off_states = |mask: u8| if policy.default_ee != 0 { mask } else { 0 };
        let proto_masks = |mask: u8| PowerMasks {
            switch_on: mask,
            screen_lock: mask,
            screen_off: off_states(mask),
            screen_off_lock: off_states(mask),
            ..Default::default()
        };

        let mut tx = shared.routing.begin();
        if policy.default_ee == policy.felica_route {
            // Nfc-A and Nfc-F share one NFCEE: route both at once.
            let tech = se_tech_mask ^ (technology::A | technology::F);
            if tech != 0 {
                succeeded(
                    "enable_routing_to_host: Nfc-A/Nfc-F",
                    shared.commit_technology(&mut tx, default_ee, default_tech_masks(tech)),
                );
            }
            let proto = if scbr_supported {
                protocol::ISO_DEP
            } else {
                protocol::ISO_DEP | protocol::T3T
            };
            succeeded(
                "enable_routing_to_host: protocols",
                shared.commit_protocol(&mut tx, default_ee, proto_masks(proto)),
            );
        } else {
            if se_tech_mask & technology::A == 0 {
                succeeded(
                    "enable_routing_to_host: Nfc-A",
                    shared.commit_technology(
                        &mut tx,
                        default_ee,
                        default_tech_masks(technology::A),
                    ),
                );
            }
            succeeded(
                "enable_routing_to_host: ISO-DEP",
                shared.commit_protocol(&mut tx, default_ee, proto_masks(protocol::ISO_DEP)),
            );
            if se_tech_mask & technology::F == 0 {
                succeeded(
                    "enable_routing_to_host: Nfc-F",
                    shared.commit_technology(&mut tx, felica, default_tech_masks(technology::F)),
                );
            }
            if !scbr_supported {
                let masks = PowerMasks { switch_on: protocol::T3T, ..Default::default() };
                succeeded(
                    "enable_routing_to_host: T3T",
                    shared.commit_protocol(&mut tx, EeHandle::HOST, masks),
                );
            }
        }
    }

    /// Remove the routes installed by [`RoutingManager::enable_routing_to_host`].
    pub fn disable_routing_to_host(&self) {
        info!("+ disable_routing_to_host()");
        let shared = &self.shared;
        let policy = &shared.policy;
        let se_tech_mask = self.se_tech_mask();
        let default_ee = EeHandle::from_route(policy.default_ee);

        let mut tx = shared.routing.begin();
        if policy.default_ee == policy.felica_route {
            if se_tech_mask ^ (technology::A | technology::F) != 0 {
                succeeded(
                    "disable_routing_to_host: Nfc-A/Nfc-F",
                    shared.clear_technology(&mut tx, default_ee),
                );
            }
            succeeded(
                "disable_routing_to_host: protocols",
                shared.clear_protocol(&mut tx, default_ee),
            );
        } else {
            if se_tech_mask & technology::A == 0 {
                succeeded(
                    "disable_routing_to_host: Nfc-A",
                    shared.clear_technology(&mut tx, default_ee),
                );
            }
            succeeded(
                "disable_routing_to_host: ISO-DEP",
                shared.clear_protocol(&mut tx, default_ee),
            );
            if se_tech_mask & technology::F == 0 {
                let felica = EeHandle::from_route(policy.felica_route);
                succeeded(
                    "disable_routing_to_host: Nfc-F",
                    shared.clear_technology(&mut tx, felica),
                );
            }
            if !shared.scbr_supported() {
                succeeded(
                    "disable_routing_to_host: T3T",
                    shared.clear_protocol(&mut tx, EeHandle::HOST),
                );
            }
        }
    }

    /// Route `aid` to the secure element with generic id `route`.
    pub fn add_aid_routing(&self, aid: &[u8], route: u8, aid_info: u8, power_state: u8) -> bool {
        debug!("+ add_aid_routing({:02x?}, route {:#04x}, power {:#04x})", aid, route, power_state);
        succeeded("add_aid_routing", self.try_add_aid_routing(aid, route, aid_info, power_state))
    }

    fn try_add_aid_routing(
        &self,
        aid: &[u8],
        route: u8,
        aid_info: u8,
        power_state: u8,
    ) -> Result<()> {
        if aid.len() > MAX_AID_LEN {
            return Err(RoutingError::InvalidParameter(format!("AID of {} bytes", aid.len())));
        }
        let shared = &self.shared;
        let handle = shared.directory.resolve_handle(GenericSeId(route));
        if !handle.is_valid() {
            return Err(RoutingError::InvalidRoute(route));
        }
        let power_state =
            if handle.is_host() { power_state & power::HOST_SAFE } else { power_state };
        if power_state == 0 {
            return Err(RoutingError::InvalidParameter("empty power state".to_owned()));
        }

        let mut tx = shared.aid.begin();
        let aid = Bytes::copy_from_slice(aid);
        shared.execute(&mut tx, Command::AddAidRouting { handle, aid, power_state, aid_info })?;
        Ok(())
    }

    pub fn remove_aid_routing(&self, aid: &[u8]) -> bool {
        debug!("+ remove_aid_routing({:02x?})", aid);
        let shared = &self.shared;
        let mut tx = shared.aid.begin();
        let command = Command::RemoveAidRouting { aid: Bytes::copy_from_slice(aid) };
        succeeded("remove_aid_routing", shared.execute(&mut tx, command))
    }

    /// Remove every AID route, the empty AID entry included.
    pub fn clear_aid_table(&self) -> bool {
        debug!("+ clear_aid_table()");
        let shared = &self.shared;
        let mut tx = shared.aid.begin();
        succeeded("clear_aid_table", shared.execute(&mut tx, Command::RemoveAllAidRouting))
    }

    /// Install the ISO7816 default route as the empty AID entry.
    pub fn set_empty_aid_entry(&self, route: u8) -> bool {
        debug!("+ set_empty_aid_entry({:#04x})", route);
        succeeded("set_empty_aid_entry", self.try_set_empty_aid_entry(route))
    }

    fn try_set_empty_aid_entry(&self, route: u8) -> Result<()> {
        if !self.nci_version().supports_system_code_routing() {
            return Err(RoutingError::Unsupported("set_empty_aid_entry"));
        }
        let shared = &self.shared;
        let policy = &shared.policy;
        let location = shared.route_location(route);
        if !location.is_valid() {
            return Err(RoutingError::InvalidRoute(route));
        }

        let active = shared.directory.active_handles();
        let entry = EmptyAidPolicy {
            location,
            power_state: policy.iso7816_power,
            strict_disable: policy.ce_route_strict_disable,
            check_present: policy.check_default_proto_se,
            active: &active,
            gsma_power: policy.gsma_power,
        }
        .derive()
        .ok_or_else(|| RoutingError::InvalidParameter("empty power state".to_owned()))?;
        debug!("set_empty_aid_entry: {} power {:#04x}", entry.location, entry.power_state);

        let mut tx = shared.aid.begin();
        let command = Command::AddAidRouting {
            handle: entry.location,
            aid: Bytes::new(),
            power_state: entry.power_state,
            aid_info: AID_INFO_EMPTY,
        };
        shared.execute(&mut tx, command)?;
        Ok(())
    }

    /// Route technologies (`routing_type::TECHNOLOGY`) or protocols
    /// (`routing_type::PROTOCOL`) selected by `value` to `route`.
    ///
    /// Protocol selector bits are 0x01 ISO-DEP, 0x02 NFC-DEP, 0x04 T3T and
    /// 0x08 ISO7816.
    pub fn set_routing_entry(&self, entry_type: u8, value: u8, route: u8, power: u8) -> Status {
        debug!(
            "+ set_routing_entry(type {:#04x}, value {:#04x}, route {:#04x}, power {:#04x})",
            entry_type, value, route, power
        );
        match self.try_set_routing_entry(entry_type, value, route, power) {
            Ok(()) => Status::Ok,
            Err(err) => {
                error!("set_routing_entry: {}", err);
                err.status()
            }
        }
    }

    fn try_set_routing_entry(
        &self,
        entry_type: u8,
        value: u8,
        route: u8,
        power_state: u8,
    ) -> Result<()> {
        let shared = &self.shared;
        let policy = &shared.policy;
        let location = shared.route_location(route);
        if !location.is_valid() {
            return Err(RoutingError::InvalidRoute(route));
        }
        let active_ee =
            !location.is_host() && shared.directory.active_handles().contains(&location);

        let result = match entry_type {
            routing_type::TECHNOLOGY => {
                let supported = shared.directory.supported_technologies(location);
                let value = value & supported;
                let mut tx = shared.routing.begin();
                if policy.forward_functionality && policy.host_listen_tech_mask != 0 {
                    self.forward_to_host(&mut tx, supported);
                }
                let masks = PowerMasks::from_power_state(value, power_state);
                shared.commit_technology(&mut tx, location, masks).map(|_| ())
            }
            routing_type::PROTOCOL => {
                if !location.is_host() && !active_ee {
                    return Err(RoutingError::UnknownSecureElement(location));
                }
                let power_state =
                    if location.is_host() { power_state & power::HOST_SAFE } else { power_state };
                let mut tx = shared.routing.begin();
                // Rows reach the committed table only once the NFCC accepted them.
                let mut pending = lock(&shared.tables).protocol.clone();
                for (selector, proto) in [
                    (0x01, protocol::ISO_DEP),
                    (0x02, protocol::NFC_DEP),
                    (0x04, protocol::T3T),
                    (0x08, protocol::ISO7816),
                ] {
                    if value & selector != 0 {
                        pending.merge(location, PowerMasks::from_power_state(proto, power_state));
                    }
                }
                pending.iter().fold(Ok(()), |result, entry| {
                    let command =
                        Command::SetProtocolRouting { handle: entry.location, masks: entry.masks };
                    let committed = shared.execute(&mut tx, command).map(|_| {
                        lock(&shared.tables).protocol.insert(*entry);
                    });
                    result.and(committed)
                })
            }
            other => {
                return Err(RoutingError::InvalidParameter(format!("routing type {:#04x}", other)))
            }
        };

        if active_ee && policy.uicc_listen_tech_mask != 0 {
            shared.reconfigure_listen_tech(location);
        }
        result
    }

    /// Route to the host the technology among A and B a single technology
    /// EE does not support, when the host listens on it.
    fn forward_to_host(
        &self,
        tx: &mut Transaction<'_, RoutingAck, SystemCodeHandles>,
        supported: u8,
    ) {
        let shared = &self.shared;
        let fallback = match supported & (technology::A | technology::B) {
            technology::B => technology::A,
            technology::A => technology::B,
            _ => return,
        };
        if shared.policy.host_listen_tech_mask & fallback == 0 {
            debug!("set_routing_entry: host does not listen on {:#04x}", fallback);
            return;
        }
        let mut power_state = power::SWITCH_ON;
        if shared.policy.ce_route_strict_disable {
            power_state |= power::SCREEN_LOCK;
        }
        let masks = PowerMasks::from_power_state(fallback, power_state);
        if let Err(err) = shared.commit_technology(tx, EeHandle::HOST, masks) {
            error!("set_routing_entry: failed to forward {:#04x} to host: {}", fallback, err);
        }
    }

    /// Reset the technology, protocol and AID routes selected by
    /// `type_mask`. Every step is attempted; the result is true only when all
    /// of them succeeded.
    pub fn clear_routing_entry(&self, type_mask: u8) -> bool {
        debug!("+ clear_routing_entry({:#04x})", type_mask);
        let shared = &self.shared;
        let mut all_succeeded = true;

        if type_mask & routing_type::TECHNOLOGY != 0 {
            let mut tx = shared.routing.begin();
            for location in CLEARED_LOCATIONS {
                all_succeeded &= succeeded(
                    "clear_routing_entry: technology",
                    shared.clear_technology(&mut tx, location),
                );
            }
        }
        if type_mask & routing_type::PROTOCOL != 0 {
            let mut tx = shared.routing.begin();
            for location in CLEARED_LOCATIONS {
                all_succeeded &= succeeded(
                    "clear_routing_entry: protocol",
                    shared.clear_protocol(&mut tx, location),
                );
            }
        }
        if type_mask & routing_type::AID != 0 {
            all_succeeded &= self.clear_aid_table();
        }
        all_succeeded
    }

    /// Ask the NFCC to apply the routing table now.
    pub fn commit_routing(&self) -> bool {
        debug!("+ commit_routing()");
        let shared = &self.shared;
        let mut tx = shared.ee_update.begin();
        succeeded("commit_routing", shared.execute(&mut tx, Command::UpdateNow))
    }

    /// Register a T3T identifier (system code, NFCID2 and PMm) for Felica
    /// card emulation on the host. Returns the registration handle.
    pub fn register_t3t_identifier(&self, t3t_identifier: &[u8]) -> Option<u16> {
        debug!("+ register_t3t_identifier({:02x?})", t3t_identifier);
        match self.try_register_t3t_identifier(t3t_identifier) {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("register_t3t_identifier: {}", err);
                None
            }
        }
    }

    fn try_register_t3t_identifier(&self, t3t_identifier: &[u8]) -> Result<u16> {
        if t3t_identifier.len() != T3T_IDENTIFIER_LEN {
            return Err(RoutingError::InvalidParameter(format!(
                "T3T identifier of {} bytes",
                t3t_identifier.len()
            )));
        }
        let shared = &self.shared;
        let system_code = u16::from_be_bytes([t3t_identifier[0], t3t_identifier[1]]);
        let mut nfcid2 = [0; 8];
        nfcid2.copy_from_slice(&t3t_identifier[2..10]);
        let mut pmm = [0; 8];
        pmm.copy_from_slice(&t3t_identifier[10..18]);

        let mut tx = shared.routing.begin();
        let ack = shared.execute(
            &mut tx,
            Command::RegisterFelicaSystemCodeOnHost { system_code, nfcid2, pmm },
        )?;
        let handle = ack.handle.ok_or(RoutingError::Failed {
            command: "register_felica_system_code_on_host",
            status: Status::Failed,
        })?;

        if shared.scbr_supported() && self.nci_version().supports_system_code_routing() {
            shared.execute(
                &mut tx,
                Command::AddSystemCodeRouting {
                    system_code,
                    handle: EeHandle::HOST,
                    power_state: SYS_CODE_PWR_STATE_HOST,
                },
            )?;
            tx.state().insert(handle, system_code);
        } else {
            warn!("register_t3t_identifier: SCBR not supported");
        }
        Ok(handle)
    }

    pub fn deregister_t3t_identifier(&self, handle: u16) {
        debug!("+ deregister_t3t_identifier({:#06x})", handle);
        let shared = &self.shared;
        let mut tx = shared.routing.begin();
        succeeded(
            "deregister_t3t_identifier",
            shared.execute(&mut tx, Command::DeregisterFelicaSystemCodeOnHost { handle }),
        );
        if !shared.scbr_supported() {
            return;
        }
        if let Some(system_code) = tx.state().remove(&handle) {
            if system_code != 0 {
                succeeded(
                    "deregister_t3t_identifier: system code",
                    shared.execute(&mut tx, Command::RemoveSystemCodeRouting { system_code }),
                );
            }
        }
    }

    /// Route command APDUs matching `pattern` under `mask` to the secure
    /// element with generic id `route`.
    pub fn add_apdu_routing(
        &self,
        route: u8,
        power_state: u8,
        pattern: &[u8],
        mask: &[u8],
    ) -> bool {
        debug!("+ add_apdu_routing(route {:#04x}, power {:#04x})", route, power_state);
        succeeded("add_apdu_routing", self.try_add_apdu_routing(route, power_state, pattern, mask))
    }

    fn try_add_apdu_routing(
        &self,
        route: u8,
        power_state: u8,
        pattern: &[u8],
        mask: &[u8],
    ) -> Result<()> {
        if pattern.is_empty() || pattern.len() != mask.len() {
            return Err(RoutingError::InvalidParameter(format!(
                "APDU pattern of {} bytes with mask of {} bytes",
                pattern.len(),
                mask.len()
            )));
        }
        let shared = &self.shared;
        let handle = shared.directory.resolve_handle(GenericSeId(route));
        if !handle.is_valid() {
            return Err(RoutingError::InvalidRoute(route));
        }

        let mut tx = shared.apdu_pattern.begin();
        let command = Command::AddApduPatternRouting {
            handle,
            pattern: Bytes::copy_from_slice(pattern),
            mask: Bytes::copy_from_slice(mask),
            power_state,
        };
        shared.execute(&mut tx, command)?;
        Ok(())
    }

    pub fn remove_apdu_routing(&self, pattern: &[u8]) -> bool {
        debug!("+ remove_apdu_routing({:02x?})", pattern);
        let shared = &self.shared;
        let mut tx = shared.apdu_pattern.begin();
        let command =
            Command::RemoveApduPatternRouting { pattern: Bytes::copy_from_slice(pattern) };
        succeeded("remove_apdu_routing", shared.execute(&mut tx, command))
    }

    /// Deactivate the active EEs before the NFCC is switched off.
    pub fn on_nfcc_shutdown(&self) {
        info!("+ on_nfcc_shutdown()");
        let shared = &self.shared;
        if shared.policy.offhost_route == 0 {
            return;
        }
        let ees: Vec<EeInfo> = shared
            .ee_info
            .get()
            .unwrap_or_default()
            .into_iter()
            .filter(|ee| !ee.hci_access && shared.directory.is_active(ee.handle))
            .collect();
        if ees.is_empty() {
            debug!("on_nfcc_shutdown: no active EEs");
        }
        for ee in ees {
            debug!("on_nfcc_shutdown: deactivating {}", ee.handle);
            succeeded("on_nfcc_shutdown", shared.set_ee_mode(ee.handle, EeMode::Deactivate));
        }
    }

    /// Register (and wait for the acknowledgement) or deregister with the
    /// NFCC EE management.
    pub fn configure_ee_register(&self, register: bool) -> bool {
        debug!("+ configure_ee_register({})", register);
        succeeded("configure_ee_register", self.try_configure_ee_register(register))
    }

    fn try_configure_ee_register(&self, register: bool) -> Result<()> {
        let shared = &self.shared;
        if register {
            let mut tx = shared.ee_register.begin();
            shared.execute(&mut tx, Command::EeRegister)?;
            Ok(())
        } else {
            shared.fire(Command::EeDeregister)
        }
    }

    /// Restart the listen technologies of the preferred off-host secure
    /// element.
    pub fn configure_off_host_nfcee_tech_mask(&self) {
        debug!("+ configure_off_host_nfcee_tech_mask()");
        let shared = &self.shared;
        let policy = &shared.policy;
        let default_se = policy.default_se;
        let handle = if default_se & GenericSeId::ESE.0 != 0 {
            EeHandle::ESE
        } else if default_se & GenericSeId::UICC.0 != 0 {
            EeHandle::UICC1
        } else if default_se & GenericSeId::UICC2.0 != 0 && policy.dynamic_dual_uicc {
            policy.secondary_uicc()
        } else {
            EeHandle::INVALID
        };

        if handle.is_valid()
            && shared.directory.active_handles().contains(&handle)
            && policy.uicc_listen_tech_mask != 0
        {
            shared.reconfigure_listen_tech(handle);
        }
    }

    /// Recompute the default routes from the policy and the last EE list.
    pub fn derive_default_routes(&self) -> RoutingTables {
        let ees = self.shared.ee_info.get().unwrap_or_default();
        self.shared.refresh_default_routes(&ees)
    }

    /// Commit the default routes, technology rows before protocol rows.
    pub fn apply_default_routes(&self) -> bool {
        debug!("+ apply_default_routes()");
        let shared = &self.shared;
        let defaults = lock(&shared.default_routes).clone();
        let mut all_succeeded = true;
        let mut tx = shared.routing.begin();
        for entry in defaults.technology.iter().filter(|entry| entry.enabled) {
            all_succeeded &= succeeded(
                "apply_default_routes: technology",
                shared.commit_technology(&mut tx, entry.location, entry.masks),
            );
        }
        for entry in defaults.protocol.iter().filter(|entry| entry.enabled) {
            all_succeeded &= succeeded(
                "apply_default_routes: protocol",
                shared.commit_protocol(&mut tx, entry.location, entry.masks),
            );
        }
        all_succeeded
    }

    /// Routes committed so far, merged by location.
    pub fn route_table(&self) -> RoutingTables {
        lock(&self.shared.tables).clone()
    }

    /// Default routes derived for the last EE list.
    pub fn default_routes(&self) -> RoutingTables {
        lock(&self.shared.default_routes).clone()
    }

    pub fn ee_info(&self) -> Option<Vec<EeInfo>> {
        self.shared.ee_info.get()
    }

    pub fn default_route(&self) -> u8 {
        self.shared.policy.default_ee
    }

    pub fn default_offhost_route(&self) -> u8 {
        self.shared.policy.offhost_route
    }

    pub fn default_felica_route(&self) -> u8 {
        self.shared.policy.felica_route
    }

    pub fn aid_matching_mode(&self) -> u8 {
        self.shared.policy.aid_matching_mode
    }

    pub fn is_scbr_supported(&self) -> bool {
        self.shared.scbr_supported()
    }

    /// Technologies routed to secure elements during initialization.
    pub fn se_tech_mask(&self) -> u8 {
        lock(&self.shared.state).se_tech_mask
    }

    pub fn set_current_uicc_slot(&self, slot: u8) {
        self.shared.current_uicc_slot.store(slot, Ordering::Relaxed);
    }

    pub fn current_uicc_slot(&self) -> u8 {
        self.shared.current_slot()
    }

    pub fn uicc_route(&self, slot: u8) -> EeHandle {
        self.shared.policy.uicc_route(slot)
    }

    /// Resolve a UICC route selector for the current slot selection.
    pub fn uicc_route_loc_id(&self, route: u8) -> EeHandle {
        self.shared.policy.uicc_route_loc_id(route, self.shared.current_slot())
    }
}
