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

//! Commands and events exchanged with the NFCC.
//!
//! The routing manager does not encode NCI packets itself. It drives the
//! controller through the abstract [`Command`] vocabulary and consumes the
//! asynchronous [`Event`]s the controller produces in return.

use bytes::Bytes;
use std::fmt;

/// Handle of an execution environment as assigned by the NFCC.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EeHandle(pub u16);

impl EeHandle {
    /// Device host.
    pub const HOST: EeHandle = EeHandle(0x400);
    /// Embedded secure element.
    pub const ESE: EeHandle = EeHandle(0x4C0);
    /// Primary UICC.
    pub const UICC1: EeHandle = EeHandle(0x480);
    /// Secondary UICC when the second slot selects UICC2.
    pub const UICC2: EeHandle = EeHandle(0x481);
    /// Secondary UICC when the second slot selects UICC3.
    pub const UICC3: EeHandle = EeHandle(0x482);
    /// Reserved value returned when a route does not resolve.
    pub const INVALID: EeHandle = EeHandle(0xFFFF);

    const GROUP_EE: u16 = 0x400;

    /// Build the handle of the NFCEE discovered with identifier `nfcee_id`.
    pub fn from_nfcee_id(nfcee_id: u8) -> EeHandle {
        EeHandle(Self::GROUP_EE | nfcee_id as u16)
    }

    /// Build the handle for a configured NFCEE route, where the
    /// identifier 0 designates the device host.
    pub fn from_route(nfcee_id: u8) -> EeHandle {
        if nfcee_id == 0 {
            EeHandle::HOST
        } else {
            EeHandle::from_nfcee_id(nfcee_id)
        }
    }

    pub fn is_valid(self) -> bool {
        self != EeHandle::INVALID
    }

    pub fn is_host(self) -> bool {
        self == EeHandle::HOST
    }
}

impl fmt::Display for EeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Generic secure element identifier, stable across power cycles.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GenericSeId(pub u8);

impl GenericSeId {
    pub const HOST: GenericSeId = GenericSeId(0x00);
    pub const ESE: GenericSeId = GenericSeId(0x01);
    pub const UICC: GenericSeId = GenericSeId(0x02);
    pub const UICC2: GenericSeId = GenericSeId(0x04);
    pub const UICC3: GenericSeId = GenericSeId(0x08);
}

/// RF technology bits.
pub mod technology {
    pub const A: u8 = 0x01;
    pub const B: u8 = 0x02;
    pub const F: u8 = 0x04;
}

/// RF protocol bits.
pub mod protocol {
    pub const T1T: u8 = 0x01;
    pub const T2T: u8 = 0x02;
    pub const T3T: u8 = 0x04;
    pub const ISO_DEP: u8 = 0x08;
    pub const NFC_DEP: u8 = 0x10;
    /// ISO7816 default route, the empty AID entry on NCI 2.0.
    pub const ISO7816: u8 = 0x20;
}

/// Device power state bits used by listen mode routing entries.
pub mod power {
    /// Screen on and unlocked.
    pub const SWITCH_ON: u8 = 0x01;
    pub const SWITCH_OFF: u8 = 0x02;
    pub const BATTERY_OFF: u8 = 0x04;
    pub const SCREEN_OFF: u8 = 0x08;
    /// Screen on and locked.
    pub const SCREEN_LOCK: u8 = 0x10;
    pub const SCREEN_OFF_LOCK: u8 = 0x20;

    /// The only power states in which the host can receive frames.
    pub const HOST_SAFE: u8 = SWITCH_ON | SCREEN_LOCK;
    /// Power states kept when strict CE routing is enabled.
    pub const STRICT: u8 = SWITCH_ON | SCREEN_OFF | SCREEN_LOCK | SCREEN_OFF_LOCK;
}

/// Status reported by the NFCC, either synchronously when a command is
/// issued or asynchronously in the completion event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Rejected,
    Failed,
    NotSupported,
    InvalidParam,
    /// More fragments of a card emulation data unit follow.
    Continue,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// NCI version implemented by the NFCC.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NciVersion {
    Version10,
    Version11,
    Version20,
}

impl NciVersion {
    /// System code routing and the empty AID entry exist since NCI 2.0.
    pub fn supports_system_code_routing(self) -> bool {
        self >= NciVersion::Version20
    }
}

/// Requested mode of an NFCEE.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EeMode {
    Activate,
    Deactivate,
}

/// Status of an NFCEE as reported by the NFCC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EeStatus {
    Active,
    Inactive,
    Removed,
}

/// Listen mode routing masks of one location, one technology or protocol
/// bitmask per device power state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PowerMasks {
    pub switch_on: u8,
    pub switch_off: u8,
    pub battery_off: u8,
    pub screen_lock: u8,
    pub screen_off: u8,
    pub screen_off_lock: u8,
}

impl PowerMasks {
    /// Spread `value` (technology or protocol bits) over every power state
    /// selected in `power`.
    pub fn from_power_state(value: u8, power_state: u8) -> PowerMasks {
        let select = |bit: u8| if power_state & bit != 0 { value } else { 0 };
        PowerMasks {
            switch_on: select(power::SWITCH_ON),
            switch_off: select(power::SWITCH_OFF),
            battery_off: select(power::BATTERY_OFF),
            screen_lock: select(power::SCREEN_LOCK),
            screen_off: select(power::SCREEN_OFF),
            screen_off_lock: select(power::SCREEN_OFF_LOCK),
        }
    }

    /// OR the masks of `other` into `self`.
    pub fn merge(&mut self, other: &PowerMasks) {
        self.switch_on |= other.switch_on;
        self.switch_off |= other.switch_off;
        self.battery_off |= other.battery_off;
        self.screen_lock |= other.screen_lock;
        self.screen_off |= other.screen_off;
        self.screen_off_lock |= other.screen_off_lock;
    }

    /// Drop the power states in which the host cannot receive frames.
    pub fn host_safe(self) -> PowerMasks {
        PowerMasks {
            switch_on: self.switch_on,
            screen_lock: self.screen_lock,
            ..Default::default()
        }
    }

    /// Union of the masks over all power states.
    pub fn union(&self) -> u8 {
        self.switch_on
            | self.switch_off
            | self.battery_off
            | self.screen_lock
            | self.screen_off
            | self.screen_off_lock
    }

    pub fn is_empty(&self) -> bool {
        self.union() == 0
    }
}

/// Execution environment information received with an EE discovery event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EeInfo {
    pub handle: EeHandle,
    pub status: EeStatus,
    /// Listen technologies supported by the EE.
    pub technologies: u8,
    /// The first interface of the EE is the HCI access interface.
    pub hci_access: bool,
}

/// Commands issued to the NFCC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    EeRegister,
    EeDeregister,
    EeModeSet { handle: EeHandle, mode: EeMode },
    SetTechnologyRouting { handle: EeHandle, masks: PowerMasks },
    SetProtocolRouting { handle: EeHandle, masks: PowerMasks },
    AddAidRouting { handle: EeHandle, aid: Bytes, power_state: u8, aid_info: u8 },
    RemoveAidRouting { aid: Bytes },
    RemoveAllAidRouting,
    AddSystemCodeRouting { system_code: u16, handle: EeHandle, power_state: u8 },
    RemoveSystemCodeRouting { system_code: u16 },
    AddApduPatternRouting { handle: EeHandle, pattern: Bytes, mask: Bytes, power_state: u8 },
    RemoveApduPatternRouting { pattern: Bytes },
    UpdateNow,
    ConfigureUiccListenTech { handle: EeHandle, technologies: u8 },
    SetIsoDepListenTech { technologies: u8 },
    RegisterAidOnHost { aid: Bytes },
    RegisterFelicaSystemCodeOnHost { system_code: u16, nfcid2: [u8; 8], pmm: [u8; 8] },
    DeregisterFelicaSystemCodeOnHost { handle: u16 },
}

impl Command {
    /// Short name used in traces.
    pub fn name(&self) -> &'static str {
        match self {
            Command::EeRegister => "ee_register",
            Command::EeDeregister => "ee_deregister",
            Command::EeModeSet { .. } => "ee_mode_set",
            Command::SetTechnologyRouting { .. } => "set_technology_routing",
            Command::SetProtocolRouting { .. } => "set_protocol_routing",
            Command::AddAidRouting { .. } => "add_aid_routing",
            Command::RemoveAidRouting { .. } => "remove_aid_routing",
            Command::RemoveAllAidRouting => "remove_all_aid_routing",
            Command::AddSystemCodeRouting { .. } => "add_system_code_routing",
            Command::RemoveSystemCodeRouting { .. } => "remove_system_code_routing",
            Command::AddApduPatternRouting { .. } => "add_apdu_pattern_routing",
            Command::RemoveApduPatternRouting { .. } => "remove_apdu_pattern_routing",
            Command::UpdateNow => "update_now",
            Command::ConfigureUiccListenTech { .. } => "configure_uicc_listen_tech",
            Command::SetIsoDepListenTech { .. } => "set_iso_dep_listen_tech",
            Command::RegisterAidOnHost { .. } => "register_aid_on_host",
            Command::RegisterFelicaSystemCodeOnHost { .. } => "register_felica_system_code_on_host",
            Command::DeregisterFelicaSystemCodeOnHost { .. } => {
                "deregister_felica_system_code_on_host"
            }
        }
    }
}

/// Asynchronous events delivered by the NFCC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    EeRegistered { status: Status },
    EeDeregistered,
    EeModeSet { status: Status, handle: EeHandle, ee_status: EeStatus },
    EeDiscovered { status: Status, ees: Vec<EeInfo> },
    TechnologyRoutingSet { status: Status },
    ProtocolRoutingSet { status: Status },
    AidAdded { status: Status },
    AidRemoved { status: Status },
    SystemCodeAdded { status: Status },
    SystemCodeRemoved { status: Status },
    ApduPatternAdded { status: Status },
    ApduPatternRemoved { status: Status },
    EeUpdated { status: Status },
    CeRegistered { status: Status, handle: u16 },
    CeDeregistered { handle: u16 },
    CeActivated { technology: u8 },
    CeDeactivated { technology: u8 },
    CeData { technology: u8, status: Status, data: Bytes },
    RecoveryComplete { recovered: bool },
    PowerLinkControl { status: Status, handle: EeHandle },
    NewEe { handle: EeHandle, ee_status: EeStatus },
    EeAction { handle: EeHandle, trigger: u8 },
}

/// Command interface of the NFCC.
///
/// `send` only reports whether the command could be issued. The outcome is
/// delivered later as an [`Event`] on a thread owned by the implementation.
pub trait Nfcc: Send + Sync {
    fn nci_version(&self) -> NciVersion;

    fn send(&self, command: Command) -> Status;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_masks_spread_value_over_selected_states() {
        let masks =
            PowerMasks::from_power_state(technology::A, power::SWITCH_ON | power::SCREEN_OFF);
        assert_eq!(masks.switch_on, technology::A);
        assert_eq!(masks.screen_off, technology::A);
        assert_eq!(masks.screen_lock, 0);
        assert_eq!(masks.battery_off, 0);
    }

    #[test]
    fn host_safe_masks_keep_screen_on_states() {
        let masks = PowerMasks::from_power_state(technology::B, 0x3F).host_safe();
        assert_eq!(masks, PowerMasks::from_power_state(technology::B, power::HOST_SAFE));
    }

    #[test]
    fn route_zero_is_host() {
        assert_eq!(EeHandle::from_route(0), EeHandle::HOST);
        assert_eq!(EeHandle::from_route(0xC0), EeHandle::ESE);
        assert_eq!(EeHandle::from_nfcee_id(0x80), EeHandle::UICC1);
        assert_eq!(format!("{}", EeHandle::UICC2), "0x0481");
    }
}
