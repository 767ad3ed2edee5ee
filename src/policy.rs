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

//! Static routing policy and route selector resolution.

use crate::config::{self, ConfigStore};
use crate::nci::{technology, EeHandle, GenericSeId};
use core::time::Duration;
use log::{debug, warn};

/// Route selector of the device host.
pub const ROUTE_HOST: u8 = 0x00;
/// Route selector of the embedded secure element.
pub const ROUTE_ESE: u8 = 0x01;
/// Route selector of the primary UICC.
pub const ROUTE_UICC: u8 = 0x02;
/// Route selector of the secondary UICC.
pub const ROUTE_UICC2: u8 = 0x03;

/// AID matching mode reported when the configuration is silent.
pub const AID_MATCHING_EXACT_ONLY: u8 = 0x00;

/// Policy values read once from the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingPolicy {
    /// NFCEE id receiving Nfc-A when the host does not; 0 disables it.
    pub offhost_route: u8,
    /// NFCEE id receiving Nfc-F; 0 designates the host.
    pub felica_route: u8,
    /// Default EE reported to the bridge.
    pub default_ee: u8,
    /// Generic ids of the preferred off-host secure elements.
    pub default_se: u8,
    pub aid_matching_mode: u8,
    pub sys_code_route: u8,
    pub sys_code_power: u8,
    /// Default system code, 0 when absent.
    pub sys_code: u16,
    pub host_listen_tech_mask: u8,
    pub forward_functionality: bool,
    pub felica_power: u8,
    /// Route selector of the ISO7816 default route, `None` when absent.
    pub iso7816_route: Option<u8>,
    pub iso7816_power: u8,
    pub uicc_listen_tech_mask: u8,
    /// GSMA power state override of the ISO7816 default route.
    pub gsma_power: Option<u8>,
    pub check_default_proto_se: bool,
    pub ce_route_strict_disable: bool,
    pub dynamic_dual_uicc: bool,
    /// Generic id selected for the second UICC slot.
    pub uicc2_selected: GenericSeId,
    pub tech_abf_route: u8,
    pub tech_abf_power: u8,
    pub isodep_route: u8,
    pub isodep_power: u8,
    /// Bounded wait of an EE mode set.
    pub nfcee_timeout: Duration,
    /// Bounded wait of the recovery signal after a failed mode set.
    pub recovery_timeout: Duration,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        RoutingPolicy::from_config(&config::NfcConfig::default())
    }
}

impl RoutingPolicy {
    /// Read every policy knob, falling back to the built-in defaults.
    pub fn from_config(config: &dyn ConfigStore) -> RoutingPolicy {
        let byte = |key: &str, default: u8| {
            let value = config.get_unsigned(key, u32::from(default));
            u8::try_from(value).unwrap_or_else(|_| {
                warn!("{}: {:#x} does not fit in a byte, using {:#04x}", key, value, default);
                default
            })
        };
        let flag = |key: &str| config.get_unsigned(key, 0) != 0;

        let default_se = byte(config::NXP_DEFAULT_SE, ROUTE_UICC);
        let default_ee = if config.has_key(config::NXP_DEFAULT_SE) {
            default_se
        } else {
            byte(config::DEFAULT_ROUTE, 0x00)
        };
        let sys_code = match config.get_bytes(config::DEFAULT_SYS_CODE) {
            Some(bytes) if bytes.len() == 2 => u16::from_be_bytes([bytes[0], bytes[1]]),
            _ => 0,
        };

        let policy = RoutingPolicy {
            offhost_route: byte(config::DEFAULT_OFFHOST_ROUTE, 0x00),
            felica_route: byte(config::DEFAULT_NFCF_ROUTE, 0x00),
            default_ee,
            default_se,
            aid_matching_mode: byte(config::AID_MATCHING_MODE, AID_MATCHING_EXACT_ONLY),
            sys_code_route: byte(config::DEFAULT_SYS_CODE_ROUTE, 0xC0),
            sys_code_power: byte(config::DEFAULT_SYS_CODE_PWR_STATE, 0x19),
            sys_code,
            host_listen_tech_mask: byte(
                config::HOST_LISTEN_TECH_MASK,
                technology::A | technology::B,
            ),
            forward_functionality: flag(config::FORWARD_FUNCTIONALITY_ENABLE),
            felica_power: byte(config::DEFAULT_FELICA_CLT_PWR_STATE, 0x3F),
            iso7816_route: config
                .has_key(config::DEFAULT_AID_ROUTE)
                .then(|| byte(config::DEFAULT_AID_ROUTE, 0)),
            iso7816_power: byte(config::DEFAULT_AID_PWR_STATE, 0xFF),
            uicc_listen_tech_mask: byte(config::UICC_LISTEN_TECH_MASK, 0x07),
            gsma_power: config
                .has_key(config::DEFAULT_GSMA_PWR_STATE)
                .then(|| byte(config::DEFAULT_GSMA_PWR_STATE, 0)),
            check_default_proto_se: flag(config::CHECK_DEFAULT_PROTO_SE_ID),
            ce_route_strict_disable: flag(config::NXP_CE_ROUTE_STRICT_DISABLE),
            dynamic_dual_uicc: flag(config::NXP_DUAL_UICC_ENABLE),
            uicc2_selected: GenericSeId(byte(config::NXP_UICC2_SELECTED, GenericSeId::UICC2.0)),
            tech_abf_route: byte(config::DEFAULT_TECH_ABF_ROUTE, default_se),
            tech_abf_power: byte(config::DEFAULT_TECH_ABF_PWR_STATE, 0x3F),
            isodep_route: byte(config::DEFAULT_ISODEP_ROUTE, default_se),
            isodep_power: byte(config::DEFAULT_ISODEP_PWR_STATE, 0x3F),
            nfcee_timeout: Duration::from_secs(
                config.get_unsigned(config::NXP_DEFAULT_NFCEE_TIMEOUT, 20) as u64,
            ),
            recovery_timeout: Duration::from_millis(
                config.get_unsigned(config::NXP_EE_RECOVERY_TIMEOUT, 1000) as u64,
            ),
        };
        debug!("routing policy: {:?}", policy);
        policy
    }

    /// Handle of the secondary UICC selected in the configuration.
    pub fn secondary_uicc(&self) -> EeHandle {
        if self.uicc2_selected == GenericSeId::UICC2 {
            EeHandle::UICC2
        } else {
            EeHandle::UICC3
        }
    }

    /// Handle of the UICC inserted in `slot`.
    pub fn uicc_route(&self, slot: u8) -> EeHandle {
        match slot {
            0 | 1 => EeHandle::UICC1,
            2 => self.secondary_uicc(),
            _ => EeHandle::INVALID,
        }
    }

    /// Resolve a UICC route selector. Only [`ROUTE_UICC`] and
    /// [`ROUTE_UICC2`] resolve; everything else is [`EeHandle::INVALID`].
    pub fn uicc_route_loc_id(&self, route: u8, current_slot: u8) -> EeHandle {
        match route {
            ROUTE_UICC | ROUTE_UICC2 if !self.dynamic_dual_uicc => self.uicc_route(current_slot),
            ROUTE_UICC => EeHandle::UICC1,
            ROUTE_UICC2 => self.secondary_uicc(),
            _ => EeHandle::INVALID,
        }
    }

    /// Resolve any route selector to a location.
    pub fn route_location(&self, route: u8, current_slot: u8) -> EeHandle {
        match route {
            ROUTE_HOST => EeHandle::HOST,
            ROUTE_ESE => EeHandle::ESE,
            _ => self.uicc_route_loc_id(route, current_slot),
        }
    }

    /// Handle of the UICC currently selected for technology routing.
    pub fn selected_uicc(&self, current_slot: u8) -> EeHandle {
        if self.dynamic_dual_uicc {
            EeHandle::UICC1
        } else {
            match self.uicc_route(current_slot) {
                handle if handle.is_valid() => handle,
                _ => EeHandle::UICC1,
            }
        }
    }

    /// Whether `handle` is one of the UICCs this policy may route to.
    pub fn is_uicc(&self, handle: EeHandle) -> bool {
        handle == EeHandle::UICC1 || handle == self.secondary_uicc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NfcConfig;

    fn policy(dynamic_dual_uicc: bool) -> RoutingPolicy {
        RoutingPolicy { dynamic_dual_uicc, ..Default::default() }
    }

    #[test]
    fn defaults_match_documented_values() {
        let policy = RoutingPolicy::default();
        assert_eq!(policy.default_se, ROUTE_UICC);
        assert_eq!(policy.default_ee, 0);
        assert_eq!(policy.sys_code_route, 0xC0);
        assert_eq!(policy.sys_code_power, 0x19);
        assert_eq!(policy.sys_code, 0);
        assert_eq!(policy.host_listen_tech_mask, 0x03);
        assert_eq!(policy.iso7816_route, None);
        assert_eq!(policy.iso7816_power, 0xFF);
        assert_eq!(policy.gsma_power, None);
        assert_eq!(policy.tech_abf_route, ROUTE_UICC);
        assert_eq!(policy.nfcee_timeout, Duration::from_secs(20));
        assert_eq!(policy.recovery_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn reads_configured_values() {
        let config = NfcConfig::builder()
            .unsigned(config::NXP_DEFAULT_SE, 0x01)
            .unsigned(config::DEFAULT_ROUTE, 0x80)
            .bytes(config::DEFAULT_SYS_CODE, &[0xFE, 0xFE])
            .unsigned(config::DEFAULT_GSMA_PWR_STATE, 0)
            .unsigned(config::DEFAULT_AID_ROUTE, ROUTE_UICC.into())
            .build();
        let policy = RoutingPolicy::from_config(&config);
        assert_eq!(policy.default_ee, 0x01);
        assert_eq!(policy.sys_code, 0xFEFE);
        assert_eq!(policy.gsma_power, Some(0));
        assert_eq!(policy.iso7816_route, Some(ROUTE_UICC));
        assert_eq!(policy.isodep_route, ROUTE_ESE);
    }

    #[test]
    fn out_of_range_values_use_defaults() {
        let config = NfcConfig::builder()
            .unsigned(config::DEFAULT_SYS_CODE_PWR_STATE, 0x1FF)
            .unsigned(config::UICC_LISTEN_TECH_MASK, 0x100)
            .unsigned(config::DEFAULT_NFCF_ROUTE, 0xFF)
            .build();
        let policy = RoutingPolicy::from_config(&config);
        assert_eq!(policy.sys_code_power, 0x19);
        assert_eq!(policy.uicc_listen_tech_mask, 0x07);
        assert_eq!(policy.felica_route, 0xFF);
    }

    #[test]
    fn uicc_route_by_slot() {
        let policy = policy(false);
        assert_eq!(policy.uicc_route(0), EeHandle::UICC1);
        assert_eq!(policy.uicc_route(1), EeHandle::UICC1);
        assert_eq!(policy.uicc_route(2), EeHandle::UICC2);
        assert_eq!(policy.uicc_route(3), EeHandle::INVALID);
    }

    #[test]
    fn static_dual_uicc_follows_selected_slot() {
        let policy = policy(false);
        for slot in 0..=2 {
            assert_eq!(policy.uicc_route_loc_id(ROUTE_UICC, slot), policy.uicc_route(slot));
            assert_eq!(policy.uicc_route_loc_id(ROUTE_UICC2, slot), policy.uicc_route(slot));
        }
    }

    #[test]
    fn dynamic_dual_uicc_ignores_selected_slot() {
        let policy = policy(true);
        for slot in 0..=2 {
            assert_eq!(policy.uicc_route_loc_id(ROUTE_UICC, slot), EeHandle::UICC1);
            assert_eq!(policy.uicc_route_loc_id(ROUTE_UICC2, slot), EeHandle::UICC2);
        }
        let policy = RoutingPolicy { uicc2_selected: GenericSeId::UICC3, ..policy };
        assert_eq!(policy.uicc_route_loc_id(ROUTE_UICC2, 0), EeHandle::UICC3);
    }

    #[test]
    fn other_selectors_do_not_resolve() {
        for dynamic in [false, true] {
            let policy = policy(dynamic);
            for route in [0x00, 0x01, 0x04, 0xC0, 0xFF] {
                assert_eq!(policy.uicc_route_loc_id(route, 0), EeHandle::INVALID);
            }
        }
        assert_eq!(policy(false).route_location(ROUTE_HOST, 0), EeHandle::HOST);
        assert_eq!(policy(false).route_location(ROUTE_ESE, 0), EeHandle::ESE);
    }
}
