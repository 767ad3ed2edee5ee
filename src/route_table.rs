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

//! In-memory model of the listen mode routing table.
//!
//! Everything in this module is pure: tables are derived from the policy
//! and the EE list, merged, and handed to the routing manager which commits
//! them to the NFCC.

use crate::nci::{power, protocol, technology, EeHandle, EeInfo, EeStatus, PowerMasks};
use crate::policy::RoutingPolicy;
use log::debug;
use std::collections::BTreeMap;

/// Routing row of one location.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    pub location: EeHandle,
    pub masks: PowerMasks,
    pub enabled: bool,
}

/// Technology or protocol routing rows, at most one per location.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteTable {
    entries: BTreeMap<EeHandle, RouteEntry>,
}

impl RouteTable {
    /// OR `masks` into the row of `location`, creating it if needed.
    /// Rows of the host never carry power states in which the host is
    /// unable to receive frames.
    pub fn merge(&mut self, location: EeHandle, masks: PowerMasks) -> RouteEntry {
        let entry = self.merged(location, masks);
        self.insert(entry);
        entry
    }

    /// Row `location` would hold after merging `masks`, leaving the table
    /// untouched.
    pub fn merged(&self, location: EeHandle, masks: PowerMasks) -> RouteEntry {
        let masks = if location.is_host() { masks.host_safe() } else { masks };
        let mut entry = self.entries.get(&location).copied().unwrap_or(RouteEntry {
            location,
            masks: PowerMasks::default(),
            enabled: true,
        });
        entry.masks.merge(&masks);
        entry.enabled = true;
        entry
    }

    /// Replace the row of `entry.location`.
    pub fn insert(&mut self, entry: RouteEntry) {
        self.entries.insert(entry.location, entry);
    }

    /// OR every row of `other` into this table.
    pub fn merge_table(&mut self, other: &RouteTable) {
        for entry in other.iter().filter(|entry| entry.enabled) {
            self.merge(entry.location, entry.masks);
        }
    }

    pub fn get(&self, location: EeHandle) -> Option<&RouteEntry> {
        self.entries.get(&location)
    }

    pub fn remove(&mut self, location: EeHandle) -> Option<RouteEntry> {
        self.entries.remove(&location)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear()
    }
}

/// Technology and protocol routing tables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingTables {
    pub technology: RouteTable,
    pub protocol: RouteTable,
}

impl RoutingTables {
    pub fn merge(&mut self, other: &RoutingTables) {
        self.technology.merge_table(&other.technology);
        self.protocol.merge_table(&other.protocol);
    }
}

/// Listen technologies with a default route.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Technology {
    A,
    B,
    F,
}

impl Technology {
    pub fn mask(self) -> u8 {
        match self {
            Technology::A => technology::A,
            Technology::B => technology::B,
            Technology::F => technology::F,
        }
    }
}

/// Default route selected for one technology.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TechSelection {
    pub technology: Technology,
    pub location: EeHandle,
    pub power_state: u8,
    pub enabled: bool,
}

impl TechSelection {
    fn new(technology: Technology, location: EeHandle, power_state: u8) -> Self {
        TechSelection { technology, location, power_state, enabled: true }
    }

    /// Redirect this technology to the host, keeping only the power states
    /// the host can serve.
    fn route_to_host(&mut self) {
        self.location = EeHandle::HOST;
        self.power_state &= power::HOST_SAFE;
        self.enabled = true;
    }
}

/// Default route of each listen technology.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TechTable {
    pub a: TechSelection,
    pub b: TechSelection,
    pub f: TechSelection,
}

impl TechTable {
    pub fn new(ab: (EeHandle, u8), f: (EeHandle, u8)) -> TechTable {
        TechTable {
            a: TechSelection::new(Technology::A, ab.0, ab.1),
            b: TechSelection::new(Technology::B, ab.0, ab.1),
            f: TechSelection::new(Technology::F, f.0, f.1),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TechSelection> {
        [&self.a, &self.b, &self.f].into_iter()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut TechSelection> {
        [&mut self.a, &mut self.b, &mut self.f].into_iter()
    }

    /// Keep host card emulation reachable on the technologies the host
    /// listens on when the selected UICC only supports one of A and B.
    ///
    /// `uicc_technologies` is the listen technology mask of the selected
    /// UICC and `is_uicc` tells which locations are UICCs. When the UICC
    /// supports both A and B no host fallback is possible.
    pub fn apply_forward_functionality(
        &mut self,
        host_listen_tech_mask: u8,
        uicc_technologies: u8,
        is_uicc: impl Fn(EeHandle) -> bool,
    ) {
        let supports_a = uicc_technologies & technology::A != 0;
        let supports_b = uicc_technologies & technology::B != 0;
        let a_only = supports_a && !supports_b;
        let b_only = supports_b && !supports_a;
        let a_on_uicc = is_uicc(self.a.location);
        let b_on_uicc = is_uicc(self.b.location);

        match host_listen_tech_mask {
            // Host listens on A only.
            0x01 => {
                if b_on_uicc && a_only {
                    self.b.enabled = false;
                }
                if a_on_uicc && b_only {
                    self.a.route_to_host();
                }
            }
            // Host listens on B only.
            0x02 => {
                if b_on_uicc && a_only {
                    self.b.route_to_host();
                }
                if a_on_uicc && b_only {
                    self.a.enabled = false;
                }
            }
            0x03 | 0x07 => {
                if a_on_uicc && b_only {
                    self.a.route_to_host();
                }
                if b_on_uicc && a_only {
                    self.b.route_to_host();
                }
            }
            _ => (),
        }
    }

    /// Merge the enabled selections into a technology routing table.
    pub fn to_route_table(&self) -> RouteTable {
        let mut table = RouteTable::default();
        for selection in self.iter().filter(|selection| selection.enabled) {
            table.merge(
                selection.location,
                PowerMasks::from_power_state(selection.technology.mask(), selection.power_state),
            );
        }
        table
    }
}

/// Inputs of the ISO7816 default route (the empty AID entry).
#[derive(Clone, Debug)]
pub struct EmptyAidPolicy<'a> {
    /// Resolved location of the configured default route.
    pub location: EeHandle,
    pub power_state: u8,
    pub strict_disable: bool,
    /// Fall back to the host when `location` is not an active EE.
    pub check_present: bool,
    pub active: &'a [EeHandle],
    pub gsma_power: Option<u8>,
}

/// Location and power state of the empty AID entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EmptyAidRoute {
    pub location: EeHandle,
    pub power_state: u8,
}

impl EmptyAidPolicy<'_> {
    /// Derive the empty AID entry. `None` when the resulting power state is
    /// empty, in which case no entry may be added.
    pub fn derive(&self) -> Option<EmptyAidRoute> {
        let mut location = self.location;
        let mut power_state = if self.strict_disable {
            self.power_state
        } else {
            self.power_state & power::STRICT
        };

        if self.check_present && !self.active.contains(&location) {
            debug!("empty aid: default route {} not present, using host", location);
            location = EeHandle::HOST;
        }
        if location.is_host() {
            power_state &= power::HOST_SAFE;
        }
        if let Some(gsma_power) = self.gsma_power {
            power_state =
                if location.is_host() { gsma_power & power::HOST_SAFE } else { gsma_power };
        }

        (power_state != 0).then_some(EmptyAidRoute { location, power_state })
    }
}

/// Derive the default technology and protocol routes from the policy and
/// the EEs known to the NFCC.
pub fn derive_default_routes(
    policy: &RoutingPolicy,
    current_slot: u8,
    ees: &[EeInfo],
    scbr_supported: bool,
) -> RoutingTables {
    let active: Vec<&EeInfo> = ees.iter().filter(|ee| ee.status == EeStatus::Active).collect();
    let present = |handle: EeHandle| {
        handle.is_host() || active.iter().any(|ee| ee.handle == handle)
    };
    let technologies_of = |handle: EeHandle| {
        if handle.is_host() {
            technology::A | technology::B | technology::F
        } else {
            active.iter().find(|ee| ee.handle == handle).map_or(0, |ee| ee.technologies)
        }
    };
    let or_host = |handle: EeHandle| if present(handle) { handle } else { EeHandle::HOST };

    let mut techs = TechTable::new(
        (policy.route_location(policy.tech_abf_route, current_slot), policy.tech_abf_power),
        (EeHandle::from_route(policy.felica_route), policy.felica_power),
    );
    for selection in techs.iter_mut() {
        if !present(selection.location) {
            selection.route_to_host();
        }
    }

    if policy.forward_functionality && policy.host_listen_tech_mask != 0 {
        let uicc = policy.selected_uicc(current_slot);
        techs.apply_forward_functionality(
            policy.host_listen_tech_mask,
            technologies_of(uicc),
            |handle| policy.is_uicc(handle),
        );
    }
    for selection in techs.iter_mut() {
        if technologies_of(selection.location) & selection.technology.mask() == 0 {
            selection.enabled = false;
        }
    }

    let mut tables = RoutingTables { technology: techs.to_route_table(), ..Default::default() };
    tables.protocol.merge(
        or_host(policy.route_location(policy.isodep_route, current_slot)),
        PowerMasks::from_power_state(protocol::ISO_DEP, policy.isodep_power),
    );
    if !scbr_supported {
        tables.protocol.merge(
            or_host(EeHandle::from_route(policy.felica_route)),
            PowerMasks::from_power_state(protocol::T3T, policy.felica_power),
        );
    }
    tables
}
