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

//! Dispatch of NFCC events to the routing manager.

use crate::manager::{ModeSetAck, RoutingAck, Shared};
use crate::nci::{Event, Status};
use log::{debug, info, warn};
use std::sync::Arc;

/// Receiver of the events of one NFCC.
///
/// Events must be delivered from a thread that never blocks on a routing
/// manager operation: operations wait for these very events.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<Shared>,
}

impl EventSink {
    pub(crate) fn new(shared: Arc<Shared>) -> EventSink {
        EventSink { shared }
    }

    pub fn deliver(&self, event: Event) {
        let shared = &self.shared;
        debug!("< {:?}", event);
        match event {
            Event::EeRegistered { status } => shared.ee_register.signal(status),
            Event::EeDeregistered => info!("deregistered from EE management"),
            Event::EeModeSet { status, handle, ee_status } => {
                shared.directory.mode_set(handle, status, ee_status);
                shared.mode_set.signal(ModeSetAck { status, handle, ee_status });
            }
            Event::EeDiscovered { status, ees } => {
                if !status.is_ok() {
                    warn!("EE discovery failed: {:?}", status);
                }
                shared.directory.ee_discovered(&ees);
                shared.refresh_default_routes(&ees);
                shared.ee_info.publish(ees);
            }
            Event::TechnologyRoutingSet { status }
            | Event::ProtocolRoutingSet { status }
            | Event::SystemCodeAdded { status }
            | Event::SystemCodeRemoved { status } => {
                shared.routing.signal(RoutingAck { status, handle: None })
            }
            Event::CeRegistered { status, handle } => {
                shared.routing.signal(RoutingAck { status, handle: Some(handle) })
            }
            Event::CeDeregistered { handle } => {
                shared.routing.signal(RoutingAck { status: Status::Ok, handle: Some(handle) })
            }
            Event::AidAdded { status } | Event::AidRemoved { status } => shared.aid.signal(status),
            Event::ApduPatternAdded { status } | Event::ApduPatternRemoved { status } => {
                shared.apdu_pattern.signal(status)
            }
            Event::EeUpdated { status } => shared.ee_update.signal(status),
            Event::CeActivated { technology } => shared.card_emulation.activated(technology),
            Event::CeDeactivated { technology } => shared.card_emulation.deactivated(technology),
            Event::CeData { technology, status, data } => {
                shared.card_emulation.data(technology, status, &data)
            }
            Event::RecoveryComplete { recovered } => {
                info!("EE recovery complete: {}", recovered);
                shared.recovery.publish(recovered);
            }
            Event::PowerLinkControl { status, handle } => {
                debug!("power and link control of {}: {:?}", handle, status)
            }
            Event::NewEe { handle, ee_status } => info!("new EE {}: {:?}", handle, ee_status),
            Event::EeAction { handle, trigger } => {
                debug!("EE action on {}, trigger {:#04x}", handle, trigger)
            }
        }
    }
}
