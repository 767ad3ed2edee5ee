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

//! Listen mode routing manager for NCI controllers.
//!
//! [`RoutingManager`] programs the technology, protocol, AID, system code
//! and APDU pattern routes of the NFCC, waits for each command's completion
//! event, and dispatches card emulation traffic to the host.

pub mod card_emulation;
pub mod config;
pub mod connection;
pub mod emulator;
pub mod error;
pub mod events;
pub mod manager;
pub mod nci;
pub mod policy;
pub mod route_table;
pub mod secure_element;
pub mod sync;

pub use card_emulation::{CardEmulationDataPath, HostEmulationListener};
pub use config::{ConfigStore, NfcConfig};
pub use connection::{ConnectionState, Consumer, PowerSwitch, WiredConnection};
pub use error::{Result, RoutingError};
pub use events::EventSink;
pub use manager::{routing_type, RoutingManager};
pub use nci::{Command, EeHandle, EeInfo, Event, GenericSeId, NciVersion, Nfcc, Status};
pub use policy::RoutingPolicy;
pub use route_table::{RouteEntry, RouteTable, RoutingTables};
pub use secure_element::{EeRegistry, SecureElementDirectory};
