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

//! Listen mode routing demo against an emulated NFCC.

use anyhow::Result;
use argh::FromArgs;
use bytes::Bytes;
use log::info;
use nfc_routing::emulator::{self, EmulatorConfig, Stimulus};
use nfc_routing::nci::{technology, EeStatus};
use nfc_routing::{
    EeHandle, EeInfo, EeRegistry, HostEmulationListener, NciVersion, NfcConfig, RoutingManager,
    RoutingPolicy,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task;

/// AID of the PPSE.
const PPSE_AID: [u8; 14] = *b"2PAY.SYS.DDF01";

#[derive(FromArgs, Debug)]
/// Nfc listen mode routing demo.
struct Opt {
    #[argh(option)]
    /// path of the libnfc configuration file.
    config: Option<PathBuf>,
    #[argh(option, default = "2")]
    /// NCI version of the emulated NFCC (1 or 2).
    nci_version: u8,
    #[argh(switch)]
    /// enable dynamic dual UICC routing.
    dynamic_dual_uicc: bool,
    #[argh(option, default = "0")]
    /// currently selected UICC slot.
    uicc_slot: u8,
}

struct LoggingListener;

impl HostEmulationListener for LoggingListener {
    fn notify_activated(&self, technology: u8) {
        info!("host card emulation activated ({:#04x})", technology);
    }

    fn notify_deactivated(&self, technology: u8) {
        info!("host card emulation deactivated ({:#04x})", technology);
    }

    fn notify_data(&self, technology: u8, data: Bytes) {
        info!("host card emulation data ({:#04x}): {:02x?}", technology, data.as_ref());
    }
}

async fn run() -> Result<()> {
    let opt: Opt = argh::from_env();
    let config = match &opt.config {
        Some(path) => NfcConfig::load(path)?,
        None => NfcConfig::default(),
    };
    let mut policy = RoutingPolicy::from_config(&config);
    policy.dynamic_dual_uicc |= opt.dynamic_dual_uicc;
    let nci_version = match opt.nci_version {
        1 => NciVersion::Version11,
        2 => NciVersion::Version20,
        version => anyhow::bail!("unsupported NCI version {}", version),
    };

    let (nfcc, nfcc_task) = emulator::new(EmulatorConfig {
        nci_version,
        ees: vec![
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
        ],
        ..Default::default()
    });
    let manager =
        RoutingManager::new(Arc::new(nfcc.clone()), Arc::new(EeRegistry::new()), policy);
    manager.set_current_uicc_slot(opt.uicc_slot);
    manager.set_host_emulation_listener(Arc::new(LoggingListener));
    let nfcc_task = tokio::spawn(nfcc_task.run(manager.event_sink()));

    let engine = manager.clone();
    let initialized = task::spawn_blocking(move || {
        if !engine.initialize() {
            return false;
        }
        engine.derive_default_routes();
        engine.apply_default_routes();
        engine.add_aid_routing(&PPSE_AID, 0, 0, 0x11);
        let iso7816_route = engine.policy().iso7816_route.unwrap_or(engine.default_route());
        engine.set_empty_aid_entry(iso7816_route);
        engine.commit_routing()
    })
    .await?;
    anyhow::ensure!(initialized, "failed to initialize the routing manager");

    let routing = nfcc.listen_mode_routing().await;
    for (handle, masks) in routing.technology.iter() {
        info!("technology route {}: {:?}", handle, masks);
    }
    for (handle, masks) in routing.protocol.iter() {
        info!("protocol route {}: {:?}", handle, masks);
    }
    for route in routing.aids.iter() {
        info!(
            "aid route {:02x?} -> {} ({:#04x})",
            route.aid.as_ref(),
            route.handle,
            route.power_state
        );
    }

    nfcc.stimulate(Stimulus::CeActivated { technology: technology::A })?;
    nfcc.stimulate(Stimulus::CeData {
        technology: technology::A,
        data: Bytes::from_static(&[0x00, 0xA4, 0x04, 0x00, 0x0E]),
    })?;
    nfcc.stimulate(Stimulus::CeDeactivated { technology: technology::A })?;

    let engine = manager.clone();
    task::spawn_blocking(move || engine.on_nfcc_shutdown()).await?;
    nfcc_task.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "debug"),
    );
    run().await
}
