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

//! Host card emulation data path.

use crate::nci::Status;
use crate::sync::lock;
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Receiver of host card emulation notifications.
pub trait HostEmulationListener: Send + Sync {
    fn notify_activated(&self, technology: u8);

    fn notify_deactivated(&self, technology: u8);

    /// Complete data unit received in listen mode.
    fn notify_data(&self, technology: u8, data: Bytes);
}

/// Reassembles card emulation data units and forwards them to the
/// registered [`HostEmulationListener`].
#[derive(Default)]
pub struct CardEmulationDataPath {
    listener: Mutex<Option<Arc<dyn HostEmulationListener>>>,
    buffer: Mutex<BytesMut>,
}

impl CardEmulationDataPath {
    pub fn new() -> CardEmulationDataPath {
        Default::default()
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn HostEmulationListener>>) {
        *lock(&self.listener) = listener;
    }

    fn listener(&self) -> Option<Arc<dyn HostEmulationListener>> {
        lock(&self.listener).clone()
    }

    fn buffer(&self) -> MutexGuard<'_, BytesMut> {
        lock(&self.buffer)
    }

    /// Drop any partially received data unit.
    pub fn clear(&self) {
        self.buffer().clear();
    }

    pub fn activated(&self, technology: u8) {
        debug!("+ ce_activated({:#04x})", technology);
        self.clear();
        if let Some(listener) = self.listener() {
            listener.notify_activated(technology);
        }
    }

    pub fn deactivated(&self, technology: u8) {
        debug!("+ ce_deactivated({:#04x})", technology);
        self.clear();
        if let Some(listener) = self.listener() {
            listener.notify_deactivated(technology);
        }
    }

    /// Handle one fragment of a data unit.
    pub fn data(&self, technology: u8, status: Status, fragment: &[u8]) {
        debug!("+ ce_data({:#04x}, {:?}, {} bytes)", technology, status, fragment.len());
        let data = {
            let mut buffer = self.buffer();
            match status {
                Status::Continue => {
                    buffer.extend_from_slice(fragment);
                    return;
                }
                Status::Ok => {
                    buffer.extend_from_slice(fragment);
                    // split() leaves the buffer empty for the next unit.
                    buffer.split().freeze()
                }
                status => {
                    warn!("ce_data: dropping {} buffered bytes, status {:?}", buffer.len(), status);
                    buffer.clear();
                    return;
                }
            }
        };

        // Delivered outside of the buffer lock; listeners may respond
        // synchronously.
        if let Some(listener) = self.listener() {
            listener.notify_data(technology, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nci::technology;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl HostEmulationListener for Recorder {
        fn notify_activated(&self, technology: u8) {
            self.events.lock().unwrap().push(format!("activated {}", technology));
        }

        fn notify_deactivated(&self, technology: u8) {
            self.events.lock().unwrap().push(format!("deactivated {}", technology));
        }

        fn notify_data(&self, _technology: u8, data: Bytes) {
            self.events.lock().unwrap().push(format!("data {:02x?}", data.as_ref()));
        }
    }

    fn data_path() -> (CardEmulationDataPath, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let data_path = CardEmulationDataPath::new();
        data_path.set_listener(Some(recorder.clone()));
        (data_path, recorder)
    }

    #[test]
    fn fragments_are_delivered_once() {
        let (data_path, recorder) = data_path();
        data_path.data(technology::A, Status::Continue, &[0x00, 0xA4]);
        data_path.data(technology::A, Status::Continue, &[0x04, 0x00]);
        data_path.data(technology::A, Status::Ok, &[0x07]);
        data_path.data(technology::A, Status::Ok, &[0x90, 0x00]);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["data [00, a4, 04, 00, 07]".to_owned(), "data [90, 00]".to_owned()]
        );
    }

    #[test]
    fn failed_unit_is_discarded() {
        let (data_path, recorder) = data_path();
        data_path.data(technology::B, Status::Continue, &[0x01, 0x02]);
        data_path.data(technology::B, Status::Failed, &[0x03]);
        data_path.data(technology::B, Status::Ok, &[0x04]);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["data [04]".to_owned()]);
    }

    #[test]
    fn deactivation_clears_partial_unit() {
        let (data_path, recorder) = data_path();
        data_path.activated(technology::A);
        data_path.data(technology::A, Status::Continue, &[0x01]);
        data_path.deactivated(technology::A);
        data_path.data(technology::A, Status::Ok, &[0x02]);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "activated 1".to_owned(),
                "deactivated 1".to_owned(),
                "data [02]".to_owned()
            ]
        );
    }

    #[test]
    fn data_without_listener_is_dropped() {
        let data_path = CardEmulationDataPath::new();
        data_path.data(technology::A, Status::Ok, &[0x01]);
        assert!(data_path.buffer().is_empty());
    }
}
