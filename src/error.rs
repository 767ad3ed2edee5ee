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

//! Routing error taxonomy.

use crate::nci::{EeHandle, Status};

/// Failure of a routing operation.
///
/// These never cross the [`RoutingManager`](crate::manager::RoutingManager)
/// API: public operations log them and report a `bool`, a [`Status`] or an
/// `Option` instead.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("route {0:#04x} does not resolve to an execution environment")]
    InvalidRoute(u8),
    #[error("execution environment {0} is not present")]
    UnknownSecureElement(EeHandle),
    #[error("{command} rejected by the controller: {status:?}")]
    Rejected { command: &'static str, status: Status },
    #[error("{command} timed out after {timeout_ms}ms")]
    TimedOut { command: &'static str, timeout_ms: u128 },
    #[error("{command} failed: {status:?}")]
    Failed { command: &'static str, status: Status },
    #[error("{0} requires NCI 2.0")]
    Unsupported(&'static str),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl RoutingError {
    /// Status reported at the API boundary for this error.
    pub fn status(&self) -> Status {
        match self {
            RoutingError::Rejected { status, .. } | RoutingError::Failed { status, .. } => *status,
            RoutingError::Unsupported(_) => Status::NotSupported,
            RoutingError::InvalidParameter(_) => Status::InvalidParam,
            RoutingError::InvalidRoute(_)
            | RoutingError::UnknownSecureElement(_)
            | RoutingError::TimedOut { .. } => Status::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;
