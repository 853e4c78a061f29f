//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation specific error codes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Sim: injected {0} failure")]
    InjectedFailure(&'static str),
    #[error("Sim: track is not attached")]
    TrackNotAttached,
    #[error("Sim: peer connection is closed")]
    PeerConnectionClosed,
}
