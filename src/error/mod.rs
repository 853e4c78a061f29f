//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common error codes.

use thiserror::Error;

/// Platform independent error conditions.  Protocol level failures are
/// not errors here: they map to hangup reasons and end the call.
#[derive(Error, Debug)]
pub enum PeerCallError {
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(&'static str),
    #[error("Actor thread exited unexpectedly")]
    ActorExited,
}
