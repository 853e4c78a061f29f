//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the library.

pub mod actor;
pub mod timer;

use std::fmt;
use std::time::Duration;

/// Common Result type, using `anyhow::Error` for Error.
pub type Result<T> = anyhow::Result<T>;

/// Unique call identification number.
pub type CallId = u64;

/// Opaque identifier of a specific remote device participating in a
/// call.  Legacy remotes send no party id; they are keyed by the empty
/// string so buffering and commitment logic stays uniform.
pub type PartyId = String;

/// Identifier of a media stream referenced by SDP stream metadata.
pub type StreamId = String;

/// How long to wait for the remote side to pick up before giving up on
/// an invite, and the default lifetime advertised on outbound invites.
pub const CALL_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Grace period after setting a local description, so that ICE
/// gathering can place the first candidates into the SDP itself.
pub const CANDIDATE_GRACE_PERIOD: Duration = Duration::from_millis(200);

/// Batching delay for trickled candidates when we are the callee.
pub const INBOUND_TRICKLE_DELAY: Duration = Duration::from_millis(500);

/// Batching delay for trickled candidates when we are the caller.
pub const OUTBOUND_TRICKLE_DELAY: Duration = Duration::from_millis(2_000);

/// STUN server used when the environment supplies none.
pub const FALLBACK_ICE_SERVER: &str = "stun:turn.matrix.org";

/// The label of the data channel an outbound call opens.
pub const DATA_CHANNEL_NAME: &str = "signaling";

/// Tracks the state of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Freshly constructed call, no direction committed yet.
    Fledgling,
    /// Waiting for local media acquisition to resolve.
    WaitLocalMedia,
    /// Outbound call producing its initial offer.
    CreateOffer,
    /// Inbound call producing its answer.
    CreateAnswer,
    /// The invite went out; waiting for an answer.
    InviteSent,
    /// An inbound invite was applied; waiting for the user to pick up.
    Ringing,
    /// Descriptions exchanged; ICE is connecting.
    Connecting,
    /// ICE reached connected; media is flowing.
    Connected,
    /// The call is over.  Absorbing.
    Ended,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The call direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which side ended the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallParty {
    Local,
    Remote,
}

impl fmt::Display for CallParty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-call tunables.  The defaults are the protocol constants; tests
/// normally keep them and drive a virtual clock instead.
#[derive(Clone, Debug)]
pub struct CallConfig {
    pub call_timeout: Duration,
    pub candidate_grace_period: Duration,
    pub inbound_trickle_delay: Duration,
    pub outbound_trickle_delay: Duration,
    /// Perfect-negotiation politeness: a polite peer yields to a remote
    /// offer that collides with its own in-flight negotiation.
    pub polite: bool,
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            call_timeout: CALL_TIMEOUT,
            candidate_grace_period: CANDIDATE_GRACE_PERIOD,
            inbound_trickle_delay: INBOUND_TRICKLE_DELAY,
            outbound_trickle_delay: OUTBOUND_TRICKLE_DELAY,
            polite: false,
            ice_servers: vec![FALLBACK_ICE_SERVER.to_string()],
        }
    }
}

impl CallConfig {
    /// The candidate batching delay for the given direction.
    pub fn trickle_delay(&self, direction: CallDirection) -> Duration {
        match direction {
            CallDirection::Inbound => self.inbound_trickle_delay,
            CallDirection::Outbound => self.outbound_trickle_delay,
        }
    }
}
