//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The peer connection capability a call drives.  The actual ICE/DTLS/
//! SRTP stack lives behind this trait; the engine only sequences it.

use std::sync::Arc;

use crate::common::Result;
use crate::core::signaling::{IceCandidate, SessionDescription};
use crate::webrtc::media::Track;

/// Rust version of the RTCIceConnectionState enum.
///
/// See [RTCIceConnectionState](https://w3c.github.io/webrtc-pc/#dom-rtciceconnectionstate)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

/// Rust version of the RTCIceGatheringState enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

pub trait PeerConnection: Send {
    fn create_offer(&self) -> Result<SessionDescription>;

    fn create_answer(&self) -> Result<SessionDescription>;

    /// Applies a local description.  `None` lets the connection create
    /// whichever description its current signaling state calls for.
    fn set_local_description(&self, description: Option<SessionDescription>) -> Result<()>;

    fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn add_track(&self, track: Arc<dyn Track>) -> Result<()>;

    /// Detaches a sending track.  Returns whether it was attached.
    fn remove_track(&self, track: &Arc<dyn Track>) -> bool;

    /// Swaps a sending track in place.  `Ok(true)` means the
    /// replacement was codec-compatible and needs no renegotiation;
    /// `Ok(false)` means the connection will fire negotiation-needed.
    fn replace_track(&self, old: &Arc<dyn Track>, new: Arc<dyn Track>) -> Result<bool>;

    fn create_data_channel(&self, label: &str) -> Result<()>;

    fn has_data_channel(&self) -> bool;

    fn remote_tracks(&self) -> Vec<Arc<dyn Track>>;

    fn ice_gathering_state(&self) -> IceGatheringState;

    fn local_description(&self) -> Option<SessionDescription>;

    /// Tells the connection that stream purposes changed, so every
    /// remote track re-evaluates its type through the observer's
    /// `get_purpose_for_stream_id`.
    fn notify_stream_purpose_changed(&self);

    fn close(&self);

    fn is_closed(&self) -> bool;
}
