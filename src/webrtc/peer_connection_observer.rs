//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Peer Connection Observer

use std::fmt;

use crate::common::Result;
use crate::core::signaling::{IceCandidate, StreamPurpose};
use crate::webrtc::peer_connection::{IceConnectionState, IceGatheringState};

/// The callbacks from a peer connection implementation ultimately go
/// to an impl of this.
pub trait PeerConnectionObserverTrait: Send {
    fn log_id(&self) -> &dyn fmt::Display;

    fn handle_ice_candidate_gathered(&mut self, candidate: IceCandidate) -> Result<()>;

    fn handle_ice_connection_state_changed(&mut self, new_state: IceConnectionState)
        -> Result<()>;

    fn handle_ice_gathering_state_changed(&mut self, new_state: IceGatheringState) -> Result<()>;

    fn handle_remote_tracks_changed(&mut self) -> Result<()>;

    fn handle_data_channel_changed(&mut self) -> Result<()>;

    fn handle_negotiation_needed(&mut self) -> Result<()>;

    /// Synchronous query the connection uses to classify a remote
    /// stream.  Must not block on the call's executor; streams nobody
    /// described are user media.
    fn get_purpose_for_stream_id(&self, stream_id: &str) -> StreamPurpose;
}
