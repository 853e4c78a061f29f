//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Peer Connection Factory

use crate::common::Result;
use crate::webrtc::peer_connection::PeerConnection;
use crate::webrtc::peer_connection_observer::PeerConnectionObserverTrait;

/// Creates peer connections wired to an observer.  The engine owns the
/// resulting connection exclusively; the connection holds only the
/// observer as its way back into the call.
pub trait PeerConnectionFactory: Send {
    fn create_peer_connection(
        &self,
        observer: Box<dyn PeerConnectionObserverTrait>,
        ice_servers: &[String],
    ) -> Result<Box<dyn PeerConnection>>;
}
