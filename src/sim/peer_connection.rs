//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation peer connection: records every operation the call
//! performs and lets tests drive the observer callbacks by hand.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{Result, StreamId};
use crate::core::call_mutex::CallMutex;
use crate::core::signaling::{IceCandidate, SdpType, SessionDescription, StreamPurpose};
use crate::sim::error::SimError;
use crate::webrtc::media::Track;
use crate::webrtc::peer_connection::{IceConnectionState, IceGatheringState, PeerConnection};
use crate::webrtc::peer_connection_factory::PeerConnectionFactory;
use crate::webrtc::peer_connection_observer::PeerConnectionObserverTrait;

#[derive(Default)]
struct Inner {
    ice_servers: Vec<String>,

    local_tracks: Vec<Arc<dyn Track>>,
    remote_tracks: Vec<Arc<dyn Track>>,
    /// Installed as the remote track set whenever a remote offer is
    /// applied, standing in for the tracks the offer's SDP describes.
    remote_tracks_on_offer: Vec<Arc<dyn Track>>,

    added_candidates: Vec<IceCandidate>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_remote_offer: bool,
    ice_gathering_state: Option<IceGatheringState>,
    data_channel_label: Option<String>,
    closed: bool,

    needs_negotiation: bool,
    offers_created: u32,
    answers_created: u32,
    set_local_description_calls: u32,
    set_remote_description_calls: u32,
    last_purposes: HashMap<StreamId, StreamPurpose>,

    fail_create_offer: bool,
    fail_create_answer: bool,
    fail_set_local_description: bool,
    fail_set_remote_description: bool,
    fail_add_ice_candidate: bool,
    incompatible_replace: bool,
}

impl Inner {
    /// Negotiation-needed only fires in a stable signaling state: both
    /// descriptions applied, or neither.
    fn is_stable(&self) -> bool {
        self.local_description.is_some() == self.remote_description.is_some()
    }
}

#[derive(Clone)]
pub struct SimPeerConnection {
    inner: Arc<CallMutex<Inner>>,
    observer: Arc<CallMutex<Option<Box<dyn PeerConnectionObserverTrait>>>>,
}

impl SimPeerConnection {
    pub fn new(ice_servers: &[String]) -> Self {
        Self {
            inner: Arc::new(CallMutex::new(
                Inner {
                    ice_servers: ice_servers.to_vec(),
                    ..Inner::default()
                },
                "sim_peer_connection",
            )),
            observer: Arc::new(CallMutex::new(None, "sim_peer_connection_observer")),
        }
    }

    pub fn set_observer(&self, observer: Box<dyn PeerConnectionObserverTrait>) {
        if let Ok(mut cell) = self.observer.lock() {
            *cell = Some(observer);
        }
    }

    fn with_observer(&self, f: impl FnOnce(&mut dyn PeerConnectionObserverTrait)) {
        if let Ok(mut observer) = self.observer.lock() {
            if let Some(observer) = observer.as_mut() {
                f(observer.as_mut());
            }
        }
    }

    fn fire_negotiation_needed_if_stable(&self) {
        let fire = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.is_stable() && !inner.needs_negotiation && !inner.closed {
                inner.needs_negotiation = true;
                true
            } else {
                false
            }
        };
        if fire {
            self.with_observer(|observer| {
                let _ = observer.handle_negotiation_needed();
            });
        }
    }

    // --- test drivers -------------------------------------------------

    pub fn inject_local_ice_candidate(&self, candidate: IceCandidate) {
        self.with_observer(|observer| {
            let _ = observer.handle_ice_candidate_gathered(candidate);
        });
    }

    pub fn inject_ice_connection_state(&self, new_state: IceConnectionState) {
        self.with_observer(|observer| {
            let _ = observer.handle_ice_connection_state_changed(new_state);
        });
    }

    pub fn inject_ice_gathering_state(&self, new_state: IceGatheringState) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.ice_gathering_state = Some(new_state);
        }
        self.with_observer(|observer| {
            let _ = observer.handle_ice_gathering_state_changed(new_state);
        });
    }

    /// Fires negotiation-needed unconditionally, as if the stack
    /// decided it wants a fresh round.
    pub fn inject_negotiation_needed(&self) {
        self.with_observer(|observer| {
            let _ = observer.handle_negotiation_needed();
        });
    }

    /// Seeds the remote tracks the next applied remote offer exposes.
    pub fn set_remote_tracks_on_offer(&self, tracks: Vec<Arc<dyn Track>>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remote_tracks_on_offer = tracks;
        }
    }

    /// Replaces the live remote track set, as a renegotiation would.
    pub fn set_remote_tracks(&self, tracks: Vec<Arc<dyn Track>>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.remote_tracks = tracks;
        }
        self.with_observer(|observer| {
            let _ = observer.handle_remote_tracks_changed();
        });
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.inner
            .lock()
            .map(|inner| inner.added_candidates.clone())
            .unwrap_or_default()
    }

    pub fn local_tracks(&self) -> Vec<Arc<dyn Track>> {
        self.inner
            .lock()
            .map(|inner| inner.local_tracks.clone())
            .unwrap_or_default()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.remote_description.clone())
    }

    pub fn ice_servers(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.ice_servers.clone())
            .unwrap_or_default()
    }

    pub fn offers_created(&self) -> u32 {
        self.inner.lock().map(|inner| inner.offers_created).unwrap_or(0)
    }

    pub fn answers_created(&self) -> u32 {
        self.inner.lock().map(|inner| inner.answers_created).unwrap_or(0)
    }

    pub fn set_local_description_calls(&self) -> u32 {
        self.inner
            .lock()
            .map(|inner| inner.set_local_description_calls)
            .unwrap_or(0)
    }

    pub fn set_remote_description_calls(&self) -> u32 {
        self.inner
            .lock()
            .map(|inner| inner.set_remote_description_calls)
            .unwrap_or(0)
    }

    /// The purpose the observer reported for a stream on the last
    /// `notify_stream_purpose_changed`.
    pub fn purpose_of(&self, stream_id: &str) -> Option<StreamPurpose> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.last_purposes.get(stream_id).copied())
    }

    pub fn set_fail_create_offer(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_create_offer = fail;
        }
    }

    pub fn set_fail_create_answer(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_create_answer = fail;
        }
    }

    pub fn set_fail_set_local_description(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_set_local_description = fail;
        }
    }

    pub fn set_fail_set_remote_description(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_set_remote_description = fail;
        }
    }

    pub fn set_fail_add_ice_candidate(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_add_ice_candidate = fail;
        }
    }

    /// Makes the next replace_track report that it needs renegotiation.
    pub fn set_incompatible_replace(&self, incompatible: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.incompatible_replace = incompatible;
        }
    }
}

impl PeerConnection for SimPeerConnection {
    fn create_offer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock()?;
        if inner.fail_create_offer {
            return Err(SimError::InjectedFailure("create_offer").into());
        }
        inner.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\nsim offer {}",
            inner.offers_created
        )))
    }

    fn create_answer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock()?;
        if inner.fail_create_answer {
            return Err(SimError::InjectedFailure("create_answer").into());
        }
        inner.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "v=0\r\nsim answer {}",
            inner.answers_created
        )))
    }

    fn set_local_description(&self, description: Option<SessionDescription>) -> Result<()> {
        let gathering_changed = {
            let mut inner = self.inner.lock()?;
            if inner.fail_set_local_description {
                return Err(SimError::InjectedFailure("set_local_description").into());
            }
            if inner.closed {
                return Err(SimError::PeerConnectionClosed.into());
            }
            let description = match description {
                Some(description) => description,
                // Implicit: create whatever the signaling state needs.
                None if inner.pending_remote_offer => {
                    inner.answers_created += 1;
                    SessionDescription::answer(format!("v=0\r\nsim answer {}", inner.answers_created))
                }
                None => {
                    inner.offers_created += 1;
                    SessionDescription::offer(format!("v=0\r\nsim offer {}", inner.offers_created))
                }
            };
            if description.type_ == SdpType::Answer {
                inner.pending_remote_offer = false;
            }
            inner.local_description = Some(description);
            inner.set_local_description_calls += 1;
            inner.needs_negotiation = false;
            let changed = inner.ice_gathering_state != Some(IceGatheringState::Gathering);
            inner.ice_gathering_state = Some(IceGatheringState::Gathering);
            changed
        };
        if gathering_changed {
            self.with_observer(|observer| {
                let _ = observer.handle_ice_gathering_state_changed(IceGatheringState::Gathering);
            });
        }
        Ok(())
    }

    fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let tracks_changed = {
            let mut inner = self.inner.lock()?;
            if inner.fail_set_remote_description {
                return Err(SimError::InjectedFailure("set_remote_description").into());
            }
            if inner.closed {
                return Err(SimError::PeerConnectionClosed.into());
            }
            inner.set_remote_description_calls += 1;
            let is_offer = description.type_ == SdpType::Offer;
            inner.remote_description = Some(description);
            if is_offer {
                inner.pending_remote_offer = true;
                inner.remote_tracks = inner.remote_tracks_on_offer.clone();
            }
            is_offer
        };
        if tracks_changed {
            self.with_observer(|observer| {
                let _ = observer.handle_remote_tracks_changed();
            });
        }
        Ok(())
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.fail_add_ice_candidate {
            return Err(SimError::InjectedFailure("add_ice_candidate").into());
        }
        if inner.closed {
            return Err(SimError::PeerConnectionClosed.into());
        }
        inner.added_candidates.push(candidate);
        Ok(())
    }

    fn add_track(&self, track: Arc<dyn Track>) -> Result<()> {
        {
            let mut inner = self.inner.lock()?;
            if inner.closed {
                return Err(SimError::PeerConnectionClosed.into());
            }
            inner.local_tracks.push(track);
        }
        self.fire_negotiation_needed_if_stable();
        Ok(())
    }

    fn remove_track(&self, track: &Arc<dyn Track>) -> bool {
        let removed = {
            let Ok(mut inner) = self.inner.lock() else {
                return false;
            };
            let before = inner.local_tracks.len();
            inner.local_tracks.retain(|t| !Arc::ptr_eq(t, track));
            inner.local_tracks.len() != before
        };
        if removed {
            self.fire_negotiation_needed_if_stable();
        }
        removed
    }

    fn replace_track(&self, old: &Arc<dyn Track>, new: Arc<dyn Track>) -> Result<bool> {
        let compatible = {
            let mut inner = self.inner.lock()?;
            let Some(index) = inner
                .local_tracks
                .iter()
                .position(|t| Arc::ptr_eq(t, old))
            else {
                return Err(SimError::TrackNotAttached.into());
            };
            inner.local_tracks[index] = new;
            !inner.incompatible_replace
        };
        if !compatible {
            self.fire_negotiation_needed_if_stable();
        }
        Ok(compatible)
    }

    fn create_data_channel(&self, label: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock()?;
            if inner.closed {
                return Err(SimError::PeerConnectionClosed.into());
            }
            inner.data_channel_label = Some(label.to_string());
        }
        self.with_observer(|observer| {
            let _ = observer.handle_data_channel_changed();
        });
        Ok(())
    }

    fn has_data_channel(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.data_channel_label.is_some())
            .unwrap_or(false)
    }

    fn remote_tracks(&self) -> Vec<Arc<dyn Track>> {
        self.inner
            .lock()
            .map(|inner| inner.remote_tracks.clone())
            .unwrap_or_default()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.ice_gathering_state)
            .unwrap_or(IceGatheringState::New)
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.local_description.clone())
    }

    fn notify_stream_purpose_changed(&self) {
        let stream_ids: Vec<StreamId> = {
            let Ok(inner) = self.inner.lock() else {
                return;
            };
            inner
                .remote_tracks
                .iter()
                .map(|track| track.stream_id())
                .collect()
        };
        let mut purposes = HashMap::new();
        self.with_observer(|observer| {
            for stream_id in &stream_ids {
                purposes.insert(
                    stream_id.clone(),
                    observer.get_purpose_for_stream_id(stream_id),
                );
            }
        });
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_purposes = purposes;
        }
    }

    fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(true)
    }
}

/// Creates sim connections and remembers them so tests can reach the
/// connection a call is using.
#[derive(Clone)]
pub struct SimPeerConnectionFactory {
    created: Arc<CallMutex<Vec<SimPeerConnection>>>,
}

impl SimPeerConnectionFactory {
    pub fn new() -> Self {
        Self {
            created: Arc::new(CallMutex::new(Vec::new(), "sim_peer_connection_factory")),
        }
    }

    pub fn last_created(&self) -> Option<SimPeerConnection> {
        self.created
            .lock()
            .ok()
            .and_then(|created| created.last().cloned())
    }
}

impl Default for SimPeerConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConnectionFactory for SimPeerConnectionFactory {
    fn create_peer_connection(
        &self,
        observer: Box<dyn PeerConnectionObserverTrait>,
        ice_servers: &[String],
    ) -> Result<Box<dyn PeerConnection>> {
        let peer_connection = SimPeerConnection::new(ice_servers);
        peer_connection.set_observer(observer);
        self.created.lock()?.push(peer_connection.clone());
        Ok(Box::new(peer_connection))
    }
}
