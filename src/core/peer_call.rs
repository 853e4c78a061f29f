//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A peer-to-peer call as a state machine.
//!
//! The `PeerCall` drives a single 1:1 media session through its
//! lifecycle: offer/answer exchange, candidate trickling, serialized
//! renegotiation and teardown.  Inbound signalling messages and peer
//! connection callbacks all funnel into one actor, so no two
//! transitions ever interleave; every resumption after a timer re-reads
//! the call state before acting.
//!
//! # Asynchronous inputs
//!
//! ## From the host application
//!
//! - call / answer / hangup
//! - set_media / set_local_mute
//! - handle_incoming_signaling_message
//!
//! ## From the peer connection
//!
//! - negotiation needed
//! - local ICE candidate gathered
//! - ICE connection / gathering state changes
//! - remote tracks changed, data channel changed
//!
//! ## From the timer service
//!
//! - candidate gathering grace periods
//! - trickle batching delays
//! - invite and ringing expiries

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::common::actor::{Actor, Stopper};
use crate::common::timer::{TimeoutCreator, TimeoutHandle};
use crate::common::{
    CallConfig, CallDirection, CallId, CallParty, CallState, PartyId, Result, DATA_CHANNEL_NAME,
};
use crate::core::call_mutex::CallMutex;
use crate::core::candidates::{CandidateSendQueue, RemoteCandidateBuffer};
use crate::core::signaling::{
    AnswerContent, CallErrorCode, CandidatesContent, HangupContent, IceCandidate, InviteContent,
    Message, NegotiateContent, SdpStreamMetadataChangedContent, SdpType, StreamMetadataMap,
    StreamPurpose, VERSION,
};
use crate::core::stream_metadata::StreamMetadataRegistry;
use crate::webrtc::media::{diff_local_media, LocalMedia, TrackType, TrackUpdate};
use crate::webrtc::peer_connection::{IceConnectionState, IceGatheringState, PeerConnection};
use crate::webrtc::peer_connection_factory::PeerConnectionFactory;
use crate::webrtc::peer_connection_observer::PeerConnectionObserverTrait;

/// Pending local media, resolved on the call's actor while the call is
/// in WaitLocalMedia.  Rejection maps to NoUserMedia.
pub type MediaSource = Box<dyn FnOnce() -> Result<LocalMedia> + Send>;

/// The callbacks from the PeerCall to the host application.
pub trait Observer: Send {
    /// Called on every observable change: state transitions, remote
    /// track changes, stream metadata changes.
    fn handle_update(&self, call_id: CallId, state: CallState);

    /// The last callback for a call; after this the call is completely
    /// torn down and can be dropped.
    fn handle_ended(&self, call_id: CallId, party: CallParty, reason: CallErrorCode);

    /// Hands a signalling message to the transport.  An Err is the
    /// send-failure signal and maps to the appropriate hangup reason.
    fn send_signaling_message(&mut self, call_id: CallId, message: Message) -> Result<()>;
}

/// Records every state a call has entered so callers can block on a
/// specific transition, including ones that already happened.
struct StateWatcher {
    inner: Mutex<WatcherInner>,
    condvar: Condvar,
}

struct WatcherInner {
    current: CallState,
    seen: HashSet<CallState>,
}

impl StateWatcher {
    fn new() -> Self {
        let mut seen = HashSet::new();
        seen.insert(CallState::Fledgling);
        Self {
            inner: Mutex::new(WatcherInner {
                current: CallState::Fledgling,
                seen,
            }),
            condvar: Condvar::new(),
        }
    }

    fn transition(&self, state: CallState) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.current = state;
            inner.seen.insert(state);
            self.condvar.notify_all();
        }
    }

    fn current(&self) -> CallState {
        self.inner
            .lock()
            .map(|inner| inner.current)
            .unwrap_or(CallState::Ended)
    }

    fn wait_for_state(&self, state: CallState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        while !inner.seen.contains(&state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.condvar.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => inner = guard,
                Err(_) => return false,
            }
        }
        true
    }
}

/// A 1:1 call.  Cheap to clone; all mutable state lives inside the
/// actor.
#[derive(Clone)]
pub struct PeerCall {
    call_id: CallId,
    // Outside the actor because the peer connection queries stream
    // purposes synchronously from its own callbacks.
    stream_metadata: Arc<CallMutex<StreamMetadataRegistry>>,
    state_watcher: Arc<StateWatcher>,
    actor: Actor<State>,
}

/// The state inside the actor.
struct State {
    call_id: CallId,
    config: CallConfig,
    observer: Box<dyn Observer>,
    peer_connection: Box<dyn PeerConnection>,
    timeout_creator: Arc<dyn TimeoutCreator>,
    state_watcher: Arc<StateWatcher>,
    stream_metadata: Arc<CallMutex<StreamMetadataRegistry>>,

    direction: Option<CallDirection>,
    call_state: CallState,
    local_media: Option<LocalMedia>,
    /// Which remote device we committed to.  Set on the first accepted
    /// Invite or Answer, before anything else can run.
    opponent_party_id: Option<PartyId>,
    hangup_party: Option<CallParty>,
    hangup_reason: Option<CallErrorCode>,

    candidate_send_queue: CandidateSendQueue,
    candidate_send_scheduled: bool,
    /// Present until an opponent is committed, then drained and gone.
    remote_candidate_buffer: Option<RemoteCandidateBuffer>,

    /// At most one renegotiation runs at a time; later requests wait
    /// here and run in arrival order.
    negotiation_in_flight: bool,
    negotiations_pending: usize,
    /// Perfect-negotiation: set while we are dropping a colliding
    /// remote offer, so its candidate failures are expected.
    ignore_offer: bool,

    /// Live cancellable delays; terminate aborts them all.
    timeouts: Vec<TimeoutHandle>,
    actor: Actor<State>,
}

impl fmt::Display for PeerCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "call_id: {}, state: {}",
            self.call_id,
            self.state_watcher.current()
        )
    }
}

impl fmt::Debug for PeerCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl PeerCall {
    /// Creates the call and its peer connection.  The call starts in
    /// Fledgling with no direction committed.
    pub fn start(
        call_id: CallId,
        observer: Box<dyn Observer>,
        peer_connection_factory: Box<dyn PeerConnectionFactory>,
        timeout_creator: Arc<dyn TimeoutCreator>,
        config: CallConfig,
    ) -> Result<Self> {
        info!("start(): call_id: {}", call_id);

        let stopper = Stopper::new();
        let stream_metadata = Arc::new(CallMutex::new(
            StreamMetadataRegistry::new(),
            "stream_metadata",
        ));
        let state_watcher = Arc::new(StateWatcher::new());

        let (observer_impl, call_cell) =
            PeerConnectionObserverImpl::uninitialized(call_id, stream_metadata.clone());

        let stream_metadata_for_state = stream_metadata.clone();
        let state_watcher_for_state = state_watcher.clone();
        let actor = Actor::start(stopper, move |actor| {
            let peer_connection = peer_connection_factory
                .create_peer_connection(Box::new(observer_impl), &config.ice_servers)?;
            Ok(State {
                call_id,
                config,
                observer,
                peer_connection,
                timeout_creator,
                state_watcher: state_watcher_for_state,
                stream_metadata: stream_metadata_for_state,

                direction: None,
                call_state: CallState::Fledgling,
                local_media: None,
                opponent_party_id: None,
                hangup_party: None,
                hangup_reason: None,

                candidate_send_queue: CandidateSendQueue::new(),
                candidate_send_scheduled: false,
                remote_candidate_buffer: Some(RemoteCandidateBuffer::new()),

                negotiation_in_flight: false,
                negotiations_pending: 0,
                ignore_offer: false,

                timeouts: Vec::new(),
                actor,
            })
        })?;

        let call = Self {
            call_id,
            stream_metadata,
            state_watcher,
            actor,
        };

        // Now that the actor is up, let the connection observer reach
        // the call.
        *call_cell.lock()? = Some(call.clone());
        Ok(call)
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// The current call state, readable from any thread.
    pub fn state(&self) -> CallState {
        self.state_watcher.current()
    }

    /// Blocks until the call has entered the given state, or the
    /// timeout elapses.  States already passed through count.
    pub fn wait_for_state(&self, state: CallState, timeout: Duration) -> bool {
        self.state_watcher.wait_for_state(state, timeout)
    }

    /// Starts an outbound call.  Valid only in Fledgling.
    pub fn call(&self, media: MediaSource) {
        info!("call(): call_id: {}", self.call_id);
        self.actor
            .send(move |state| Self::start_outbound(state, media));
    }

    /// Picks up a ringing inbound call.  Valid only in Ringing.
    pub fn answer(&self, media: MediaSource) {
        info!("answer(): call_id: {}", self.call_id);
        self.actor.send(move |state| Self::start_answer(state, media));
    }

    /// Atomically swaps the local media, reconciling each track role
    /// against the peer connection.
    pub fn set_media(&self, media: MediaSource) {
        info!("set_media(): call_id: {}", self.call_id);
        self.actor
            .send(move |state| Self::apply_set_media(state, media));
    }

    /// Toggles mute on one local track role and advertises the change
    /// without renegotiating.
    pub fn set_local_mute(&self, track_type: TrackType, muted: bool) {
        self.actor
            .send(move |state| Self::apply_local_mute(state, track_type, muted));
    }

    /// Ends the call: sends a Hangup carrying the reason, then tears
    /// down locally.
    pub fn hangup(&self, reason: CallErrorCode) {
        info!("hangup(): call_id: {} reason: {}", self.call_id, reason);
        self.actor.send(move |state| Self::local_hangup(state, reason));
    }

    /// Dispatches one inbound signalling message.  Messages for the
    /// same call must be handed over in arrival order.
    pub fn handle_incoming_signaling_message(&self, message: Message, party_id: Option<PartyId>) {
        let party_id = party_id.unwrap_or_default();
        self.actor.send(move |state| match message {
            Message::Invite(content) => Self::handle_invite(state, content, party_id),
            Message::Answer(content) => Self::handle_answer(state, content, party_id),
            Message::Candidates(content) => {
                Self::handle_remote_candidates(state, content, party_id)
            }
            Message::Hangup(content) => Self::handle_remote_hangup(state, content),
            Message::Negotiate(content) => Self::handle_negotiate(state, content, party_id),
            Message::SdpStreamMetadataChanged(content) => {
                Self::handle_metadata_changed(state, content)
            }
        });
    }

    /// Tears the call down without signalling the remote side and stops
    /// the actor.  The last thing to call on a PeerCall.
    pub fn dispose(&self) {
        info!("dispose(): call_id: {}", self.call_id);
        self.actor.send(|state| {
            Self::terminate(state, CallParty::Local, CallErrorCode::UserHangup, false);
        });
        let _ = self
            .state_watcher
            .wait_for_state(CallState::Ended, Duration::from_secs(5));
        self.actor.stopper().stop_all_and_join();
    }

    /// Blocks until every task queued so far has run.  Test plumbing.
    #[cfg(feature = "sim")]
    pub fn synchronize(&self) -> Result<()> {
        let (sender, receiver) = std::sync::mpsc::channel();
        self.actor.send(move |_state| {
            let _ = sender.send(());
        });
        receiver
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| crate::error::PeerCallError::ActorExited)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Everything below runs on the actor.

    fn set_state_and_notify(state: &mut State, new_state: CallState) {
        if state.call_state == new_state || state.call_state == CallState::Ended {
            return;
        }
        info!(
            "call_id: {} state: {} -> {}",
            state.call_id, state.call_state, new_state
        );
        state.call_state = new_state;
        state.state_watcher.transition(new_state);
        state.observer.handle_update(state.call_id, new_state);
    }

    /// The only way into Ended.  Idempotent; later entries are the
    /// absorbing-state no-ops the protocol expects.
    fn terminate(state: &mut State, party: CallParty, reason: CallErrorCode, emit: bool) {
        if state.call_state == CallState::Ended {
            debug!(
                "terminate(): already ended: party: {:?} reason: {:?}",
                state.hangup_party, state.hangup_reason
            );
            return;
        }
        info!(
            "terminate(): call_id: {} party: {} reason: {}",
            state.call_id, party, reason
        );
        state.hangup_party = Some(party);
        state.hangup_reason = Some(reason);
        state.call_state = CallState::Ended;
        state.state_watcher.transition(CallState::Ended);

        if let Some(local_media) = state.local_media.take() {
            local_media.stop();
        }
        if !state.peer_connection.is_closed() {
            state.peer_connection.close();
        }
        for timeout in state.timeouts.drain(..) {
            timeout.abort();
        }
        state.candidate_send_queue.discard();
        state.candidate_send_scheduled = false;
        state.negotiation_in_flight = false;
        state.negotiations_pending = 0;
        state.remote_candidate_buffer = None;

        if emit {
            state.observer.handle_update(state.call_id, CallState::Ended);
        }
        state.observer.handle_ended(state.call_id, party, reason);
    }

    /// Local end with signalling: best-effort Hangup message, then
    /// teardown.  Used by the user-facing hangup and by local fatal
    /// errors other than send failures.
    fn local_hangup(state: &mut State, reason: CallErrorCode) {
        if state.call_state == CallState::Ended {
            return;
        }
        let message = Message::Hangup(HangupContent {
            reason: Some(reason),
            version: VERSION,
        });
        if let Err(e) = state.observer.send_signaling_message(state.call_id, message) {
            warn!("local_hangup(): hangup message failed to send: {}", e);
        }
        Self::terminate(state, CallParty::Local, reason, true);
    }

    fn arm_timeout(
        state: &mut State,
        delay: Duration,
        run: impl FnOnce(&mut State) + Send + 'static,
    ) {
        let actor = state.actor.clone();
        let handle = state.timeout_creator.create_timeout(
            delay,
            Box::new(move || {
                actor.send(run);
            }),
        );
        state.timeouts.push(handle);
    }

    // --- outbound path ------------------------------------------------

    fn start_outbound(state: &mut State, media: MediaSource) {
        if state.call_state != CallState::Fledgling {
            warn!(
                "call(): ignoring, invalid state: {}",
                state.call_state
            );
            return;
        }
        state.direction = Some(CallDirection::Outbound);
        Self::set_state_and_notify(state, CallState::WaitLocalMedia);

        let local_media = match media() {
            Ok(local_media) => local_media,
            Err(e) => {
                warn!("call(): local media acquisition failed: {}", e);
                Self::local_hangup(state, CallErrorCode::NoUserMedia);
                return;
            }
        };

        Self::set_state_and_notify(state, CallState::CreateOffer);
        if let Err(e) = state.peer_connection.create_data_channel(DATA_CHANNEL_NAME) {
            warn!("call(): could not create data channel: {}", e);
        }
        let tracks = local_media.tracks();
        state.local_media = Some(local_media);
        for track in tracks {
            if let Err(e) = state.peer_connection.add_track(track) {
                warn!("call(): add_track failed: {}", e);
                Self::local_hangup(state, CallErrorCode::LocalOfferFailed);
                return;
            }
        }
        // Adding the tracks makes the connection fire negotiation
        // needed, which drives invite creation through the negotiation
        // queue.
    }

    // --- negotiation serializer --------------------------------------

    fn negotiation_needed(state: &mut State) {
        if state.call_state == CallState::Ended {
            debug!("negotiation_needed(): ignoring, call ended");
            return;
        }
        if state.negotiation_in_flight {
            state.negotiations_pending += 1;
            debug!(
                "negotiation_needed(): queued behind in-flight task, pending: {}",
                state.negotiations_pending
            );
            return;
        }
        state.negotiation_in_flight = true;
        Self::run_negotiation(state);
    }

    fn run_negotiation(state: &mut State) {
        debug!(
            "run_negotiation(): call_id: {} state: {}",
            state.call_id, state.call_state
        );
        if state.call_state == CallState::Ended {
            return;
        }

        if state.call_state == CallState::CreateOffer {
            let offer = match state.peer_connection.create_offer() {
                Ok(offer) => offer,
                Err(e) => {
                    warn!("run_negotiation(): create_offer failed: {}", e);
                    Self::local_hangup(state, CallErrorCode::LocalOfferFailed);
                    return;
                }
            };
            if let Err(e) = state.peer_connection.set_local_description(Some(offer)) {
                warn!("run_negotiation(): set_local_description failed: {}", e);
                Self::local_hangup(state, CallErrorCode::SetLocalDescription);
                return;
            }
        } else if let Err(e) = state.peer_connection.set_local_description(None) {
            warn!("run_negotiation(): set_local_description failed: {}", e);
            Self::local_hangup(state, CallErrorCode::SetLocalDescription);
            return;
        }

        if state.peer_connection.ice_gathering_state() == IceGatheringState::Gathering {
            // Let gathering put the first candidates into the SDP.
            let grace = state.config.candidate_grace_period;
            Self::arm_timeout(state, grace, Self::continue_negotiation);
            return;
        }
        Self::continue_negotiation(state);
    }

    fn continue_negotiation(state: &mut State) {
        if state.call_state == CallState::Ended {
            return;
        }

        // Anything queued before this description is already in the SDP.
        let discarded = state.candidate_send_queue.discard();
        if discarded > 0 {
            debug!(
                "continue_negotiation(): dropped {} candidates already in the SDP",
                discarded
            );
        }

        let Some(description) = state.peer_connection.local_description() else {
            warn!("continue_negotiation(): no local description after setting one");
            Self::local_hangup(state, CallErrorCode::SetLocalDescription);
            return;
        };
        let metadata = Self::local_sdp_metadata(state);

        if state.call_state == CallState::CreateOffer {
            let lifetime = state.config.call_timeout.as_millis() as u64;
            let message = Message::Invite(InviteContent {
                offer: description,
                sdp_stream_metadata: metadata,
                version: VERSION,
                lifetime: Some(lifetime),
            });
            info!("sending invite: call_id: {}", state.call_id);
            if let Err(e) = state.observer.send_signaling_message(state.call_id, message) {
                warn!("continue_negotiation(): invite send failed: {}", e);
                Self::terminate(state, CallParty::Local, CallErrorCode::SendInvite, true);
                return;
            }
            Self::set_state_and_notify(state, CallState::InviteSent);
            Self::send_candidate_queue(state);

            let timeout = state.config.call_timeout;
            Self::arm_timeout(state, timeout, |state| {
                if state.call_state == CallState::InviteSent {
                    info!("invite timed out: call_id: {}", state.call_id);
                    Self::local_hangup(state, CallErrorCode::InviteTimeout);
                }
            });
        } else {
            let message = Message::Negotiate(NegotiateContent {
                description,
                sdp_stream_metadata: metadata,
                version: VERSION,
            });
            info!("sending negotiate: call_id: {}", state.call_id);
            if let Err(e) = state.observer.send_signaling_message(state.call_id, message) {
                warn!("continue_negotiation(): negotiate send failed: {}", e);
                Self::terminate(
                    state,
                    CallParty::Local,
                    CallErrorCode::SignallingFailed,
                    true,
                );
                return;
            }
            Self::send_candidate_queue(state);
        }

        Self::finish_negotiation(state);
    }

    fn finish_negotiation(state: &mut State) {
        state.negotiation_in_flight = false;
        if state.call_state == CallState::Ended {
            state.negotiations_pending = 0;
            return;
        }
        if state.negotiations_pending > 0 {
            state.negotiations_pending -= 1;
            state.negotiation_in_flight = true;
            Self::run_negotiation(state);
        }
    }

    // --- candidate trickling -----------------------------------------

    fn local_candidate_gathered(state: &mut State, candidate: IceCandidate) {
        if state.call_state == CallState::Ended {
            return;
        }
        debug!(
            "local_candidate_gathered(): call_id: {} candidate: {}",
            state.call_id, candidate
        );
        state.candidate_send_queue.push(candidate);
        Self::schedule_candidate_send(state);
    }

    fn schedule_candidate_send(state: &mut State) {
        if state.candidate_send_scheduled {
            return;
        }
        // While ringing nothing goes out; answering flushes the queue.
        if state.call_state == CallState::Ringing {
            return;
        }
        let direction = state.direction.unwrap_or(CallDirection::Outbound);
        let delay = state.config.trickle_delay(direction);
        state.candidate_send_scheduled = true;
        Self::arm_timeout(state, delay, |state| {
            state.candidate_send_scheduled = false;
            Self::send_candidate_queue(state);
        });
    }

    fn send_candidate_queue(state: &mut State) {
        if state.call_state == CallState::Ended || state.call_state == CallState::Ringing {
            return;
        }
        if state.candidate_send_queue.is_empty() {
            return;
        }
        let candidates = state.candidate_send_queue.drain();
        info!(
            "send_candidate_queue(): call_id: {} sending {} candidates",
            state.call_id,
            candidates.len()
        );
        let message = Message::Candidates(CandidatesContent {
            candidates,
            version: VERSION,
        });
        if let Err(e) = state.observer.send_signaling_message(state.call_id, message) {
            warn!("send_candidate_queue(): send failed: {}", e);
            Self::terminate(
                state,
                CallParty::Local,
                CallErrorCode::SignallingFailed,
                true,
            );
            return;
        }
        // Pick up anything that arrived while the send was in flight.
        Self::send_candidate_queue(state);
    }

    // --- inbound messages --------------------------------------------

    fn handle_invite(state: &mut State, content: InviteContent, party_id: PartyId) {
        if state.call_state != CallState::Fledgling || state.opponent_party_id.is_some() {
            info!(
                "handle_invite(): ignoring, state: {} call_id: {}",
                state.call_state, state.call_id
            );
            return;
        }
        info!(
            "handle_invite(): call_id: {} party_id: {:?} offer: {}",
            state.call_id, party_id, content.offer
        );
        state.direction = Some(CallDirection::Inbound);
        // Commit to this party before anything else can run, so a
        // competing response cannot be accepted.
        state.opponent_party_id = Some(party_id.clone());

        Self::merge_stream_metadata(state, &content.sdp_stream_metadata);

        if let Err(e) = state.peer_connection.set_remote_description(content.offer) {
            warn!("handle_invite(): set_remote_description failed: {}", e);
            Self::local_hangup(state, CallErrorCode::SetRemoteDescription);
            return;
        }
        state.ignore_offer = false;

        Self::drain_remote_candidates(state, &party_id);

        if state.peer_connection.remote_tracks().is_empty() {
            warn!("handle_invite(): offer produced no remote tracks");
            Self::local_hangup(state, CallErrorCode::SetRemoteDescription);
            return;
        }

        Self::set_state_and_notify(state, CallState::Ringing);

        // The caller gives up after the advertised lifetime; mirror it
        // as if they rescinded.
        let lifetime = content
            .lifetime
            .map(Duration::from_millis)
            .unwrap_or(state.config.call_timeout);
        Self::arm_timeout(state, lifetime, |state| {
            if state.call_state == CallState::Ringing {
                info!("ringing expired: call_id: {}", state.call_id);
                Self::terminate(
                    state,
                    CallParty::Remote,
                    CallErrorCode::InviteTimeout,
                    true,
                );
            }
        });
    }

    fn handle_answer(state: &mut State, content: AnswerContent, party_id: PartyId) {
        if state.call_state == CallState::Ended {
            return;
        }
        match &state.opponent_party_id {
            Some(opponent) if *opponent != party_id => {
                info!(
                    "handle_answer(): ignoring answer from party {:?}, committed to {:?}",
                    party_id, opponent
                );
                return;
            }
            Some(_) => {}
            None => {
                state.opponent_party_id = Some(party_id.clone());
            }
        }
        if state.call_state != CallState::InviteSent {
            warn!(
                "handle_answer(): unexpected state: {}",
                state.call_state
            );
        }
        info!(
            "handle_answer(): call_id: {} party_id: {:?} answer: {}",
            state.call_id, party_id, content.answer
        );

        Self::drain_remote_candidates(state, &party_id);
        Self::set_state_and_notify(state, CallState::Connecting);
        Self::merge_stream_metadata(state, &content.sdp_stream_metadata);

        if let Err(e) = state.peer_connection.set_remote_description(content.answer) {
            warn!("handle_answer(): set_remote_description failed: {}", e);
            Self::local_hangup(state, CallErrorCode::SetRemoteDescription);
            return;
        }
        state.ignore_offer = false;
    }

    fn handle_remote_candidates(state: &mut State, content: CandidatesContent, party_id: PartyId) {
        if state.call_state == CallState::Ended {
            return;
        }
        let committed = state
            .opponent_party_id
            .as_ref()
            .map(|opponent| *opponent == party_id);
        match committed {
            None => {
                if let Some(buffer) = state.remote_candidate_buffer.as_mut() {
                    info!(
                        "handle_remote_candidates(): buffering {} candidates from party {:?}",
                        content.candidates.len(),
                        party_id
                    );
                    for candidate in content.candidates {
                        buffer.buffer(&party_id, candidate);
                    }
                }
            }
            Some(true) => {
                for candidate in content.candidates {
                    Self::add_remote_candidate(state, candidate);
                }
            }
            Some(false) => {
                info!(
                    "handle_remote_candidates(): ignoring candidates from party {:?}",
                    party_id
                );
            }
        }
    }

    fn handle_remote_hangup(state: &mut State, content: HangupContent) {
        if state.call_state == CallState::Ended {
            return;
        }
        let reason = content.reason.unwrap_or(CallErrorCode::UserHangup);
        info!(
            "handle_remote_hangup(): call_id: {} reason: {}",
            state.call_id, reason
        );
        Self::terminate(state, CallParty::Remote, reason, false);
    }

    fn handle_negotiate(state: &mut State, content: NegotiateContent, party_id: PartyId) {
        if state.call_state == CallState::Ended {
            return;
        }
        match &state.opponent_party_id {
            Some(opponent) if *opponent == party_id => {}
            _ => {
                info!(
                    "handle_negotiate(): ignoring, party {:?} is not the committed opponent",
                    party_id
                );
                return;
            }
        }

        Self::merge_stream_metadata(state, &content.sdp_stream_metadata);

        let is_offer = content.description.type_ == SdpType::Offer;
        if is_offer {
            let collision = state.negotiation_in_flight || state.negotiations_pending > 0;
            if collision && !state.config.polite {
                info!("handle_negotiate(): glare, impolitely ignoring remote offer");
                state.ignore_offer = true;
                return;
            }
        }

        if let Err(e) = state
            .peer_connection
            .set_remote_description(content.description)
        {
            warn!("handle_negotiate(): set_remote_description failed: {}", e);
            Self::local_hangup(state, CallErrorCode::SetRemoteDescription);
            return;
        }
        state.ignore_offer = false;

        if is_offer {
            if let Err(e) = state.peer_connection.set_local_description(None) {
                warn!("handle_negotiate(): set_local_description failed: {}", e);
                Self::local_hangup(state, CallErrorCode::SetLocalDescription);
                return;
            }
            let Some(description) = state.peer_connection.local_description() else {
                warn!("handle_negotiate(): no local description after answering");
                Self::local_hangup(state, CallErrorCode::SetLocalDescription);
                return;
            };
            let metadata = Self::local_sdp_metadata(state);
            let message = Message::Negotiate(NegotiateContent {
                description,
                sdp_stream_metadata: metadata,
                version: VERSION,
            });
            if let Err(e) = state.observer.send_signaling_message(state.call_id, message) {
                warn!("handle_negotiate(): answer send failed: {}", e);
                Self::terminate(
                    state,
                    CallParty::Local,
                    CallErrorCode::SignallingFailed,
                    true,
                );
            }
        }
    }

    fn handle_metadata_changed(state: &mut State, content: SdpStreamMetadataChangedContent) {
        if state.call_state == CallState::Ended {
            return;
        }
        Self::merge_stream_metadata(state, &content.sdp_stream_metadata);
    }

    // --- answering ----------------------------------------------------

    fn start_answer(state: &mut State, media: MediaSource) {
        if state.call_state != CallState::Ringing {
            warn!("answer(): ignoring, invalid state: {}", state.call_state);
            return;
        }
        Self::set_state_and_notify(state, CallState::WaitLocalMedia);

        let local_media = match media() {
            Ok(local_media) => local_media,
            Err(e) => {
                warn!("answer(): local media acquisition failed: {}", e);
                Self::local_hangup(state, CallErrorCode::NoUserMedia);
                return;
            }
        };

        Self::set_state_and_notify(state, CallState::CreateAnswer);
        let tracks = local_media.tracks();
        state.local_media = Some(local_media);
        for track in tracks {
            if let Err(e) = state.peer_connection.add_track(track) {
                warn!("answer(): add_track failed: {}", e);
                Self::local_hangup(state, CallErrorCode::CreateAnswer);
                return;
            }
        }

        let answer = match state.peer_connection.create_answer() {
            Ok(answer) => answer,
            Err(e) => {
                warn!("answer(): create_answer failed: {}", e);
                Self::local_hangup(state, CallErrorCode::CreateAnswer);
                return;
            }
        };
        if let Err(e) = state.peer_connection.set_local_description(Some(answer)) {
            warn!("answer(): set_local_description failed: {}", e);
            Self::local_hangup(state, CallErrorCode::SetLocalDescription);
            return;
        }
        Self::set_state_and_notify(state, CallState::Connecting);

        // Give ICE gathering a head start before the answer goes out.
        let grace = state.config.candidate_grace_period;
        Self::arm_timeout(state, grace, Self::send_answer);
    }

    fn send_answer(state: &mut State) {
        if state.call_state == CallState::Ended {
            return;
        }
        let Some(description) = state.peer_connection.local_description() else {
            warn!("send_answer(): no local description");
            Self::local_hangup(state, CallErrorCode::SetLocalDescription);
            return;
        };
        let metadata = Self::local_sdp_metadata(state);
        let message = Message::Answer(AnswerContent {
            answer: description,
            sdp_stream_metadata: metadata,
            version: VERSION,
        });
        info!("sending answer: call_id: {}", state.call_id);
        if let Err(e) = state.observer.send_signaling_message(state.call_id, message) {
            warn!("send_answer(): send failed: {}", e);
            Self::terminate(state, CallParty::Local, CallErrorCode::SendAnswer, true);
            return;
        }
        Self::send_candidate_queue(state);
    }

    // --- media --------------------------------------------------------

    fn apply_set_media(state: &mut State, media: MediaSource) {
        if state.call_state == CallState::Ended {
            warn!("set_media(): ignoring, call ended");
            return;
        }
        let new_media = match media() {
            Ok(new_media) => new_media,
            Err(e) => {
                warn!("set_media(): local media acquisition failed: {}", e);
                Self::local_hangup(state, CallErrorCode::NoUserMedia);
                return;
            }
        };
        let old_media = state.local_media.take().unwrap_or_default();
        let updates = diff_local_media(&old_media, &new_media);
        info!(
            "set_media(): call_id: {} applying {} track updates",
            state.call_id,
            updates.len()
        );
        for (track_type, update) in updates {
            match update {
                TrackUpdate::Add(track) => {
                    if let Err(e) = state.peer_connection.add_track(track) {
                        warn!("set_media(): add {:?} failed: {}", track_type, e);
                    }
                }
                TrackUpdate::Remove(track) => {
                    if !state.peer_connection.remove_track(&track) {
                        warn!("set_media(): {:?} track was not attached", track_type);
                    }
                    track.stop();
                }
                TrackUpdate::Replace { old, new } => {
                    match state.peer_connection.replace_track(&old, new) {
                        Ok(compatible) => {
                            if !compatible {
                                debug!(
                                    "set_media(): {:?} replacement needs renegotiation",
                                    track_type
                                );
                            }
                        }
                        Err(e) => warn!("set_media(): replace {:?} failed: {}", track_type, e),
                    }
                    old.stop();
                }
            }
        }
        state.local_media = Some(new_media);
    }

    fn apply_local_mute(state: &mut State, track_type: TrackType, muted: bool) {
        if state.call_state == CallState::Ended {
            return;
        }
        let metadata = {
            let Some(local_media) = state.local_media.as_ref() else {
                warn!("set_local_mute(): no local media");
                return;
            };
            let Some(track) = local_media.track(track_type) else {
                warn!("set_local_mute(): no {:?} track", track_type);
                return;
            };
            if track.muted() == muted {
                return;
            }
            track.set_muted(muted);
            local_media.sdp_metadata()
        };
        info!(
            "set_local_mute(): call_id: {} {:?} muted: {}",
            state.call_id, track_type, muted
        );
        let message = Message::SdpStreamMetadataChanged(SdpStreamMetadataChangedContent {
            sdp_stream_metadata: metadata,
            version: VERSION,
        });
        if let Err(e) = state.observer.send_signaling_message(state.call_id, message) {
            warn!("set_local_mute(): metadata send failed: {}", e);
            Self::terminate(
                state,
                CallParty::Local,
                CallErrorCode::SignallingFailed,
                true,
            );
        }
    }

    // --- shared helpers ----------------------------------------------

    fn local_sdp_metadata(state: &State) -> StreamMetadataMap {
        state
            .local_media
            .as_ref()
            .map(LocalMedia::sdp_metadata)
            .unwrap_or_default()
    }

    fn drain_remote_candidates(state: &mut State, party_id: &str) {
        let Some(buffer) = state.remote_candidate_buffer.take() else {
            return;
        };
        let (candidates, discarded) = buffer.commit(party_id);
        if discarded > 0 {
            info!(
                "drain_remote_candidates(): dropping {} candidates from other parties",
                discarded
            );
        }
        if !candidates.is_empty() {
            info!(
                "drain_remote_candidates(): adding {} buffered candidates",
                candidates.len()
            );
        }
        for candidate in candidates {
            Self::add_remote_candidate(state, candidate);
        }
    }

    fn add_remote_candidate(state: &mut State, candidate: IceCandidate) {
        if !candidate.has_target() {
            debug!("add_remote_candidate(): skipping candidate with no mid or m-line index");
            return;
        }
        if let Err(e) = state.peer_connection.add_ice_candidate(candidate) {
            if state.ignore_offer {
                // Expected while we are dropping a colliding offer.
                debug!("add_remote_candidate(): rejected during glare: {}", e);
            } else {
                warn!("add_remote_candidate(): rejected: {}", e);
            }
        }
    }

    fn merge_stream_metadata(state: &mut State, incoming: &StreamMetadataMap) {
        if incoming.is_empty() {
            return;
        }
        let changed = match state.stream_metadata.lock() {
            Ok(mut registry) => registry.merge(incoming),
            Err(e) => {
                error!("merge_stream_metadata(): {}", e);
                return;
            }
        };
        if !changed {
            return;
        }
        state.peer_connection.notify_stream_purpose_changed();
        Self::apply_remote_mute_state(state);
        state.observer.handle_update(state.call_id, state.call_state);
    }

    /// Re-applies advertised mute state to every remote track: the
    /// audio flag for microphones, the video flag for everything else.
    fn apply_remote_mute_state(state: &State) {
        let Ok(registry) = state.stream_metadata.lock() else {
            return;
        };
        for track in state.peer_connection.remote_tracks() {
            let stream_id = track.stream_id();
            let purpose = registry.purpose_for_stream(&stream_id);
            let track_type = TrackType::from_kind_and_purpose(track.media_kind(), purpose);
            let muted = match registry.get(&stream_id) {
                Some(metadata) if track_type == TrackType::Microphone => metadata.audio_muted,
                Some(metadata) => metadata.video_muted,
                None => false,
            };
            track.set_muted(muted);
        }
    }

    // --- peer connection events --------------------------------------

    fn ice_connection_state_changed(state: &mut State, new_state: IceConnectionState) {
        info!(
            "ice_connection_state_changed(): call_id: {} state: {:?}",
            state.call_id, new_state
        );
        if state.call_state == CallState::Ended {
            return;
        }
        match new_state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if state.call_state == CallState::Connecting {
                    Self::set_state_and_notify(state, CallState::Connected);
                }
            }
            IceConnectionState::Failed => {
                warn!("ice failed: call_id: {}", state.call_id);
                Self::local_hangup(state, CallErrorCode::IceFailed);
            }
            _ => {}
        }
    }

    fn ice_gathering_state_changed(state: &mut State, new_state: IceGatheringState) {
        debug!(
            "ice_gathering_state_changed(): call_id: {} state: {:?}",
            state.call_id, new_state
        );
    }

    fn remote_tracks_changed(state: &mut State) {
        if state.call_state == CallState::Ended {
            return;
        }
        debug!(
            "remote_tracks_changed(): call_id: {} tracks: {}",
            state.call_id,
            state.peer_connection.remote_tracks().len()
        );
        // New tracks need classifying against the metadata we have.
        state.peer_connection.notify_stream_purpose_changed();
        Self::apply_remote_mute_state(state);
        state.observer.handle_update(state.call_id, state.call_state);
    }

    fn data_channel_changed(state: &mut State) {
        info!(
            "data_channel_changed(): call_id: {} present: {}",
            state.call_id,
            state.peer_connection.has_data_channel()
        );
    }
}

/// The peer connection's way back into the call.  Holds no strong
/// reference to the call state; only the actor's mailbox and the
/// registry needed to answer purpose queries synchronously.
pub struct PeerConnectionObserverImpl {
    call_id: CallId,
    call: Arc<CallMutex<Option<PeerCall>>>,
    stream_metadata: Arc<CallMutex<StreamMetadataRegistry>>,
}

impl PeerConnectionObserverImpl {
    /// Created before the call exists; `PeerCall::start` fills the cell
    /// once the actor is up.
    fn uninitialized(
        call_id: CallId,
        stream_metadata: Arc<CallMutex<StreamMetadataRegistry>>,
    ) -> (Self, Arc<CallMutex<Option<PeerCall>>>) {
        let cell = Arc::new(CallMutex::new(None, "peer_connection_observer_call"));
        (
            Self {
                call_id,
                call: cell.clone(),
                stream_metadata,
            },
            cell,
        )
    }

    fn with_call(&self, f: impl FnOnce(&PeerCall)) -> Result<()> {
        let call = self.call.lock()?;
        match call.as_ref() {
            Some(call) => {
                f(call);
                Ok(())
            }
            None => {
                warn!(
                    "peer connection event before call was initialized: call_id: {}",
                    self.call_id
                );
                Ok(())
            }
        }
    }
}

impl PeerConnectionObserverTrait for PeerConnectionObserverImpl {
    fn log_id(&self) -> &dyn fmt::Display {
        &self.call_id
    }

    fn handle_ice_candidate_gathered(&mut self, candidate: IceCandidate) -> Result<()> {
        self.with_call(|call| {
            call.actor
                .send(move |state| PeerCall::local_candidate_gathered(state, candidate));
        })
    }

    fn handle_ice_connection_state_changed(
        &mut self,
        new_state: IceConnectionState,
    ) -> Result<()> {
        self.with_call(|call| {
            call.actor
                .send(move |state| PeerCall::ice_connection_state_changed(state, new_state));
        })
    }

    fn handle_ice_gathering_state_changed(&mut self, new_state: IceGatheringState) -> Result<()> {
        self.with_call(|call| {
            call.actor
                .send(move |state| PeerCall::ice_gathering_state_changed(state, new_state));
        })
    }

    fn handle_remote_tracks_changed(&mut self) -> Result<()> {
        self.with_call(|call| {
            call.actor.send(PeerCall::remote_tracks_changed);
        })
    }

    fn handle_data_channel_changed(&mut self) -> Result<()> {
        self.with_call(|call| {
            call.actor.send(PeerCall::data_channel_changed);
        })
    }

    fn handle_negotiation_needed(&mut self) -> Result<()> {
        self.with_call(|call| {
            call.actor.send(PeerCall::negotiation_needed);
        })
    }

    fn get_purpose_for_stream_id(&self, stream_id: &str) -> StreamPurpose {
        self.stream_metadata
            .lock()
            .map(|registry| registry.purpose_for_stream(stream_id))
            .unwrap_or(StreamPurpose::Usermedia)
    }
}
