//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Tests for outbound calls

extern crate peercall;

use peercall::common::{CallConfig, CallParty, CallState};
use peercall::core::signaling::{CallErrorCode, Message, MessageType, SdpType};
use peercall::webrtc::media::{Track, TrackType};
use peercall::webrtc::peer_connection::IceConnectionState;

#[macro_use]
mod common;
use common::{
    answer_message, candidates_message, hangup_message, local_cam, local_media, local_mic,
    local_screen, media_err, media_ok, random_ice_candidate, usermedia_metadata, TestContext,
    LOCAL_USER_STREAM, REMOTE_USER_STREAM,
};

/// Drives a context to InviteSent with a microphone and a camera.
fn drive_to_invite_sent(context: &TestContext) {
    let mic = local_mic();
    let cam = local_cam();
    context
        .call()
        .call(media_ok(local_media(Some(&mic), Some(&cam), None)));
    context.sync();

    // The offer is set and ICE is gathering; the invite goes out after
    // the gathering grace period.
    context.assert_state(CallState::CreateOffer);
    assert_eq!(context.platform().message_count(MessageType::Invite), 0);

    context.advance_ms(200);
    context.assert_state(CallState::InviteSent);
}

/// Drives a fresh context to InviteSent and returns it.
fn start_outbound() -> TestContext {
    let context = TestContext::new();
    drive_to_invite_sent(&context);
    context
}

fn connect_outbound(context: &TestContext) {
    context.deliver(
        answer_message(usermedia_metadata(REMOTE_USER_STREAM, false, false)),
        "B",
    );
    context.assert_state(CallState::Connecting);
    context
        .pc()
        .inject_ice_connection_state(IceConnectionState::Connected);
    context.sync();
    context.assert_state(CallState::Connected);
}

// Create a call context and drop it again.
#[test]
fn create_and_dispose() {
    let context = TestContext::new();
    context.assert_state(CallState::Fledgling);
    // The default config hands the fallback STUN server to the factory.
    assert_eq!(
        context.pc().ice_servers(),
        vec![peercall::common::FALLBACK_ICE_SERVER.to_string()]
    );
}

#[test]
fn outbound_happy_path() {
    let context = start_outbound();

    // Exactly one invite, carrying the single user-media stream the
    // two local tracks share.
    let invites = context.platform().messages_of_type(MessageType::Invite);
    assert_eq!(invites.len(), 1);
    match &invites[0] {
        Message::Invite(invite) => {
            assert_eq!(invite.offer.type_, SdpType::Offer);
            assert_eq!(invite.sdp_stream_metadata.len(), 1);
            let user = invite
                .sdp_stream_metadata
                .get(LOCAL_USER_STREAM)
                .expect(error_line!());
            assert!(!user.audio_muted);
            assert!(!user.video_muted);
            assert_eq!(invite.lifetime, Some(60_000));
        }
        message => panic!("unexpected message: {}", message),
    }

    connect_outbound(&context);
    assert_eq!(context.platform().ended(), None);
}

#[test]
fn states_are_observable_in_order() {
    let context = start_outbound();
    connect_outbound(&context);

    let updates = context.platform().state_updates();
    let expected = [
        CallState::WaitLocalMedia,
        CallState::CreateOffer,
        CallState::InviteSent,
        CallState::Connecting,
        CallState::Connected,
    ];
    // Metadata and track updates re-announce the current state, so
    // collapse runs before comparing the transition order.
    let mut transitions: Vec<CallState> = updates
        .iter()
        .copied()
        .filter(|state| expected.contains(state))
        .collect();
    transitions.dedup();
    assert_eq!(transitions, expected);
}

#[test]
fn invite_times_out() {
    let context = start_outbound();

    context.advance_ms(59_999);
    context.assert_state(CallState::InviteSent);

    context.advance_ms(1);
    context.assert_state(CallState::Ended);
    assert_eq!(
        context.platform().ended(),
        Some((CallParty::Local, CallErrorCode::InviteTimeout))
    );

    // The remote side is told we gave up.
    let hangups = context.platform().messages_of_type(MessageType::Hangup);
    assert_eq!(hangups.len(), 1);
    match &hangups[0] {
        Message::Hangup(hangup) => {
            assert_eq!(hangup.reason, Some(CallErrorCode::InviteTimeout))
        }
        message => panic!("unexpected message: {}", message),
    }
}

#[test]
fn second_answer_from_another_party_is_ignored() {
    let context = start_outbound();
    context.deliver(
        answer_message(usermedia_metadata(REMOTE_USER_STREAM, false, false)),
        "B",
    );
    context.assert_state(CallState::Connecting);
    assert_eq!(context.pc().set_remote_description_calls(), 1);

    // A different device answering later loses the race.
    context.deliver(
        answer_message(usermedia_metadata(REMOTE_USER_STREAM, false, false)),
        "C",
    );
    context.assert_state(CallState::Connecting);
    assert_eq!(context.pc().set_remote_description_calls(), 1);
}

#[test]
fn candidates_are_batched_with_the_outbound_trickle_delay() {
    let context = start_outbound();
    context.deliver(
        answer_message(usermedia_metadata(REMOTE_USER_STREAM, false, false)),
        "B",
    );

    let candidates: Vec<_> = (0..5).map(|_| random_ice_candidate()).collect();
    for candidate in &candidates {
        context.pc().inject_local_ice_candidate(candidate.clone());
    }
    context.sync();

    context.advance_ms(1_999);
    assert_eq!(context.platform().message_count(MessageType::Candidates), 0);

    context.advance_ms(1);
    let sent = context.platform().messages_of_type(MessageType::Candidates);
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::Candidates(content) => assert_eq!(content.candidates, candidates),
        message => panic!("unexpected message: {}", message),
    }
}

#[test]
fn candidates_gathered_before_the_invite_ride_in_the_sdp() {
    let context = TestContext::new();
    let mic = local_mic();
    context
        .call()
        .call(media_ok(local_media(Some(&mic), None, None)));
    context.sync();

    // Gathered during the grace period, so already part of the offer.
    for _ in 0..3 {
        context.pc().inject_local_ice_candidate(random_ice_candidate());
    }
    context.sync();

    context.advance_ms(200);
    context.assert_state(CallState::InviteSent);
    context.advance_ms(10_000);
    assert_eq!(context.platform().message_count(MessageType::Candidates), 0);
}

#[test]
fn renegotiations_run_one_at_a_time_in_order() {
    let context = start_outbound();
    connect_outbound(&context);
    let set_local_calls_before = context.pc().set_local_description_calls();

    context.pc().inject_negotiation_needed();
    context.pc().inject_negotiation_needed();
    context.sync();

    // The first round set its description and is waiting out the
    // gathering grace; the second is queued behind it.
    assert_eq!(
        context.pc().set_local_description_calls(),
        set_local_calls_before + 1
    );
    assert_eq!(context.platform().message_count(MessageType::Negotiate), 0);

    context.advance_ms(200);
    assert_eq!(context.platform().message_count(MessageType::Negotiate), 1);
    assert_eq!(
        context.pc().set_local_description_calls(),
        set_local_calls_before + 2
    );

    context.advance_ms(200);
    assert_eq!(context.platform().message_count(MessageType::Negotiate), 2);

    // Still exactly one invite for the whole call.
    assert_eq!(context.platform().message_count(MessageType::Invite), 1);
}

#[test]
fn local_media_failure_ends_the_call() {
    let context = TestContext::new();
    context.call().call(media_err());
    context.sync();

    context.assert_state(CallState::Ended);
    assert_eq!(
        context.platform().ended(),
        Some((CallParty::Local, CallErrorCode::NoUserMedia))
    );
    assert_eq!(context.platform().message_count(MessageType::Hangup), 1);
}

#[test]
fn invite_send_failure_ends_the_call_without_another_send() {
    let context = TestContext::new();
    context.platform().set_fail_sends(true);
    let mic = local_mic();
    context
        .call()
        .call(media_ok(local_media(Some(&mic), None, None)));
    context.sync();
    context.advance_ms(200);

    context.assert_state(CallState::Ended);
    assert_eq!(
        context.platform().ended(),
        Some((CallParty::Local, CallErrorCode::SendInvite))
    );
    assert!(context.platform().sent_messages().is_empty());
}

#[test]
fn failing_offer_creation_ends_the_call() {
    let context = TestContext::new();
    context.pc().set_fail_create_offer(true);
    let mic = local_mic();
    context
        .call()
        .call(media_ok(local_media(Some(&mic), None, None)));
    context.sync();

    context.assert_state(CallState::Ended);
    assert_eq!(
        context.platform().ended(),
        Some((CallParty::Local, CallErrorCode::LocalOfferFailed))
    );
}

#[test]
fn failing_remote_answer_ends_the_call() {
    let context = start_outbound();
    context.pc().set_fail_set_remote_description(true);
    context.deliver(
        answer_message(usermedia_metadata(REMOTE_USER_STREAM, false, false)),
        "B",
    );

    context.assert_state(CallState::Ended);
    assert_eq!(
        context.platform().ended(),
        Some((CallParty::Local, CallErrorCode::SetRemoteDescription))
    );
    assert_eq!(context.platform().message_count(MessageType::Hangup), 1);
}

#[test]
fn hangup_notifies_the_remote_side() {
    let context = start_outbound();
    context.call().hangup(CallErrorCode::UserHangup);
    context.sync();

    context.assert_state(CallState::Ended);
    assert_eq!(
        context.platform().ended(),
        Some((CallParty::Local, CallErrorCode::UserHangup))
    );
    assert_eq!(context.platform().message_count(MessageType::Hangup), 1);
}

#[test]
fn nothing_changes_after_ended() {
    let context = start_outbound();
    context.call().hangup(CallErrorCode::UserHangup);
    context.sync();
    let messages_before = context.platform().sent_messages().len();

    context.deliver(
        answer_message(usermedia_metadata(REMOTE_USER_STREAM, false, false)),
        "B",
    );
    context.deliver(candidates_message(vec![random_ice_candidate()]), "B");
    context.deliver(hangup_message(Some(CallErrorCode::Replaced)), "B");
    context.advance_ms(120_000);

    context.assert_state(CallState::Ended);
    assert_eq!(
        context.platform().ended(),
        Some((CallParty::Local, CallErrorCode::UserHangup))
    );
    assert_eq!(context.platform().ended_count(), 1);
    assert_eq!(context.platform().sent_messages().len(), messages_before);
    assert_eq!(context.pc().added_candidates().len(), 0);
}

#[test]
fn ice_failure_ends_the_call() {
    let context = start_outbound();
    connect_outbound(&context);

    context
        .pc()
        .inject_ice_connection_state(IceConnectionState::Failed);
    context.sync();

    context.assert_state(CallState::Ended);
    assert_eq!(
        context.platform().ended(),
        Some((CallParty::Local, CallErrorCode::IceFailed))
    );
}

#[test]
fn set_media_reconciles_each_track_role() {
    let context = start_outbound();
    connect_outbound(&context);

    let mic = local_mic();
    let old_cam = local_cam();
    // Rebuild the media the call started with so the handles match.
    // start_outbound created its own tracks, so swap everything in
    // first and let that settle.
    context
        .call()
        .set_media(media_ok(local_media(Some(&mic), Some(&old_cam), None)));
    context.sync();
    context.advance_ms(200);
    let negotiates_before = context.platform().message_count(MessageType::Negotiate);

    // Same microphone handle, new camera, new screen share.
    let new_cam = local_cam();
    let screen = local_screen();
    context.call().set_media(media_ok(local_media(
        Some(&mic),
        Some(&new_cam),
        Some(&screen),
    )));
    context.sync();

    assert!(old_cam.stopped());
    assert!(!mic.stopped());
    let local_tracks = context.pc().local_tracks();
    assert!(local_tracks
        .iter()
        .any(|track| track.stream_id() == "local-screen"));

    // Adding the screen share renegotiates; the compatible camera
    // replacement does not add another round.
    context.advance_ms(200);
    assert_eq!(
        context.platform().message_count(MessageType::Negotiate),
        negotiates_before + 1
    );

    // An identical swap is a no-op.
    let track_count = context.pc().local_tracks().len();
    context.call().set_media(media_ok(local_media(
        Some(&mic),
        Some(&new_cam),
        Some(&screen),
    )));
    context.sync();
    context.advance_ms(500);
    assert_eq!(context.pc().local_tracks().len(), track_count);
    assert!(!new_cam.stopped());
    assert_eq!(
        context.platform().message_count(MessageType::Negotiate),
        negotiates_before + 1
    );
}

#[test]
fn incompatible_replacement_renegotiates() {
    let context = start_outbound();
    connect_outbound(&context);

    let mic = local_mic();
    let cam = local_cam();
    context
        .call()
        .set_media(media_ok(local_media(Some(&mic), Some(&cam), None)));
    context.sync();
    context.advance_ms(200);
    let negotiates_before = context.platform().message_count(MessageType::Negotiate);

    context.pc().set_incompatible_replace(true);
    let new_cam = local_cam();
    context
        .call()
        .set_media(media_ok(local_media(Some(&mic), Some(&new_cam), None)));
    context.sync();
    context.advance_ms(200);

    assert_eq!(
        context.platform().message_count(MessageType::Negotiate),
        negotiates_before + 1
    );
}

#[test]
fn local_mute_is_advertised_without_renegotiation() {
    let context = start_outbound();
    connect_outbound(&context);
    let negotiates_before = context.platform().message_count(MessageType::Negotiate);

    context.call().set_local_mute(TrackType::Microphone, true);
    context.sync();

    let changed = context
        .platform()
        .messages_of_type(MessageType::SdpStreamMetadataChanged);
    assert_eq!(changed.len(), 1);
    match &changed[0] {
        Message::SdpStreamMetadataChanged(content) => {
            let user = content
                .sdp_stream_metadata
                .get(LOCAL_USER_STREAM)
                .expect(error_line!());
            assert!(user.audio_muted);
            assert!(!user.video_muted);
        }
        message => panic!("unexpected message: {}", message),
    }

    // Muting the same track again changes nothing.
    context.call().set_local_mute(TrackType::Microphone, true);
    context.sync();
    assert_eq!(
        context
            .platform()
            .message_count(MessageType::SdpStreamMetadataChanged),
        1
    );
    context.advance_ms(500);
    assert_eq!(
        context.platform().message_count(MessageType::Negotiate),
        negotiates_before
    );
}

#[test]
fn inbound_negotiate_offer_is_answered() {
    let context = start_outbound();
    connect_outbound(&context);

    let remote_offer = Message::Negotiate(peercall::core::signaling::NegotiateContent {
        description: peercall::core::signaling::SessionDescription::offer(
            "v=0\r\nremote renegotiation".to_string(),
        ),
        sdp_stream_metadata: usermedia_metadata(REMOTE_USER_STREAM, false, true),
        version: peercall::core::signaling::VERSION,
    });
    context.deliver(remote_offer, "B");

    let negotiates = context.platform().messages_of_type(MessageType::Negotiate);
    assert_eq!(negotiates.len(), 1);
    match &negotiates[0] {
        Message::Negotiate(content) => {
            assert_eq!(content.description.type_, SdpType::Answer)
        }
        message => panic!("unexpected message: {}", message),
    }
    context.assert_state(CallState::Connected);
}

#[test]
fn colliding_remote_offer_is_ignored_while_negotiating() {
    let context = start_outbound();
    connect_outbound(&context);
    let set_remote_before = context.pc().set_remote_description_calls();

    // Our own round is in flight, waiting out the gathering grace.
    context.pc().inject_negotiation_needed();
    context.sync();

    let remote_offer = Message::Negotiate(peercall::core::signaling::NegotiateContent {
        description: peercall::core::signaling::SessionDescription::offer(
            "v=0\r\nglare offer".to_string(),
        ),
        sdp_stream_metadata: Default::default(),
        version: peercall::core::signaling::VERSION,
    });
    context.deliver(remote_offer, "B");
    assert_eq!(
        context.pc().set_remote_description_calls(),
        set_remote_before
    );

    // Candidates for the dropped offer may be rejected by the stack;
    // that must not end the call.
    context.pc().set_fail_add_ice_candidate(true);
    context.deliver(candidates_message(vec![random_ice_candidate()]), "B");
    assert_ne!(context.call().state(), CallState::Ended);
    assert_eq!(context.platform().ended(), None);
}

#[test]
fn polite_peer_yields_to_a_colliding_offer() {
    let config = CallConfig {
        polite: true,
        ..CallConfig::default()
    };
    let context = TestContext::with_config(config);
    drive_to_invite_sent(&context);
    connect_outbound(&context);
    let set_remote_before = context.pc().set_remote_description_calls();

    context.pc().inject_negotiation_needed();
    context.sync();

    let remote_offer = Message::Negotiate(peercall::core::signaling::NegotiateContent {
        description: peercall::core::signaling::SessionDescription::offer(
            "v=0\r\nglare offer".to_string(),
        ),
        sdp_stream_metadata: Default::default(),
        version: peercall::core::signaling::VERSION,
    });
    context.deliver(remote_offer, "B");

    // The polite side applies the remote offer despite its own round
    // being in flight, and answers it.
    assert_eq!(
        context.pc().set_remote_description_calls(),
        set_remote_before + 1
    );
    let negotiates = context.platform().messages_of_type(MessageType::Negotiate);
    assert_eq!(negotiates.len(), 1);
    match &negotiates[0] {
        Message::Negotiate(content) => {
            assert_eq!(content.description.type_, SdpType::Answer)
        }
        message => panic!("unexpected message: {}", message),
    }
}
