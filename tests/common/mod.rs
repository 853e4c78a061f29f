//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common test utilities

// Requires the 'sim' feature

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::env;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use rand::distributions::{Distribution, Standard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use peercall::common::{CallConfig, CallId, CallState};
use peercall::core::peer_call::{MediaSource, PeerCall};
use peercall::core::signaling::{
    AnswerContent, CallErrorCode, CandidatesContent, HangupContent, IceCandidate, InviteContent,
    Message, SessionDescription, StreamMetadata, StreamMetadataMap, StreamPurpose, VERSION,
};
use peercall::sim::error::SimError;
use peercall::sim::media::SimTrack;
use peercall::sim::peer_connection::{SimPeerConnection, SimPeerConnectionFactory};
use peercall::sim::sim_platform::SimPlatform;
use peercall::sim::timer::FakeClock;
use peercall::webrtc::media::{LocalMedia, MediaKind, Track};

#[macro_export]
macro_rules! error_line {
    () => {
        concat!(module_path!(), ":", line!())
    };
}

pub struct Prng {
    rng: Mutex<ChaCha20Rng>,
}

impl Prng {
    fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }

    pub fn gen<T>(&self) -> T
    where
        Standard: Distribution<T>,
    {
        self.rng.lock().expect("prng lock").gen::<T>()
    }
}

pub static PRNG: LazyLock<Prng> = LazyLock::new(|| {
    let seed = env::var("RANDOM_SEED")
        .ok()
        .and_then(|seed| seed.parse::<u64>().ok())
        .unwrap_or(0xCA11);
    Prng::new(seed)
});

pub fn test_init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A call under test with all of its sim collaborators.
pub struct TestContext {
    platform: SimPlatform,
    pc: SimPeerConnection,
    clock: FakeClock,
    call: PeerCall,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(CallConfig::default())
    }

    pub fn with_config(config: CallConfig) -> Self {
        test_init();
        let platform = SimPlatform::new();
        let factory = SimPeerConnectionFactory::new();
        let clock = FakeClock::new();
        let call = PeerCall::start(
            PRNG.gen::<CallId>(),
            Box::new(platform.clone()),
            Box::new(factory.clone()),
            Arc::new(clock.clone()),
            config,
        )
        .expect(error_line!());
        let pc = factory.last_created().expect(error_line!());
        Self {
            platform,
            pc,
            clock,
            call,
        }
    }

    pub fn call(&self) -> &PeerCall {
        &self.call
    }

    pub fn pc(&self) -> &SimPeerConnection {
        &self.pc
    }

    pub fn platform(&self) -> &SimPlatform {
        &self.platform
    }

    /// Flushes the call's actor queue.
    pub fn sync(&self) {
        self.call.synchronize().expect(error_line!());
    }

    /// Advances the virtual clock and flushes whatever the fired
    /// timeouts enqueued.
    pub fn advance_ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
        self.sync();
    }

    pub fn deliver(&self, message: Message, party_id: &str) {
        self.call
            .handle_incoming_signaling_message(message, Some(party_id.to_string()));
        self.sync();
    }

    pub fn deliver_legacy(&self, message: Message) {
        self.call.handle_incoming_signaling_message(message, None);
        self.sync();
    }

    pub fn assert_state(&self, expected: CallState) {
        assert_eq!(self.call.state(), expected);
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.call.dispose();
    }
}

// --- media helpers ----------------------------------------------------

pub const LOCAL_USER_STREAM: &str = "local-user";
pub const LOCAL_SCREEN_STREAM: &str = "local-screen";
pub const REMOTE_USER_STREAM: &str = "remote-user";
pub const REMOTE_SCREEN_STREAM: &str = "remote-screen";

pub fn local_mic() -> Arc<SimTrack> {
    SimTrack::new(MediaKind::Audio, LOCAL_USER_STREAM)
}

pub fn local_cam() -> Arc<SimTrack> {
    SimTrack::new(MediaKind::Video, LOCAL_USER_STREAM)
}

pub fn local_screen() -> Arc<SimTrack> {
    SimTrack::new(MediaKind::Video, LOCAL_SCREEN_STREAM)
}

pub fn local_media(
    mic: Option<&Arc<SimTrack>>,
    cam: Option<&Arc<SimTrack>>,
    screen: Option<&Arc<SimTrack>>,
) -> LocalMedia {
    LocalMedia::new(
        mic.map(|track| track.clone() as Arc<dyn Track>),
        cam.map(|track| track.clone() as Arc<dyn Track>),
        screen.map(|track| track.clone() as Arc<dyn Track>),
    )
}

pub fn media_ok(media: LocalMedia) -> MediaSource {
    Box::new(move || Ok(media))
}

pub fn media_err() -> MediaSource {
    Box::new(|| Err(SimError::InjectedFailure("get_user_media").into()))
}

// --- wire helpers -----------------------------------------------------

pub fn random_ice_candidate() -> IceCandidate {
    IceCandidate::new(
        format!(
            "candidate:{} 1 udp 2122260223 192.0.2.{} {} typ host",
            PRNG.gen::<u32>(),
            PRNG.gen::<u8>(),
            PRNG.gen::<u16>(),
        ),
        Some("0".to_string()),
        Some(0),
    )
}

pub fn candidates_message(candidates: Vec<IceCandidate>) -> Message {
    Message::Candidates(CandidatesContent {
        candidates,
        version: VERSION,
    })
}

pub fn usermedia_metadata(
    stream_id: &str,
    audio_muted: bool,
    video_muted: bool,
) -> StreamMetadataMap {
    let mut metadata = StreamMetadataMap::new();
    metadata.insert(
        stream_id.to_string(),
        StreamMetadata {
            purpose: StreamPurpose::Usermedia,
            audio_muted,
            video_muted,
        },
    );
    metadata
}

pub fn invite_message(metadata: StreamMetadataMap, lifetime: Option<u64>) -> Message {
    Message::Invite(InviteContent {
        offer: SessionDescription::offer(format!("v=0\r\nremote offer {}", PRNG.gen::<u16>())),
        sdp_stream_metadata: metadata,
        version: VERSION,
        lifetime,
    })
}

pub fn answer_message(metadata: StreamMetadataMap) -> Message {
    Message::Answer(AnswerContent {
        answer: SessionDescription::answer(format!("v=0\r\nremote answer {}", PRNG.gen::<u16>())),
        sdp_stream_metadata: metadata,
        version: VERSION,
    })
}

pub fn hangup_message(reason: Option<CallErrorCode>) -> Message {
    Message::Hangup(HangupContent {
        reason,
        version: VERSION,
    })
}

/// A pair of remote usermedia tracks sharing one stream, for seeding
/// the sim connection before an offer is applied.
pub fn remote_usermedia_tracks() -> (Arc<SimTrack>, Arc<SimTrack>) {
    (
        SimTrack::new(MediaKind::Audio, REMOTE_USER_STREAM),
        SimTrack::new(MediaKind::Video, REMOTE_USER_STREAM),
    )
}

pub fn as_dyn_tracks(tracks: &[Arc<SimTrack>]) -> Vec<Arc<dyn Track>> {
    tracks
        .iter()
        .map(|track| track.clone() as Arc<dyn Track>)
        .collect()
}
