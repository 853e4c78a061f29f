//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Media track handles and the local media bundle a call carries.

use std::fmt;
use std::sync::Arc;

use crate::common::StreamId;
use crate::core::signaling::{StreamMetadata, StreamMetadataMap, StreamPurpose};

/// Whether a track carries audio or video samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// What a track is, in call terms.  Local tracks have this intrinsically;
/// remote tracks derive it from their media kind and the advertised
/// purpose of their stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackType {
    Microphone,
    Camera,
    ScreenShare,
}

impl TrackType {
    pub const ALL: [TrackType; 3] = [
        TrackType::Microphone,
        TrackType::Camera,
        TrackType::ScreenShare,
    ];

    pub fn from_kind_and_purpose(kind: MediaKind, purpose: StreamPurpose) -> Self {
        match (kind, purpose) {
            (MediaKind::Audio, _) => TrackType::Microphone,
            (MediaKind::Video, StreamPurpose::Usermedia) => TrackType::Camera,
            (MediaKind::Video, StreamPurpose::Screenshare) => TrackType::ScreenShare,
        }
    }
}

/// A media track owned by either side of the call.  Implemented by the
/// media capture layer; the engine only steers mute state and lifetime.
pub trait Track: Send + Sync {
    fn stream_id(&self) -> StreamId;
    fn media_kind(&self) -> MediaKind;
    fn muted(&self) -> bool;
    fn set_muted(&self, muted: bool);
    fn stop(&self);
}

/// The local tracks a call is currently sending, at most one per role.
/// Microphone and camera share the user-media stream; a screen share
/// has its own stream.
#[derive(Clone, Default)]
pub struct LocalMedia {
    pub microphone: Option<Arc<dyn Track>>,
    pub camera: Option<Arc<dyn Track>>,
    pub screen_share: Option<Arc<dyn Track>>,
}

impl LocalMedia {
    pub fn new(
        microphone: Option<Arc<dyn Track>>,
        camera: Option<Arc<dyn Track>>,
        screen_share: Option<Arc<dyn Track>>,
    ) -> Self {
        Self {
            microphone,
            camera,
            screen_share,
        }
    }

    pub fn track(&self, track_type: TrackType) -> Option<&Arc<dyn Track>> {
        match track_type {
            TrackType::Microphone => self.microphone.as_ref(),
            TrackType::Camera => self.camera.as_ref(),
            TrackType::ScreenShare => self.screen_share.as_ref(),
        }
    }

    pub fn tracks(&self) -> Vec<Arc<dyn Track>> {
        TrackType::ALL
            .iter()
            .filter_map(|track_type| self.track(*track_type).cloned())
            .collect()
    }

    /// The outbound stream metadata describing this media, keyed by
    /// stream id.  An absent track of a role counts as muted.
    pub fn sdp_metadata(&self) -> StreamMetadataMap {
        let mut metadata = StreamMetadataMap::new();
        if let Some(track) = self.microphone.as_ref().or(self.camera.as_ref()) {
            metadata.insert(
                track.stream_id(),
                StreamMetadata {
                    purpose: StreamPurpose::Usermedia,
                    audio_muted: self.microphone.as_ref().map_or(true, |t| t.muted()),
                    video_muted: self.camera.as_ref().map_or(true, |t| t.muted()),
                },
            );
        }
        if let Some(track) = &self.screen_share {
            metadata.insert(
                track.stream_id(),
                StreamMetadata {
                    purpose: StreamPurpose::Screenshare,
                    audio_muted: true,
                    video_muted: track.muted(),
                },
            );
        }
        metadata
    }

    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "LocalMedia(mic: {}, cam: {}, screen: {})",
            self.microphone.is_some(),
            self.camera.is_some(),
            self.screen_share.is_some()
        )
    }
}

/// What has to happen to one track role when local media changes.
pub enum TrackUpdate {
    Add(Arc<dyn Track>),
    Remove(Arc<dyn Track>),
    Replace {
        old: Arc<dyn Track>,
        new: Arc<dyn Track>,
    },
}

impl fmt::Debug for TrackUpdate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Add(_) => "Add",
            Self::Remove(_) => "Remove",
            Self::Replace { .. } => "Replace",
        };
        write!(f, "{}", name)
    }
}

/// Per-role difference between two local media handles.  A role whose
/// track is the very same handle on both sides is a no-op.
pub fn diff_local_media(old: &LocalMedia, new: &LocalMedia) -> Vec<(TrackType, TrackUpdate)> {
    let mut updates = Vec::new();
    for track_type in TrackType::ALL {
        match (old.track(track_type), new.track(track_type)) {
            (Some(old_track), Some(new_track)) => {
                if !Arc::ptr_eq(old_track, new_track) {
                    updates.push((
                        track_type,
                        TrackUpdate::Replace {
                            old: old_track.clone(),
                            new: new_track.clone(),
                        },
                    ));
                }
            }
            (Some(old_track), None) => {
                updates.push((track_type, TrackUpdate::Remove(old_track.clone())));
            }
            (None, Some(new_track)) => {
                updates.push((track_type, TrackUpdate::Add(new_track.clone())));
            }
            (None, None) => {}
        }
    }
    updates
}
