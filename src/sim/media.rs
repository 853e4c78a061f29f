//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation media tracks.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::common::StreamId;
use crate::webrtc::media::{MediaKind, Track};

/// A fake media track.  Tests keep the `Arc<SimTrack>` to inspect mute
/// and stop state after handing the same Arc to the call.
pub struct SimTrack {
    stream_id: StreamId,
    media_kind: MediaKind,
    muted: AtomicBool,
    stopped: AtomicBool,
    set_muted_calls: AtomicU32,
}

impl SimTrack {
    pub fn new(media_kind: MediaKind, stream_id: &str) -> Arc<Self> {
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            media_kind,
            muted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            set_muted_calls: AtomicU32::new(0),
        })
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// How often anybody called `set_muted`, mute re-application
    /// included.
    pub fn set_muted_calls(&self) -> u32 {
        self.set_muted_calls.load(Ordering::Relaxed)
    }
}

impl Track for SimTrack {
    fn stream_id(&self) -> StreamId {
        self.stream_id.clone()
    }

    fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    fn set_muted(&self, muted: bool) {
        self.set_muted_calls.fetch_add(1, Ordering::Relaxed);
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
