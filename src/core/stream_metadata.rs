//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Registry of remote stream metadata: what each remote stream is for
//! and whether its audio/video is muted, keyed by stream id.  Updated
//! by merging the maps carried on Invite, Answer, Negotiate and
//! SdpStreamMetadataChanged contents.

use crate::core::signaling::{StreamMetadata, StreamMetadataMap, StreamPurpose};

#[derive(Default)]
pub struct StreamMetadataRegistry {
    streams: StreamMetadataMap,
}

impl StreamMetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-level merge: later values overwrite per stream id, streams
    /// not mentioned are left alone.  Returns whether anything changed
    /// so an identical update stays a no-op for observers.
    pub fn merge(&mut self, incoming: &StreamMetadataMap) -> bool {
        let mut changed = false;
        for (stream_id, metadata) in incoming {
            if self.streams.get(stream_id) != Some(metadata) {
                self.streams.insert(stream_id.clone(), *metadata);
                changed = true;
            }
        }
        changed
    }

    /// Streams we have no metadata for are assumed to carry user media.
    pub fn purpose_for_stream(&self, stream_id: &str) -> StreamPurpose {
        self.streams
            .get(stream_id)
            .map(|metadata| metadata.purpose)
            .unwrap_or(StreamPurpose::Usermedia)
    }

    pub fn get(&self, stream_id: &str) -> Option<&StreamMetadata> {
        self.streams.get(stream_id)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
