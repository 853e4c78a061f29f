//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Candidate buffering for both directions of the wire: outbound
//! candidates batch up until a trickle delay elapses, inbound
//! candidates wait until we have committed to an opponent party.

use std::collections::HashMap;

use crate::common::PartyId;
use crate::core::signaling::IceCandidate;

/// Locally gathered candidates pending a batched Candidates message.
/// Order is arrival order and is preserved across the drain.
#[derive(Default)]
pub struct CandidateSendQueue {
    candidates: Vec<IceCandidate>,
}

impl CandidateSendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.candidates.push(candidate);
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.candidates)
    }

    /// Drops everything queued, returning how many were dropped.  Used
    /// when a fresh local description already carries the candidates.
    pub fn discard(&mut self) -> usize {
        let discarded = self.candidates.len();
        self.candidates.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Inbound candidates received before an opponent party was chosen,
/// kept per sending party so the eventual commitment can drain exactly
/// the right ones.
#[derive(Default)]
pub struct RemoteCandidateBuffer {
    by_party: HashMap<PartyId, Vec<IceCandidate>>,
}

impl RemoteCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&mut self, party_id: &str, candidate: IceCandidate) {
        self.by_party
            .entry(party_id.to_string())
            .or_default()
            .push(candidate);
    }

    pub fn buffered_len(&self, party_id: &str) -> usize {
        self.by_party.get(party_id).map_or(0, Vec::len)
    }

    /// Consumes the buffer: the committed party's candidates come back
    /// in arrival order, everything buffered under other parties is
    /// dropped.  The second value is how many were dropped.
    pub fn commit(mut self, party_id: &str) -> (Vec<IceCandidate>, usize) {
        let committed = self.by_party.remove(party_id).unwrap_or_default();
        let discarded = self.by_party.values().map(Vec::len).sum();
        (committed, discarded)
    }
}
