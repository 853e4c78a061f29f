//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Helpers for keeping session descriptions and candidates out of logs.
//! SDP bodies carry addresses and fingerprints; log the shape, not the
//! contents.

/// Log-safe rendering of an SDP blob: the first line plus a line count.
pub fn redact_sdp(sdp: &str) -> String {
    if sdp.is_empty() {
        return "(empty)".to_string();
    }
    let line_count = sdp.lines().count();
    match sdp.lines().next() {
        Some(first_line) => format!("{} ... ({} lines)", first_line, line_count),
        None => "(empty)".to_string(),
    }
}

/// Log-safe rendering of an ICE candidate attribute: keeps the
/// foundation, component, transport and priority, drops the address.
pub fn redact_candidate(candidate: &str) -> String {
    if candidate.is_empty() {
        return "(end-of-candidates)".to_string();
    }
    let kept: Vec<&str> = candidate.split_whitespace().take(4).collect();
    format!("{} <addr redacted>", kept.join(" "))
}
