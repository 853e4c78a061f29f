//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub mod call_mutex;
pub mod candidates;
pub mod peer_call;
pub mod signaling;
pub mod stream_metadata;
pub mod util;
