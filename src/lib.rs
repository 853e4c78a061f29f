//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A 1:1 peer call signalling engine.
//!
//! Drives a single peer-to-peer media session through its lifecycle
//! over an abstract messaging transport, delegating the actual media
//! transport to an abstract peer connection provider.

#[macro_use]
extern crate log;

pub mod common;
pub mod core;
pub mod error;
pub mod webrtc;

#[cfg(feature = "sim")]
pub mod sim;
