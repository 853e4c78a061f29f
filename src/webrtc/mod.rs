//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub mod media;
pub mod peer_connection;
pub mod peer_connection_factory;
pub mod peer_connection_observer;
