//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The messages we exchange over the signalling channel to establish a
//! call.  Envelopes, delivery and encryption belong to the transport;
//! this module only defines the content payloads and their JSON codec.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{Result, StreamId};
use crate::core::util::{redact_candidate, redact_sdp};

/// Protocol version stamped on every outbound content.
pub const VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP blob together with its offer/answer role.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub type_: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            type_: SdpType::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            type_: SdpType::Answer,
            sdp,
        }
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({})", self.type_, redact_sdp(&self.sdp))
    }
}

impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// What a media stream is for, as advertised in stream metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamPurpose {
    #[serde(rename = "m.usermedia")]
    Usermedia,
    #[serde(rename = "m.screenshare")]
    Screenshare,
}

/// Out-of-band purpose and mute state for one media stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub purpose: StreamPurpose,
    #[serde(default)]
    pub audio_muted: bool,
    #[serde(default)]
    pub video_muted: bool,
}

pub type StreamMetadataMap = HashMap<StreamId, StreamMetadata>;

/// One trickled ICE candidate.  A candidate with an empty `candidate`
/// string is the end-of-candidates marker and is allowed on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: String, sdp_mid: Option<String>, sdp_m_line_index: Option<u32>) -> Self {
        Self {
            candidate,
            sdp_mid,
            sdp_m_line_index,
        }
    }

    /// A candidate naming neither a mid nor an m-line index cannot be
    /// routed to a transport and is skipped on receive.
    pub fn has_target(&self) -> bool {
        self.sdp_mid.is_some() || self.sdp_m_line_index.is_some()
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", redact_candidate(&self.candidate))
    }
}

impl fmt::Debug for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Reasons a call can end, mirrored on the wire in Hangup contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorCode {
    UserHangup,
    LocalOfferFailed,
    NoUserMedia,
    CreateAnswer,
    SendInvite,
    SendAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    IceFailed,
    InviteTimeout,
    SignallingFailed,
    AnsweredElsewhere,
    Replaced,
    Transfered,
    UserBusy,
    UnknownDevices,
    NewSession,
}

impl fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The caller sends this to initiate the call.
#[derive(Clone, Serialize, Deserialize)]
pub struct InviteContent {
    pub offer: SessionDescription,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sdp_stream_metadata: StreamMetadataMap,
    pub version: u32,
    /// How long the caller keeps ringing, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u64>,
}

/// The callee sends this to pick up.
#[derive(Clone, Serialize, Deserialize)]
pub struct AnswerContent {
    pub answer: SessionDescription,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sdp_stream_metadata: StreamMetadataMap,
    pub version: u32,
}

/// Either side trickles candidates with these, any time after its
/// description went out.
#[derive(Clone, Serialize, Deserialize)]
pub struct CandidatesContent {
    pub candidates: Vec<IceCandidate>,
    pub version: u32,
}

/// Either side ends the call with this.  A missing reason means the
/// user simply hung up.
#[derive(Clone, Serialize, Deserialize)]
pub struct HangupContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CallErrorCode>,
    pub version: u32,
}

/// Renegotiation after the initial exchange: a fresh description from
/// either side.
#[derive(Clone, Serialize, Deserialize)]
pub struct NegotiateContent {
    pub description: SessionDescription,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sdp_stream_metadata: StreamMetadataMap,
    pub version: u32,
}

/// Metadata-only update, used for mute changes that need no
/// renegotiation.
#[derive(Clone, Serialize, Deserialize)]
pub struct SdpStreamMetadataChangedContent {
    pub sdp_stream_metadata: StreamMetadataMap,
    pub version: u32,
}

/// The different types of signalling messages that can be sent and
/// received.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum Message {
    #[serde(rename = "m.call.invite")]
    Invite(InviteContent),
    #[serde(rename = "m.call.answer")]
    Answer(AnswerContent),
    #[serde(rename = "m.call.candidates")]
    Candidates(CandidatesContent),
    #[serde(rename = "m.call.hangup")]
    Hangup(HangupContent),
    #[serde(rename = "m.call.negotiate")]
    Negotiate(NegotiateContent),
    #[serde(rename = "m.call.sdp_stream_metadata_changed")]
    SdpStreamMetadataChanged(SdpStreamMetadataChangedContent),
}

// It's convenient to be able to know the type of a message without
// having an entire message, so we have the related MessageType enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Invite,
    Answer,
    Candidates,
    Hangup,
    Negotiate,
    SdpStreamMetadataChanged,
}

impl Message {
    pub fn typ(&self) -> MessageType {
        match self {
            Self::Invite(_) => MessageType::Invite,
            Self::Answer(_) => MessageType::Answer,
            Self::Candidates(_) => MessageType::Candidates,
            Self::Hangup(_) => MessageType::Hangup,
            Self::Negotiate(_) => MessageType::Negotiate,
            Self::SdpStreamMetadataChanged(_) => MessageType::SdpStreamMetadataChanged,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Tolerant parse: messages of unknown type come back as `None`
    /// so the caller can ignore them.
    pub fn parse(json: &str) -> Result<Option<Message>> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            typ: String,
            #[serde(default)]
            content: serde_json::Value,
        }

        let envelope: Envelope = serde_json::from_str(json)?;
        let message = match envelope.typ.as_str() {
            "m.call.invite" => Message::Invite(serde_json::from_value(envelope.content)?),
            "m.call.answer" => Message::Answer(serde_json::from_value(envelope.content)?),
            "m.call.candidates" => Message::Candidates(serde_json::from_value(envelope.content)?),
            "m.call.hangup" => Message::Hangup(serde_json::from_value(envelope.content)?),
            "m.call.negotiate" => Message::Negotiate(serde_json::from_value(envelope.content)?),
            "m.call.sdp_stream_metadata_changed" => {
                Message::SdpStreamMetadataChanged(serde_json::from_value(envelope.content)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Self::Invite(invite) => format!(
                "Invite({}, {} streams, lifetime: {:?})",
                invite.offer,
                invite.sdp_stream_metadata.len(),
                invite.lifetime
            ),
            Self::Answer(answer) => format!("Answer({})", answer.answer),
            Self::Candidates(candidates) => {
                format!("Candidates({})", candidates.candidates.len())
            }
            Self::Hangup(hangup) => format!("Hangup({:?})", hangup.reason),
            Self::Negotiate(negotiate) => format!("Negotiate({})", negotiate.description),
            Self::SdpStreamMetadataChanged(changed) => format!(
                "SdpStreamMetadataChanged({} streams)",
                changed.sdp_stream_metadata.len()
            ),
        };
        write!(f, "({})", display)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
