//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation host platform: records every update and outbound
//! signalling message a call produces, with injectable send failures.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::common::{CallId, CallParty, CallState, Result};
use crate::core::call_mutex::CallMutex;
use crate::core::peer_call::Observer;
use crate::core::signaling::{CallErrorCode, Message, MessageType};
use crate::sim::error::SimError;

#[derive(Clone)]
pub struct SimPlatform {
    state_updates: Arc<CallMutex<Vec<CallState>>>,
    sent_messages: Arc<CallMutex<Vec<Message>>>,
    ended: Arc<CallMutex<Option<(CallParty, CallErrorCode)>>>,
    ended_count: Arc<AtomicU32>,
    fail_sends: Arc<AtomicBool>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            state_updates: Arc::new(CallMutex::new(Vec::new(), "sim_state_updates")),
            sent_messages: Arc::new(CallMutex::new(Vec::new(), "sim_sent_messages")),
            ended: Arc::new(CallMutex::new(None, "sim_ended")),
            ended_count: Arc::new(AtomicU32::new(0)),
            fail_sends: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every subsequent send fail until turned off again.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    pub fn state_updates(&self) -> Vec<CallState> {
        self.state_updates
            .lock()
            .map(|updates| updates.clone())
            .unwrap_or_default()
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent_messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn messages_of_type(&self, typ: MessageType) -> Vec<Message> {
        self.sent_messages()
            .into_iter()
            .filter(|message| message.typ() == typ)
            .collect()
    }

    pub fn message_count(&self, typ: MessageType) -> usize {
        self.messages_of_type(typ).len()
    }

    pub fn last_message(&self) -> Option<Message> {
        self.sent_messages().into_iter().last()
    }

    pub fn ended(&self) -> Option<(CallParty, CallErrorCode)> {
        self.ended.lock().ok().and_then(|ended| *ended)
    }

    /// How often handle_ended fired; more than once is a bug.
    pub fn ended_count(&self) -> u32 {
        self.ended_count.load(Ordering::Relaxed)
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for SimPlatform {
    fn handle_update(&self, _call_id: CallId, state: CallState) {
        if let Ok(mut updates) = self.state_updates.lock() {
            updates.push(state);
        }
    }

    fn handle_ended(&self, _call_id: CallId, party: CallParty, reason: CallErrorCode) {
        self.ended_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut ended) = self.ended.lock() {
            if ended.is_none() {
                *ended = Some((party, reason));
            }
        }
    }

    fn send_signaling_message(&mut self, _call_id: CallId, message: Message) -> Result<()> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(SimError::InjectedFailure("send_signaling_message").into());
        }
        self.sent_messages.lock()?.push(message);
        Ok(())
    }
}
