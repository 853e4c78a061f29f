//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A virtual clock.  Timeouts only fire when a test advances time, in
//! deadline order, with ties broken by creation order.  Callbacks may
//! schedule further timeouts while an advance is running.

use std::sync::Arc;
use std::time::Duration;

use crate::common::timer::{TimeoutCreator, TimeoutHandle};
use crate::core::call_mutex::CallMutex;

struct PendingTimeout {
    deadline: Duration,
    seq: u64,
    run: Box<dyn FnOnce() + Send>,
    handle: TimeoutHandle,
}

#[derive(Default)]
struct FakeClockInner {
    now: Duration,
    next_seq: u64,
    pending: Vec<PendingTimeout>,
}

#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<CallMutex<FakeClockInner>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CallMutex::new(FakeClockInner::default(), "fake_clock")),
        }
    }

    pub fn now(&self) -> Duration {
        self.inner.lock().map(|inner| inner.now).unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.pending.len())
            .unwrap_or(0)
    }

    /// Moves time forward, firing every timeout that comes due along
    /// the way.  Each callback runs with the clock set to its own
    /// deadline, so cascaded timeouts land where they should.
    pub fn advance(&self, delta: Duration) {
        let target = match self.inner.lock() {
            Ok(inner) => inner.now + delta,
            Err(_) => return,
        };
        loop {
            let due = {
                let Ok(mut inner) = self.inner.lock() else {
                    return;
                };
                let next_index = inner
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, timeout)| timeout.deadline <= target)
                    .min_by_key(|(_, timeout)| (timeout.deadline, timeout.seq))
                    .map(|(index, _)| index);
                match next_index {
                    Some(index) => {
                        let timeout = inner.pending.remove(index);
                        inner.now = inner.now.max(timeout.deadline);
                        timeout
                    }
                    None => {
                        inner.now = target;
                        return;
                    }
                }
            };
            if !due.handle.is_aborted() {
                (due.run)();
            }
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutCreator for FakeClock {
    fn create_timeout(&self, delay: Duration, run: Box<dyn FnOnce() + Send>) -> TimeoutHandle {
        let handle = TimeoutHandle::new();
        if let Ok(mut inner) = self.inner.lock() {
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let deadline = inner.now + delay;
            inner.pending.push(PendingTimeout {
                deadline,
                seq,
                run,
                handle: handle.clone(),
            });
        }
        handle
    }
}
