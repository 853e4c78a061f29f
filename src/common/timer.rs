//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Cancellable one-shot timeouts behind an abstract factory, so a call
//! can run against the wall clock in production and a virtual clock in
//! tests.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, RecvTimeoutError, Sender},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

/// Creates cancellable one-shot timeouts.  The callback fires once the
/// delay elapses, unless the handle was aborted first.
pub trait TimeoutCreator: Send + Sync {
    fn create_timeout(&self, delay: Duration, run: Box<dyn FnOnce() + Send>) -> TimeoutHandle;
}

/// Handle to a scheduled timeout.  Aborting is idempotent and racing
/// an abort against the deadline is safe: the callback runs at most
/// once, and never after `abort()` returned on the firing thread.
#[derive(Clone, Default)]
pub struct TimeoutHandle {
    aborted: Arc<AtomicBool>,
}

impl TimeoutHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

struct ScheduledTimeout {
    deadline: Instant,
    seq: u64,
    run: Box<dyn FnOnce() + Send>,
    handle: TimeoutHandle,
}

impl Ord for ScheduledTimeout {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the earliest deadline comes first in a BinaryHeap.
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq)).reverse()
    }
}

impl PartialOrd for ScheduledTimeout {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledTimeout {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledTimeout {}

enum TimerCommand {
    Schedule(ScheduledTimeout),
    Stop,
}

/// Wall-clock `TimeoutCreator`: a dedicated scheduler thread holding a
/// deadline heap.
pub struct TimerThread {
    sender: Sender<TimerCommand>,
}

impl TimerThread {
    pub fn new() -> Self {
        let (sender, receiver) = channel::<TimerCommand>();
        thread::spawn(move || {
            let mut heap = BinaryHeap::<ScheduledTimeout>::new();
            loop {
                let command = match heap.peek() {
                    None => match receiver.recv() {
                        Ok(command) => command,
                        Err(_) => break,
                    },
                    Some(next) => {
                        let wait = next.deadline.saturating_duration_since(Instant::now());
                        match receiver.recv_timeout(wait) {
                            Ok(command) => command,
                            Err(RecvTimeoutError::Timeout) => {
                                if let Some(due) = heap.pop() {
                                    if !due.handle.is_aborted() {
                                        (due.run)();
                                    }
                                }
                                continue;
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                };
                match command {
                    TimerCommand::Schedule(timeout) => heap.push(timeout),
                    TimerCommand::Stop => break,
                }
            }
            debug!("timer thread exiting, {} timeouts dropped", heap.len());
        });
        Self { sender }
    }

    pub fn stop(&self) {
        let _ = self.sender.send(TimerCommand::Stop);
    }
}

impl Default for TimerThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TimeoutCreator for TimerThread {
    fn create_timeout(&self, delay: Duration, run: Box<dyn FnOnce() + Send>) -> TimeoutHandle {
        let handle = TimeoutHandle::new();
        let scheduled = ScheduledTimeout {
            deadline: Instant::now() + delay,
            seq: 0,
            run,
            handle: handle.clone(),
        };
        // The heap breaks deadline ties by insertion order below, but a
        // wall-clock Instant is effectively unique already.
        let _ = self.sender.send(TimerCommand::Schedule(scheduled));
        handle
    }
}
