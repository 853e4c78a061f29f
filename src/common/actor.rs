//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A minimal actor: a worker thread owning a `State`, fed with
//! serialized `FnOnce(&mut State)` tasks.  Everything a call mutates
//! runs on its actor thread, so tasks never interleave and every task
//! sees the state its predecessors left behind.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, Sender},
    Arc, Mutex,
};
use std::thread;

use crate::common::Result;
use crate::error::PeerCallError;

type Task<State> = Box<dyn FnOnce(&mut State) + Send>;

pub struct Actor<State> {
    sender: Sender<Task<State>>,
    stopped: Arc<AtomicBool>,
    stopper: Stopper,
}

impl<State: 'static> Actor<State> {
    /// Spawns the actor thread and constructs the state on it.  Blocks
    /// until the state constructor has run; its error, if any, is
    /// returned here and the thread exits.
    pub fn start(
        stopper: Stopper,
        gen_state: impl FnOnce(Actor<State>) -> Result<State> + Send + 'static,
    ) -> Result<Self> {
        let (sender, receiver) = channel::<Task<State>>();
        let (started_sender, started_receiver) = channel::<Result<()>>();

        let stopped = Arc::new(AtomicBool::new(false));
        let actor = Self {
            sender,
            stopped: stopped.clone(),
            stopper: stopper.clone(),
        };

        let actor_for_thread = actor.clone();
        let stopped_for_thread = stopped.clone();
        let join_handle = thread::spawn(move || {
            let mut state = match gen_state(actor_for_thread) {
                Ok(state) => {
                    let _ = started_sender.send(Ok(()));
                    state
                }
                Err(e) => {
                    let _ = started_sender.send(Err(e));
                    return;
                }
            };
            while let Ok(task) = receiver.recv() {
                // Checked before running so a stop can cut ahead of
                // anything still queued.
                if stopped_for_thread.load(Ordering::Relaxed) {
                    break;
                }
                task(&mut state);
            }
        });

        stopper.register(Box::new(actor.clone()), join_handle);
        match started_receiver.recv() {
            Ok(result) => result?,
            Err(_) => return Err(PeerCallError::ActorExited.into()),
        }
        Ok(actor)
    }

    /// Enqueues a task.  Silently dropped once the actor has stopped.
    pub fn send(&self, run: impl FnOnce(&mut State) + Send + 'static) {
        let _ = self.sender.send(Box::new(run));
    }

    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }
}

impl<State> Clone for Actor<State> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
            stopper: self.stopper.clone(),
        }
    }
}

trait Stop: Send {
    fn stop(&self);
}

impl<State: 'static> Stop for Actor<State> {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        // An empty task kicks the loop in case it is blocked on recv.
        let _ = self.sender.send(Box::new(|_state| {}));
    }
}

/// Stops every actor registered with it, once.  One stopper can be
/// shared by several actors so a single call shuts them all down.
#[derive(Clone, Default)]
pub struct Stopper {
    actors: Arc<Mutex<Vec<(Box<dyn Stop>, thread::JoinHandle<()>)>>>,
}

impl Stopper {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, actor: Box<dyn Stop>, join_handle: thread::JoinHandle<()>) {
        if let Ok(mut actors) = self.actors.lock() {
            actors.push((actor, join_handle));
        }
    }

    /// Stops all registered actors and waits for their threads to end.
    pub fn stop_all_and_join(&self) {
        let drained = match self.actors.lock() {
            Ok(mut actors) => actors.drain(..).collect::<Vec<_>>(),
            Err(_) => return,
        };
        for (actor, join_handle) in drained {
            actor.stop();
            let _ = join_handle.join();
        }
    }
}
