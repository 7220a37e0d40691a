//! Correlation of asynchronous responses with blocked callers.
//!
//! Each command id has at most one live entry: a sender half of a one-slot
//! channel. Registering replaces the previous sender, so a response is always
//! delivered to the newest waiter for that id. The reader thread completes
//! entries by id; a waiter that is not completed in time gives up with
//! [`WaitOutcome::TimedOut`].

use std::collections::HashMap;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use log::warn;

use crate::command::{CommandId, DeviceError};

/// How a wait for a response ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The matching response arrived
    Completed,
    /// The reader answered with an error status
    Rejected(DeviceError),
    /// Nothing arrived within the window
    TimedOut,
    /// The entry was replaced by a newer request or the table was cleared
    Superseded,
}

impl WaitOutcome {
    pub fn is_completed(self) -> bool {
        self == WaitOutcome::Completed
    }
}

#[derive(Debug, Default)]
pub struct PendingCommands {
    entries: HashMap<CommandId, Sender<WaitOutcome>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh wait for `id`. Register before sending the request so a
    /// fast response cannot be missed.
    pub fn register(&mut self, id: CommandId) -> Waiter {
        let (tx, rx) = channel::bounded(1);
        self.entries.insert(id, tx);
        Waiter { id, rx }
    }

    /// Wake the waiter for `id`; returns false when nobody is waiting
    pub fn complete(&self, id: CommandId) -> bool {
        self.signal(id, WaitOutcome::Completed)
    }

    /// Wake the waiter for `id` with the error the reader answered
    pub fn reject(&self, id: CommandId, err: DeviceError) -> bool {
        self.signal(id, WaitOutcome::Rejected(err))
    }

    fn signal(&self, id: CommandId, outcome: WaitOutcome) -> bool {
        match self.entries.get(&id) {
            Some(tx) => tx.try_send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, id: CommandId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Release every waiter with [`WaitOutcome::Superseded`]
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Receiving half of one registered wait
#[derive(Debug)]
pub struct Waiter {
    id: CommandId,
    rx: Receiver<WaitOutcome>,
}

impl Waiter {
    /// Block until the response arrives or `timeout` elapses
    pub fn wait(self, timeout: Duration) -> WaitOutcome {
        crossbeam::select! {
            recv(self.rx) -> msg => msg.unwrap_or(WaitOutcome::Superseded),
            recv(channel::after(timeout)) -> _ => {
                warn!("\"{}\" is locked", self.id);
                WaitOutcome::TimedOut
            }
        }
    }
}
