//! Inbound command queue.
//!
//! A bounded [`tokio::sync::mpsc`] channel.  Any number of producers (an
//! operator console, a planner, a test) hold a cloneable [`CommandSender`];
//! the control loop owns the single [`CommandReceiver`] and drains it once
//! at the start of every cycle, in arrival order.

use rtjoint_types::{ControlCommand, ControlError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default number of commands that may be pending between two cycles.
pub const DEFAULT_CAPACITY: usize = 256;

/// Constructor namespace for the sender/receiver pair.
pub struct CommandQueue;

impl CommandQueue {
    /// Create a queue holding at most `capacity` pending commands (at least
    /// one).
    pub fn bounded(capacity: usize) -> (CommandSender, CommandReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (CommandSender { tx }, CommandReceiver { rx })
    }
}

/// Producer handle.  Cheap to clone.
#[derive(Clone, Debug)]
pub struct CommandSender {
    tx: mpsc::Sender<ControlCommand>,
}

impl CommandSender {
    /// Enqueue without waiting.  Fails when the queue is full or the control
    /// loop has gone away.
    pub fn try_send(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => ControlError::Channel("command queue is full".into()),
            TrySendError::Closed(_) => ControlError::Channel("control loop has stopped".into()),
        })
    }

    /// Enqueue, waiting for space if the queue is full.
    pub async fn send(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.tx
            .send(command)
            .await
            .map_err(|e| ControlError::Channel(format!("command queue closed: {e}")))
    }
}

/// Consumer handle, owned by the control loop.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<ControlCommand>,
}

impl CommandReceiver {
    /// Take every pending command without blocking, oldest first.
    pub fn drain(&mut self) -> Vec<ControlCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            commands.push(command);
        }
        commands
    }
}
