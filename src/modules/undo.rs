//! Compensating actions for partially completed setup.
//!
//! Each acquisition that succeeds pushes the record that reverses it. When a
//! later step fails, [`UndoStack::unwind`] replays the records newest first,
//! so resources are released in exactly the reverse of the order they were
//! taken. Unwinding never stops early: a failed undo is logged and the next
//! one still runs.

use super::error::{Stage, StageFailure};
use super::kernel::{Kernel, OpenMode};
use log::{debug, error};
use std::path::PathBuf;

/// A single compensating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    /// Unmount `target`, established by `stage`
    Unmount {
        /// Mount point to release
        target: PathBuf,
        /// The mount step this reverses
        stage: Stage,
    },
    /// Detach the image from a loop device
    DetachLoop {
        /// Loop device node
        device: PathBuf,
    },
    /// Remove a loop device node created during setup
    RemoveNode {
        /// Loop device node
        device: PathBuf,
    },
}

impl Undo {
    fn run<K: Kernel>(&self, kernel: &K) -> Result<(), StageFailure> {
        match self {
            Undo::Unmount { target, stage } => {
                debug!("Undo {}: unmounting {}", stage, target.display());
                kernel.umount(target).map_err(|errno| StageFailure {
                    stage: Stage::Unmount,
                    errno,
                })
            }
            Undo::DetachLoop { device } => {
                debug!("Undo: detaching {}", device.display());
                let handle = kernel
                    .open(device, OpenMode::ReadOnly)
                    .map_err(|errno| StageFailure {
                        stage: Stage::OpenDevice,
                        errno,
                    })?;
                kernel.loop_clr_fd(&handle).map_err(|errno| StageFailure {
                    stage: Stage::DetachImage,
                    errno,
                })
            }
            Undo::RemoveNode { device } => {
                debug!("Undo: removing {}", device.display());
                kernel.unlink(device).map_err(|errno| StageFailure {
                    stage: Stage::RemoveNode,
                    errno,
                })
            }
        }
    }
}

/// Stack of compensating actions, unwound in LIFO order.
#[derive(Debug, Default)]
pub struct UndoStack {
    actions: Vec<Undo>,
}

impl UndoStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the action that reverses a step that just succeeded.
    pub fn push(&mut self, action: Undo) {
        self.actions.push(action);
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether there is nothing to undo.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every pending action, newest first, and empties the stack.
    ///
    /// # Returns
    ///
    /// The failures encountered, in the order the actions ran. An empty
    /// vector means everything was released.
    pub fn unwind<K: Kernel>(&mut self, kernel: &K) -> Vec<StageFailure> {
        let mut failures = Vec::new();
        while let Some(action) = self.actions.pop() {
            if let Err(failure) = action.run(kernel) {
                error!("Rollback step failed: {}", failure);
                failures.push(failure);
            }
        }
        failures
    }
}
