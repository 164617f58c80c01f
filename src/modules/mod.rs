//! Core lifecycle modules.
//!
//! This module provides the building blocks of the secondary root:
//!
//! - `constants`: Device numbers, permissions and the default paths
//! - `error`: Error taxonomy and setup stages
//! - `kernel`: The system call seam and its host implementation
//! - `undo`: Compensating actions unwound on failure
//! - `loop_device`: Binding the disk image to a loop device
//! - `mount`: The ordered mount stack
//! - `chroot`: Entering and breaking out of the chroot
//! - `service`: Starting and stopping the SSH daemon
//! - `lifecycle`: The orchestrator tying it all together

pub mod chroot;
pub mod constants;
pub mod error;
pub mod kernel;
pub mod lifecycle;
pub mod loop_device;
pub mod mount;
pub mod service;
pub mod undo;

#[cfg(test)]
pub(crate) mod testing;
