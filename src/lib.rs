#![doc(html_root_url = "https://docs.rs/debroot/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! debroot: Bring up a Debian root filesystem from a disk image
//!
//! Attaches a disk image to a loop device, mounts it together with the
//! pseudo-filesystems a userland expects, chroots into it and back out, and
//! starts or stops the SSH daemon living inside.
//!
//! ## Features
//!
//! - Idempotent setup: running start twice binds and mounts nothing twice
//! - Full rollback when any setup step fails
//! - Maximal-effort teardown that reports every failed step
//! - A [`Kernel`] trait so the whole lifecycle can run against a fake
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use debroot::{HostKernel, InitScript, Lifecycle, LifecyclePaths, ServiceAction};
//!
//! # fn main() -> anyhow::Result<()> {
//! let kernel = HostKernel;
//! let paths = LifecyclePaths::default();
//! let service = InitScript::new(&paths.mount_target);
//!
//! let mut lifecycle = Lifecycle::new(&kernel, paths);
//! lifecycle.run(ServiceAction::Start, &service).into_result()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Mount Stack
//!
//! - the loop device on the mount target (`ext2`)
//! - `devpts` on `<target>/dev/pts`
//! - `proc` on `<target>/proc`
//! - `sysfs` on `<target>/sys`
//! - the host `/system` bound on `<target>/system`

pub mod modules;

pub use modules::chroot::ChrootContext;
pub use modules::constants::LifecyclePaths;
pub use modules::error::{Acquired, BootError, Stage, StageFailure};
pub use modules::kernel::{HostKernel, Kernel};
pub use modules::lifecycle::{Lifecycle, LifecycleResult, LifecycleState};
pub use modules::loop_device::LoopBinder;
pub use modules::mount::MountStack;
pub use modules::service::{InitScript, ServiceAction, ServiceControl};
