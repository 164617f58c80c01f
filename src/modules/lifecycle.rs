//! Lifecycle orchestration.
//!
//! Composes the loop binder, the mount stack and the chroot context into
//! `enter` and `leave`, and runs the service action in between.
//!
//! Acquisition order is loop device, mounts, chroot. Release order is the
//! exact reverse, on the failure path as well as on the normal one.

use super::chroot::ChrootContext;
use super::constants::{LifecyclePaths, MOUNT_TARGET_PERMISSION};
use super::error::{Acquired, BootError, Result, Stage, StageFailure};
use super::kernel::Kernel;
use super::loop_device::LoopBinder;
use super::mount::MountStack;
use super::service::{ServiceAction, ServiceControl};
use super::undo::{Undo, UndoStack};
use log::{debug, error, info, warn};
use nix::errno::Errno;

/// Where the lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing held
    Idle,
    /// Image attached to the loop device
    LoopBound,
    /// Mount stack in place
    Mounted,
    /// Process root is the mount target
    Chrooted,
    /// The service action has run
    ServiceRan,
    /// Process root restored to the host root
    Unchrooted,
    /// Mount stack released
    Unmounted,
    /// Loop device detached
    LoopUnbound,
}

/// Overall outcome of [`Lifecycle::run`].
#[derive(Debug)]
pub enum LifecycleResult {
    /// Everything succeeded
    Success,
    /// Start found the environment already set up and left it as it was
    AlreadyInState,
    /// Something failed. Carries the first failure; every later step still ran.
    PartialFailure(BootError),
}

impl LifecycleResult {
    /// Whether the run completed without failures.
    pub fn is_success(&self) -> bool {
        !matches!(self, LifecycleResult::PartialFailure(_))
    }

    /// Converts into a `Result`, surfacing the first failure.
    pub fn into_result(self) -> Result<()> {
        match self {
            LifecycleResult::PartialFailure(err) => Err(err),
            _ => Ok(()),
        }
    }
}

/// Drives one image through setup and teardown.
pub struct Lifecycle<'k, K: Kernel> {
    kernel: &'k K,
    paths: LifecyclePaths,
    state: LifecycleState,
}

impl<'k, K: Kernel> Lifecycle<'k, K> {
    /// Creates an idle lifecycle for the given paths.
    ///
    /// # Arguments
    ///
    /// * `kernel` - System call implementation
    /// * `paths` - Loop device, image and mount target
    pub fn new(kernel: &'k K, paths: LifecyclePaths) -> Self {
        Self {
            kernel,
            paths,
            state: LifecycleState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The paths this lifecycle operates on.
    pub fn paths(&self) -> &LifecyclePaths {
        &self.paths
    }

    fn transition(&mut self, next: LifecycleState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn mount_stack(&self) -> MountStack<'k, K> {
        MountStack::new(self.kernel, &self.paths.device, &self.paths.mount_target)
    }

    /// Creates the mount target if it does not exist yet.
    ///
    /// Failure is only logged: the root mount reports it properly later on.
    pub fn prepare(&self) {
        let target = &self.paths.mount_target;
        match self.kernel.mkdir(target, MOUNT_TARGET_PERMISSION) {
            Ok(()) => debug!("Created {}", target.display()),
            Err(Errno::EEXIST) => {}
            Err(errno) => error!(
                "{} failed for {}: {}",
                Stage::CreateMountTarget,
                target.display(),
                errno
            ),
        }
    }

    /// Opens the host root so the process can always get back to it.
    pub fn capture_origin(&self) -> Result<ChrootContext<'k, K>> {
        ChrootContext::capture(self.kernel, &self.paths.mount_target)
    }

    /// Binds the loop device, mounts the stack and chroots into it.
    ///
    /// Resources that are already in place ("exists" / "busy") are reused, so
    /// entering an environment that is already set up is harmless and does
    /// not bind or mount anything twice.
    ///
    /// # Arguments
    ///
    /// * `origin` - Host root captured before any mutation
    ///
    /// # Returns
    ///
    /// * `Ok(Acquired::Established)` if anything had to be set up
    /// * `Ok(Acquired::AlreadyEstablished)` if everything was already in place
    ///
    /// # Errors
    ///
    /// The error of the failing step. Everything acquired before it has been
    /// released again, newest first, and the lifecycle is back to `Idle`.
    pub fn enter(&mut self, origin: &ChrootContext<'k, K>) -> Result<Acquired> {
        info!("Setting up {}", origin.target().display());
        let device = self.paths.device.clone();
        let mut undo = UndoStack::new();

        let binding = LoopBinder::new(self.kernel).bind(&device, &self.paths.image)?;
        if binding.node_created {
            undo.push(Undo::RemoveNode {
                device: device.clone(),
            });
        }
        undo.push(Undo::DetachLoop { device });
        self.transition(LifecycleState::LoopBound);

        let mounts = self.mount_stack();
        let mounted = match mounts.mount_all() {
            Ok(mounted) => mounted,
            Err(err) => {
                self.rollback(&mut undo);
                return Err(err);
            }
        };
        for point in mounts.points() {
            undo.push(Undo::Unmount {
                target: point.target.clone(),
                stage: point.stage,
            });
        }
        self.transition(LifecycleState::Mounted);

        if let Err(err) = origin.enter() {
            self.rollback(&mut undo);
            return Err(err);
        }
        self.transition(LifecycleState::Chrooted);

        Ok(binding.attach.and(mounted))
    }

    fn rollback(&mut self, undo: &mut UndoStack) {
        warn!("Rolling back {} setup steps", undo.len());
        let failures = undo.unwind(self.kernel);
        if !failures.is_empty() {
            error!("Rollback left {} resources behind", failures.len());
        }
        self.transition(LifecycleState::Idle);
    }

    /// Restores the host root from inside the chroot.
    ///
    /// Also harmless outside a chroot, so it is safe to call after a failed setup.
    pub fn break_jail(&mut self, origin: &ChrootContext<'k, K>) -> Result<()> {
        origin.leave()?;
        if self.state == LifecycleState::Chrooted {
            self.transition(LifecycleState::Unchrooted);
        }
        Ok(())
    }

    /// Full teardown: unmount the stack, detach the loop device, remove its node.
    ///
    /// Every step runs even if an earlier one failed.
    ///
    /// # Errors
    ///
    /// `TeardownPartialFailure` listing all failed steps, the first one first.
    pub fn leave(&mut self) -> Result<()> {
        info!("Tearing down {}", self.paths.mount_target.display());
        let mut failures: Vec<StageFailure> = Vec::new();
        let binder = LoopBinder::new(self.kernel);

        if let Err(err) = self.mount_stack().unmount_all() {
            failures.extend(err.into_failures());
        }
        self.transition(LifecycleState::Unmounted);

        if let Err(err) = binder.unbind(&self.paths.device) {
            error!("Loop detach failed: {}", err);
            failures.extend(err.into_failures());
        }
        self.transition(LifecycleState::LoopUnbound);

        if let Err(err) = binder.remove_node(&self.paths.device) {
            failures.extend(err.into_failures());
        }
        self.transition(LifecycleState::Idle);

        BootError::teardown(failures)
    }

    /// Runs one full command.
    ///
    /// * `Start`: enter, break out of the chroot, start the service if setup succeeded.
    /// * `Stop`: enter, break out of the chroot, stop the service unconditionally, tear down.
    ///
    /// The host root handle is held for the whole run and closed at the end.
    pub fn run<S: ServiceControl>(&mut self, action: ServiceAction, service: &S) -> LifecycleResult {
        self.prepare();

        let origin = match self.capture_origin() {
            Ok(origin) => origin,
            Err(err) => return LifecycleResult::PartialFailure(err),
        };

        let mut first_failure: Option<BootError> = None;
        let mut record = |err: BootError| {
            if first_failure.is_none() {
                first_failure = Some(err);
            }
        };

        let entered = self.enter(&origin);
        let already = matches!(entered, Ok(Acquired::AlreadyEstablished));
        let setup_ok = entered.is_ok();
        if let Err(err) = entered {
            error!("Setup failed: {}", err);
            record(err);
        }

        if let Err(err) = self.break_jail(&origin) {
            error!("Could not restore the host root: {}", err);
            record(err);
        }

        if setup_ok || action == ServiceAction::Stop {
            match service.invoke(action) {
                Ok(()) => self.transition(LifecycleState::ServiceRan),
                Err(err) => {
                    error!("ssh {} failed: {}", action, err);
                    record(err);
                }
            }
        } else {
            warn!("Not starting ssh, setup failed");
        }

        if action == ServiceAction::Stop {
            if let Err(err) = self.leave() {
                record(err);
            }
        }

        drop(origin);

        match first_failure {
            Some(err) => LifecycleResult::PartialFailure(err),
            None if already && action == ServiceAction::Start => LifecycleResult::AlreadyInState,
            None => LifecycleResult::Success,
        }
    }
}
