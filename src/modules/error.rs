//! Error types for the lifecycle.
//!
//! Every failure names the [`Stage`] it happened in together with the errno
//! the kernel returned, so a log line is enough to tell which resource leaked.

use nix::errno::Errno;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single step of setup or teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Opening the disk image read-write
    OpenImage,
    /// Creating the loop device node
    CreateNode,
    /// Opening the loop device node
    OpenDevice,
    /// `LOOP_SET_FD`
    AttachImage,
    /// `LOOP_SET_STATUS64`
    SetStatus,
    /// `LOOP_CLR_FD`
    DetachImage,
    /// Removing the loop device node
    RemoveNode,
    /// Creating the mount target directory
    CreateMountTarget,
    /// Mounting the image on the target
    MountRoot,
    /// Mounting devpts on `<target>/dev/pts`
    MountPts,
    /// Mounting proc on `<target>/proc`
    MountProc,
    /// Mounting sysfs on `<target>/sys`
    MountSysfs,
    /// Creating `<target>/system`
    CreateBindTarget,
    /// Bind-mounting the host `/system`
    MountBind,
    /// Unmounting one entry of the mount stack
    Unmount,
    /// Opening the host root before chrooting
    CaptureOrigin,
    /// `chroot(2)` into the mount target
    Chroot,
    /// `fchdir(2)` back to the host root
    RestoreCwd,
    /// `chroot(2)` back to the host root
    RestoreRoot,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::OpenImage => "open image",
            Stage::CreateNode => "create loop node",
            Stage::OpenDevice => "open loop device",
            Stage::AttachImage => "attach image",
            Stage::SetStatus => "set loop status",
            Stage::DetachImage => "detach image",
            Stage::RemoveNode => "remove loop node",
            Stage::CreateMountTarget => "create mount target",
            Stage::MountRoot => "mount root",
            Stage::MountPts => "mount devpts",
            Stage::MountProc => "mount proc",
            Stage::MountSysfs => "mount sysfs",
            Stage::CreateBindTarget => "create bind target",
            Stage::MountBind => "bind mount",
            Stage::Unmount => "unmount",
            Stage::CaptureOrigin => "capture origin",
            Stage::Chroot => "chroot",
            Stage::RestoreCwd => "restore cwd",
            Stage::RestoreRoot => "restore root",
        };
        f.write_str(name)
    }
}

/// A failed step recorded during best-effort teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageFailure {
    /// Step that failed
    pub stage: Stage,
    /// Errno returned by the kernel
    pub errno: Errno,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.errno)
    }
}

/// Errors surfaced by the loop binder, the mount stack, the chroot context
/// and the orchestrator.
#[derive(Debug, Error)]
pub enum BootError {
    /// The image or device could not be opened.
    #[error("{stage}: {} unavailable: {errno}", .path.display())]
    ResourceUnavailable {
        /// Step that tried to open the path
        stage: Stage,
        /// Path that could not be opened
        path: PathBuf,
        /// Errno returned by `open(2)`
        errno: Errno,
    },

    /// A mount, ioctl or chroot call failed for a reason other than
    /// "already exists" or "busy".
    #[error("{stage} failed: {errno}")]
    KernelOperationFailed {
        /// Step that failed
        stage: Stage,
        /// Errno returned by the kernel
        errno: Errno,
    },

    /// One or more best-effort teardown steps failed. All steps were still attempted.
    #[error("teardown incomplete: {}", join_failures(.failures))]
    TeardownPartialFailure {
        /// Every failed step, in the order it was attempted
        failures: Vec<StageFailure>,
    },

    /// The service-control collaborator reported an error.
    #[error("service {action} failed: {reason}")]
    ServiceFailed {
        /// Action that was requested
        action: String,
        /// What went wrong
        reason: String,
    },
}

impl BootError {
    /// The stage of the first failure carried by this error, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BootError::ResourceUnavailable { stage, .. }
            | BootError::KernelOperationFailed { stage, .. } => Some(*stage),
            BootError::TeardownPartialFailure { failures } => failures.first().map(|f| f.stage),
            BootError::ServiceFailed { .. } => None,
        }
    }

    /// The errno of the first failure carried by this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            BootError::ResourceUnavailable { errno, .. }
            | BootError::KernelOperationFailed { errno, .. } => Some(*errno),
            BootError::TeardownPartialFailure { failures } => failures.first().map(|f| f.errno),
            BootError::ServiceFailed { .. } => None,
        }
    }

    /// Flattens the error into the failed steps it stands for.
    pub fn into_failures(self) -> Vec<StageFailure> {
        match self {
            BootError::ResourceUnavailable { stage, errno, .. }
            | BootError::KernelOperationFailed { stage, errno } => vec![StageFailure { stage, errno }],
            BootError::TeardownPartialFailure { failures } => failures,
            BootError::ServiceFailed { .. } => Vec::new(),
        }
    }

    pub(crate) fn kernel(stage: Stage, errno: Errno) -> Self {
        BootError::KernelOperationFailed { stage, errno }
    }

    pub(crate) fn teardown(failures: Vec<StageFailure>) -> Result<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BootError::TeardownPartialFailure { failures })
        }
    }
}

fn join_failures(failures: &[StageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of an acquisition that succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The resource was set up by this call
    Established,
    /// The resource was already in place ("exists" / "busy") and was reused
    AlreadyEstablished,
}

impl Acquired {
    /// Combines two outcomes: established if either step did any work.
    pub fn and(self, other: Acquired) -> Acquired {
        match (self, other) {
            (Acquired::AlreadyEstablished, Acquired::AlreadyEstablished) => {
                Acquired::AlreadyEstablished
            }
            _ => Acquired::Established,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_is_reported() {
        let err = BootError::TeardownPartialFailure {
            failures: vec![
                StageFailure {
                    stage: Stage::Unmount,
                    errno: Errno::EBUSY,
                },
                StageFailure {
                    stage: Stage::DetachImage,
                    errno: Errno::EIO,
                },
            ],
        };
        assert_eq!(err.stage(), Some(Stage::Unmount));
        assert_eq!(err.errno(), Some(Errno::EBUSY));
        assert!(err.to_string().contains("detach image"));
    }

    #[test]
    fn test_acquired_and() {
        use Acquired::*;
        assert_eq!(AlreadyEstablished.and(AlreadyEstablished), AlreadyEstablished);
        assert_eq!(AlreadyEstablished.and(Established), Established);
        assert_eq!(Established.and(AlreadyEstablished), Established);
    }
}
