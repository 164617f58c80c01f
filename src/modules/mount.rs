//! The mount stack of the secondary root.
//!
//! Five mounts, always attempted in the same order:
//!
//! 1. the loop device on the target, as `ext2`
//! 2. `devpts` on `<target>/dev/pts`
//! 3. `proc` on `<target>/proc`
//! 4. `sysfs` on `<target>/sys`
//! 5. the host `/system` bound onto `<target>/system`
//!
//! and released in exactly the reverse order.

use super::constants::{BIND_TARGET_PERMISSION, HOST_BIND_SOURCE, ROOT_FSTYPE};
use super::error::{Acquired, BootError, Result, Stage, StageFailure};
use super::kernel::Kernel;
use super::undo::{Undo, UndoStack};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::mount::MsFlags;
use std::path::{Path, PathBuf};

/// One entry of the mount stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Device, pseudo-filesystem name or bind source
    pub source: PathBuf,
    /// Absolute mount point
    pub target: PathBuf,
    /// Filesystem type, `None` for the bind mount
    pub fstype: Option<&'static str>,
    /// Mount flags
    pub flags: MsFlags,
    /// The step this mount is reported as
    pub stage: Stage,
}

/// Mounts and unmounts the fixed stack for one image and one target.
pub struct MountStack<'k, K: Kernel> {
    kernel: &'k K,
    points: Vec<MountPoint>,
}

impl<'k, K: Kernel> MountStack<'k, K> {
    /// Builds the stack mounting `root` (the loop device) at `target`.
    pub fn new(kernel: &'k K, root: &Path, target: &Path) -> Self {
        let pseudo = |name: &'static str, dir: &str, stage: Stage| MountPoint {
            source: PathBuf::from(name),
            target: target.join(dir),
            fstype: Some(name),
            flags: MsFlags::MS_SILENT,
            stage,
        };

        let points = vec![
            MountPoint {
                source: root.to_path_buf(),
                target: target.to_path_buf(),
                fstype: Some(ROOT_FSTYPE),
                flags: MsFlags::MS_SILENT,
                stage: Stage::MountRoot,
            },
            pseudo("devpts", "dev/pts", Stage::MountPts),
            pseudo("proc", "proc", Stage::MountProc),
            pseudo("sysfs", "sys", Stage::MountSysfs),
            MountPoint {
                source: PathBuf::from(HOST_BIND_SOURCE),
                target: target.join("system"),
                fstype: None,
                flags: MsFlags::MS_BIND,
                stage: Stage::MountBind,
            },
        ];

        Self { kernel, points }
    }

    /// The mounts in forward order.
    pub fn points(&self) -> &[MountPoint] {
        &self.points
    }

    /// Mounts every entry in order.
    ///
    /// A mount point that is already busy counts as mounted, which makes a
    /// second run against a set-up tree harmless. Any other failure unmounts
    /// everything this call got through so far, newest first, and returns the
    /// originating error.
    ///
    /// # Returns
    ///
    /// * `Ok(Acquired::Established)` if at least one mount was made
    /// * `Ok(Acquired::AlreadyEstablished)` if everything was already mounted
    pub fn mount_all(&self) -> Result<Acquired> {
        let mut undo = UndoStack::new();
        let mut outcome = Acquired::AlreadyEstablished;

        for point in &self.points {
            if point.stage == Stage::MountBind {
                self.ensure_bind_target(&point.target);
            }

            match self.kernel.mount(
                Some(point.source.as_path()),
                &point.target,
                point.fstype,
                point.flags,
            ) {
                Ok(()) => {
                    info!(
                        "Mounted {} on {}",
                        point.source.display(),
                        point.target.display()
                    );
                    outcome = Acquired::Established;
                }
                Err(Errno::EBUSY) => {
                    info!("{} is already mounted", point.target.display());
                }
                Err(errno) => {
                    error!("{} failed on {}: {}", point.stage, point.target.display(), errno);
                    let leftovers = undo.unwind(self.kernel);
                    if !leftovers.is_empty() {
                        warn!("{} mounts could not be rolled back", leftovers.len());
                    }
                    return Err(BootError::kernel(point.stage, errno));
                }
            }

            undo.push(Undo::Unmount {
                target: point.target.clone(),
                stage: point.stage,
            });
        }

        Ok(outcome)
    }

    fn ensure_bind_target(&self, dir: &Path) {
        match self.kernel.mkdir(dir, BIND_TARGET_PERMISSION) {
            Ok(()) => debug!("Created {}", dir.display()),
            Err(Errno::EEXIST) => {}
            Err(errno) => warn!("Failed to create {}: {}", dir.display(), errno),
        }
    }

    /// Unmounts every entry, newest first.
    ///
    /// Each unmount is attempted regardless of what happened to the others.
    /// Targets that are not mounted are skipped quietly.
    ///
    /// # Errors
    ///
    /// `TeardownPartialFailure` listing every unmount that failed.
    pub fn unmount_all(&self) -> Result<()> {
        let mut failures = Vec::new();

        for point in self.points.iter().rev() {
            match self.kernel.umount(&point.target) {
                Ok(()) => info!("Unmounted {}", point.target.display()),
                Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                    debug!("{} is not mounted", point.target.display());
                }
                Err(errno) => {
                    error!("umount failed {}: {}", point.target.display(), errno);
                    failures.push(StageFailure {
                        stage: Stage::Unmount,
                        errno,
                    });
                }
            }
        }

        BootError::teardown(failures)
    }
}
