//! Entering and breaking out of the chroot.
//!
//! The host root is opened before anything is changed. That descriptor is the
//! only way back once the process root has moved, so it is held for the whole
//! run and used even when setup failed half way.

use super::error::{BootError, Result, Stage};
use super::kernel::{Kernel, OpenMode};
use log::{error, info};
use std::path::{Path, PathBuf};

/// A retained reference to the pre-chroot root plus the chroot target.
pub struct ChrootContext<'k, K: Kernel> {
    kernel: &'k K,
    origin: K::Handle,
    target: PathBuf,
}

impl<'k, K: Kernel> ChrootContext<'k, K> {
    /// Opens the current root directory.
    ///
    /// Must happen before any mount or chroot so the handle refers to the host root.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` if `/` cannot be opened.
    pub fn capture(kernel: &'k K, target: &Path) -> Result<Self> {
        let root = Path::new("/");
        let origin = kernel.open(root, OpenMode::ReadOnly).map_err(|errno| {
            error!("Failed to open / for reading: {}", errno);
            BootError::ResourceUnavailable {
                stage: Stage::CaptureOrigin,
                path: root.to_path_buf(),
                errno,
            }
        })?;

        Ok(Self {
            kernel,
            origin,
            target: target.to_path_buf(),
        })
    }

    /// The directory [`enter`](Self::enter) makes the process root.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Changes the process root to the target.
    ///
    /// On failure the process is still outside the chroot.
    pub fn enter(&self) -> Result<()> {
        info!("Trying chroot {}", self.target.display());
        self.kernel.chroot(&self.target).map_err(|errno| {
            error!("chrooting failed: {}", errno);
            BootError::kernel(Stage::Chroot, errno)
        })
    }

    /// Restores the host root: `fchdir` to the captured directory, then `chroot(".")`.
    ///
    /// Safe to call when [`enter`](Self::enter) never ran or failed.
    ///
    /// # Errors
    ///
    /// A failure here leaves the process root ambiguous. Callers report it and
    /// carry on with the remaining cleanup.
    pub fn leave(&self) -> Result<()> {
        self.kernel.fchdir(&self.origin).map_err(|errno| {
            error!("Failed to fchdir: {}", errno);
            BootError::kernel(Stage::RestoreCwd, errno)
        })?;

        self.kernel.chroot(Path::new(".")).map_err(|errno| {
            error!("Failed to escape out of chroot jail: {}", errno);
            BootError::kernel(Stage::RestoreRoot, errno)
        })?;

        info!("Back on the host root");
        Ok(())
    }
}
