//! Loop device binding.
//!
//! Exposes the disk image as a block device so it can be mounted. The node
//! itself is created on demand with a fixed major/minor pair; a node left
//! behind by an earlier run is simply reused.

use super::constants::{LOOP_MAJOR, LOOP_MINOR, LOOP_NODE_PERMISSION};
use super::error::{Acquired, BootError, Result, Stage};
use super::kernel::{Kernel, LoopInfo64, OpenMode};
use super::undo::{Undo, UndoStack};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use std::fs;
use std::path::Path;

/// What a successful [`LoopBinder::bind`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// The device node did not exist and was created by this call
    pub node_created: bool,
    /// Whether the image was attached now or was already attached
    pub attach: Acquired,
}

/// Binds a disk image to a loop device node and releases it again.
pub struct LoopBinder<'k, K: Kernel> {
    kernel: &'k K,
}

impl<'k, K: Kernel> LoopBinder<'k, K> {
    /// Creates a binder issuing its calls through `kernel`.
    pub fn new(kernel: &'k K) -> Self {
        Self { kernel }
    }

    /// Attaches `image` to the loop device at `device`.
    ///
    /// The image is opened read-write first, so a missing image fails before
    /// anything is created. The device node is created if absent. A device
    /// that already has an image attached (`EBUSY`) counts as bound.
    ///
    /// # Arguments
    ///
    /// * `device` - Path of the loop device node
    /// * `image` - Path of the disk image
    ///
    /// # Errors
    ///
    /// * `ResourceUnavailable` if the image or the device cannot be opened
    /// * `KernelOperationFailed` naming the failed step otherwise
    ///
    /// On error every descriptor opened by this call is closed, and a node
    /// or attachment made by this call is undone.
    pub fn bind(&self, device: &Path, image: &Path) -> Result<Binding> {
        info!("Binding {} to {}", image.display(), device.display());

        let image_handle = self.kernel.open(image, OpenMode::ReadWrite).map_err(|errno| {
            error!("Failed to open image {}: {}", image.display(), errno);
            BootError::ResourceUnavailable {
                stage: Stage::OpenImage,
                path: image.to_path_buf(),
                errno,
            }
        })?;

        let mut undo = UndoStack::new();
        let node_created = match self.kernel.mknod_block(
            device,
            LOOP_MAJOR,
            LOOP_MINOR,
            LOOP_NODE_PERMISSION,
        ) {
            Ok(()) => {
                debug!("Created loop node {}", device.display());
                undo.push(Undo::RemoveNode {
                    device: device.to_path_buf(),
                });
                true
            }
            Err(Errno::EEXIST) => {
                debug!("Reusing existing loop node {}", device.display());
                false
            }
            Err(errno) => {
                error!("Failed to create loop node {}: {}", device.display(), errno);
                return Err(BootError::kernel(Stage::CreateNode, errno));
            }
        };

        match self.attach(device, image, &image_handle, &mut undo) {
            Ok(attach) => Ok(Binding {
                node_created,
                attach,
            }),
            Err(err) => {
                let leftovers = undo.unwind(self.kernel);
                if !leftovers.is_empty() {
                    warn!(
                        "{} steps of the loop binding could not be rolled back",
                        leftovers.len()
                    );
                }
                Err(err)
            }
        }
    }

    fn attach(
        &self,
        device: &Path,
        image: &Path,
        image_handle: &K::Handle,
        undo: &mut UndoStack,
    ) -> Result<Acquired> {
        let device_handle = self
            .kernel
            .open(device, OpenMode::ReadWrite)
            .map_err(|errno| {
                error!("Failed to open loop device {}: {}", device.display(), errno);
                BootError::ResourceUnavailable {
                    stage: Stage::OpenDevice,
                    path: device.to_path_buf(),
                    errno,
                }
            })?;

        match self.kernel.loop_set_fd(&device_handle, image_handle) {
            Ok(()) => undo.push(Undo::DetachLoop {
                device: device.to_path_buf(),
            }),
            Err(Errno::EBUSY) => {
                info!("{} is already bound", device.display());
                return Ok(Acquired::AlreadyEstablished);
            }
            Err(errno) => {
                error!("LOOP_SET_FD failed on {}: {}", device.display(), errno);
                return Err(BootError::kernel(Stage::AttachImage, errno));
            }
        }

        let backing = fs::canonicalize(image).unwrap_or_else(|_| image.to_path_buf());
        let info = LoopInfo64::for_backing_file(&backing);
        self.kernel
            .loop_set_status(&device_handle, &info)
            .map_err(|errno| {
                error!("LOOP_SET_STATUS64 failed on {}: {}", device.display(), errno);
                BootError::kernel(Stage::SetStatus, errno)
            })?;

        Ok(Acquired::Established)
    }

    /// Detaches whatever image is attached to `device`.
    ///
    /// A missing node or an unbound device means there is nothing to detach;
    /// that is logged and reported as success.
    pub fn unbind(&self, device: &Path) -> Result<()> {
        info!("Clearing loop device {}", device.display());

        let handle = match self.kernel.open(device, OpenMode::ReadOnly) {
            Ok(handle) => handle,
            Err(Errno::ENOENT) => {
                warn!("{} does not exist, nothing to detach", device.display());
                return Ok(());
            }
            Err(errno) => {
                error!("Failed to open loop {}: {}", device.display(), errno);
                return Err(BootError::ResourceUnavailable {
                    stage: Stage::OpenDevice,
                    path: device.to_path_buf(),
                    errno,
                });
            }
        };

        let detached = self.kernel.loop_clr_fd(&handle);
        drop(handle);

        match detached {
            Ok(()) => Ok(()),
            Err(Errno::ENXIO) => {
                warn!("{} is not bound, nothing to detach", device.display());
                Ok(())
            }
            Err(errno) => {
                error!("LOOP_CLR_FD failed on {}: {}", device.display(), errno);
                Err(BootError::kernel(Stage::DetachImage, errno))
            }
        }
    }

    /// Removes the loop device node. A node that is already gone is fine.
    pub fn remove_node(&self, device: &Path) -> Result<()> {
        match self.kernel.unlink(device) {
            Ok(()) => {
                debug!("Removed loop node {}", device.display());
                Ok(())
            }
            Err(Errno::ENOENT) => {
                debug!("Loop node {} already removed", device.display());
                Ok(())
            }
            Err(errno) => {
                error!("Failed to remove {}: {}", device.display(), errno);
                Err(BootError::kernel(Stage::RemoveNode, errno))
            }
        }
    }
}
