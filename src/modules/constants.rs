//! Fixed paths and kernel parameters.
//!
//! The lifecycle is not runtime-configurable: the device node, the image and
//! the mount target are baked in at compile time. Building with the `android`
//! feature selects the on-device layout.

use std::path::PathBuf;

/// Loop device node the image is bound to.
#[cfg(feature = "android")]
pub const LOOP_DEVICE: &str = "/dev/block/loop50";
/// Disk image holding the Debian root filesystem.
#[cfg(feature = "android")]
pub const IMAGE_PATH: &str = "/mnt/sdcard/debian/squeeze.img";
/// Directory the image is mounted on.
#[cfg(feature = "android")]
pub const MOUNT_TARGET: &str = "/data/local/mnt";

/// Loop device node the image is bound to.
#[cfg(not(feature = "android"))]
pub const LOOP_DEVICE: &str = "/dev/block/loop50";
/// Disk image holding the Debian root filesystem.
#[cfg(not(feature = "android"))]
pub const IMAGE_PATH: &str = "/var/lib/debroot/squeeze.img";
/// Directory the image is mounted on.
#[cfg(not(feature = "android"))]
pub const MOUNT_TARGET: &str = "/mnt/external";

/// Conventional block major for loop devices.
pub const LOOP_MAJOR: u64 = 7;
/// Minor number of our private loop node.
pub const LOOP_MINOR: u64 = 30;
/// Permission bits of a freshly created loop node.
pub const LOOP_NODE_PERMISSION: u32 = 0o666;
/// Size of the `lo_file_name` field in `loop_info64`.
pub const LO_NAME_SIZE: usize = 64;

/// Permission bits of the mount target when we have to create it.
pub const MOUNT_TARGET_PERMISSION: u32 = 0o755;
/// Permission bits of `<target>/system` when we have to create it.
pub const BIND_TARGET_PERMISSION: u32 = 0o755;
/// Filesystem type of the image.
pub const ROOT_FSTYPE: &str = "ext2";
/// Host directory bind-mounted into the image.
pub const HOST_BIND_SOURCE: &str = "/system";

/// Host program used to run the init script inside the mounted tree.
pub const SERVICE_LAUNCHER: &str = "chroot";
/// Init script of the SSH daemon, relative to the image root.
pub const SERVICE_SCRIPT: &str = "/etc/init.d/ssh";

/// The three paths the lifecycle operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePaths {
    /// Loop device node the image is bound to
    pub device: PathBuf,
    /// Disk image holding the secondary root filesystem
    pub image: PathBuf,
    /// Directory the image is mounted on and chrooted into
    pub mount_target: PathBuf,
}

impl Default for LifecyclePaths {
    fn default() -> Self {
        Self {
            device: PathBuf::from(LOOP_DEVICE),
            image: PathBuf::from(IMAGE_PATH),
            mount_target: PathBuf::from(MOUNT_TARGET),
        }
    }
}
