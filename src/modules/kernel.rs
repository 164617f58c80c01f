//! System call seam.
//!
//! Everything the lifecycle does to the host goes through the [`Kernel`]
//! trait: opening files, creating the loop node, the loop ioctls, mounts and
//! chroot. [`HostKernel`] issues the real calls through `nix`; tests swap in
//! an in-memory model so ordering and rollback can be checked without root.

use super::constants::LO_NAME_SIZE;
use nix::errno::Errno;
use nix::mount::{self, MsFlags};
use nix::sys::stat::{self, Mode, SFlag};
use nix::unistd;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;

mod ioctl {
    use super::{LoopInfo64, LOOP_CLR_FD, LOOP_SET_FD, LOOP_SET_STATUS64};

    nix::ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
    nix::ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
    nix::ioctl_write_ptr_bad!(loop_set_status64, LOOP_SET_STATUS64, LoopInfo64);
}

/// Access mode for [`Kernel::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `O_RDONLY`
    ReadOnly,
    /// `O_RDWR`
    ReadWrite,
}

/// Mirror of the kernel's `struct loop_info64`.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    /// Builds a zeroed status block whose file name is `backing`.
    ///
    /// The name is truncated to fit the fixed-size field and is always
    /// NUL terminated.
    pub fn for_backing_file(backing: &Path) -> Self {
        let mut info = Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        };
        let bytes = backing.as_os_str().as_bytes();
        let len = bytes.len().min(LO_NAME_SIZE - 1);
        info.lo_file_name[..len].copy_from_slice(&bytes[..len]);
        info
    }

    /// The backing file name stored in the status block.
    pub fn file_name(&self) -> &[u8] {
        let end = self
            .lo_file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LO_NAME_SIZE);
        &self.lo_file_name[..end]
    }
}

/// The system calls the lifecycle is built from.
///
/// Every call returns the raw errno on failure; callers decide which codes
/// mean "already there" and which are real failures.
pub trait Kernel {
    /// An open descriptor. Dropping it closes the descriptor.
    type Handle;

    /// Opens `path` with the given access mode.
    fn open(&self, path: &Path, mode: OpenMode) -> nix::Result<Self::Handle>;

    /// Creates a block-special node `path` with the given major/minor pair.
    fn mknod_block(&self, path: &Path, major: u64, minor: u64, perm: u32) -> nix::Result<()>;

    /// `LOOP_SET_FD`: attaches the open image to the open loop device.
    fn loop_set_fd(&self, device: &Self::Handle, image: &Self::Handle) -> nix::Result<()>;

    /// `LOOP_SET_STATUS64`: stores metadata on an attached loop device.
    fn loop_set_status(&self, device: &Self::Handle, info: &LoopInfo64) -> nix::Result<()>;

    /// `LOOP_CLR_FD`: detaches whatever is attached to the loop device.
    fn loop_clr_fd(&self, device: &Self::Handle) -> nix::Result<()>;

    /// Removes a file or device node.
    fn unlink(&self, path: &Path) -> nix::Result<()>;

    /// Creates a directory.
    fn mkdir(&self, path: &Path, perm: u32) -> nix::Result<()>;

    /// `mount(2)` without filesystem data.
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
    ) -> nix::Result<()>;

    /// `umount(2)`.
    fn umount(&self, target: &Path) -> nix::Result<()>;

    /// `chroot(2)`.
    fn chroot(&self, path: &Path) -> nix::Result<()>;

    /// `fchdir(2)` to an open directory.
    fn fchdir(&self, dir: &Self::Handle) -> nix::Result<()>;
}

/// The real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostKernel;

fn errno_of(err: io::Error) -> Errno {
    match err.raw_os_error() {
        Some(code) => Errno::from_i32(code),
        // std rejects paths with an interior NUL before reaching the kernel.
        None if err.kind() == io::ErrorKind::InvalidInput => Errno::EINVAL,
        None => Errno::EIO,
    }
}

impl Kernel for HostKernel {
    type Handle = File;

    fn open(&self, path: &Path, mode: OpenMode) -> nix::Result<File> {
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == OpenMode::ReadWrite {
            options.write(true);
        }
        options.open(path).map_err(errno_of)
    }

    fn mknod_block(&self, path: &Path, major: u64, minor: u64, perm: u32) -> nix::Result<()> {
        stat::mknod(
            path,
            SFlag::S_IFBLK,
            Mode::from_bits_truncate(perm as libc::mode_t),
            stat::makedev(major, minor),
        )
    }

    fn loop_set_fd(&self, device: &File, image: &File) -> nix::Result<()> {
        // SAFETY: both descriptors are owned by live `File`s for the whole call.
        unsafe { ioctl::loop_set_fd(device.as_raw_fd(), image.as_raw_fd()) }.map(drop)
    }

    fn loop_set_status(&self, device: &File, info: &LoopInfo64) -> nix::Result<()> {
        // SAFETY: `info` is a `repr(C)` loop_info64 that outlives the call.
        unsafe { ioctl::loop_set_status64(device.as_raw_fd(), info) }.map(drop)
    }

    fn loop_clr_fd(&self, device: &File) -> nix::Result<()> {
        // SAFETY: the descriptor is owned by a live `File`.
        unsafe { ioctl::loop_clr_fd(device.as_raw_fd()) }.map(drop)
    }

    fn unlink(&self, path: &Path) -> nix::Result<()> {
        unistd::unlink(path)
    }

    fn mkdir(&self, path: &Path, perm: u32) -> nix::Result<()> {
        unistd::mkdir(path, Mode::from_bits_truncate(perm as libc::mode_t))
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
    ) -> nix::Result<()> {
        mount::mount(source, target, fstype, flags, None::<&str>)
    }

    fn umount(&self, target: &Path) -> nix::Result<()> {
        mount::umount(target)
    }

    fn chroot(&self, path: &Path) -> nix::Result<()> {
        unistd::chroot(path)
    }

    fn fchdir(&self, dir: &File) -> nix::Result<()> {
        unistd::fchdir(dir.as_raw_fd())
    }
}
