//! In-memory kernel and service used by the unit tests.
//!
//! `RecordingKernel` keeps just enough state to behave like the real thing
//! for this crate: which paths exist, which loop devices are attached, what
//! is mounted and where the process root is. Every call is logged, and any
//! call can be made to fail with a chosen errno.

use super::error::{BootError, Result};
use super::kernel::{Kernel, LoopInfo64, OpenMode};
use super::service::{ServiceAction, ServiceControl};
use nix::errno::Errno;
use nix::mount::MsFlags;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// A recorded kernel call, keyed by the path it acted on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    Open(PathBuf),
    Mknod(PathBuf),
    SetFd(PathBuf),
    SetStatus(PathBuf),
    ClrFd(PathBuf),
    Unlink(PathBuf),
    Mkdir(PathBuf),
    Mount(PathBuf),
    Umount(PathBuf),
    Chroot(PathBuf),
    Fchdir(PathBuf),
}

#[derive(Debug)]
pub(crate) struct MockHandle {
    path: PathBuf,
}

struct Model {
    files: BTreeSet<PathBuf>,
    attached: BTreeMap<PathBuf, PathBuf>,
    loop_names: BTreeMap<PathBuf, Vec<u8>>,
    mounts: Vec<PathBuf>,
    root: PathBuf,
    cwd: PathBuf,
    calls: Vec<Call>,
    failures: HashMap<Call, (Errno, bool)>,
}

pub(crate) struct RecordingKernel {
    model: RefCell<Model>,
}

impl RecordingKernel {
    pub(crate) fn new() -> Self {
        let mut files = BTreeSet::new();
        files.insert(PathBuf::from("/"));
        Self {
            model: RefCell::new(Model {
                files,
                attached: BTreeMap::new(),
                loop_names: BTreeMap::new(),
                mounts: Vec::new(),
                root: PathBuf::from("/"),
                cwd: PathBuf::from("/"),
                calls: Vec::new(),
                failures: HashMap::new(),
            }),
        }
    }

    pub(crate) fn add_file(&self, path: impl AsRef<Path>) {
        self.model
            .borrow_mut()
            .files
            .insert(path.as_ref().to_path_buf());
    }

    pub(crate) fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.model.borrow().files.contains(path.as_ref())
    }

    /// Makes every matching call fail with `errno`.
    pub(crate) fn fail(&self, call: Call, errno: Errno) {
        self.model.borrow_mut().failures.insert(call, (errno, false));
    }

    /// Makes the next matching call fail with `errno`.
    pub(crate) fn fail_once(&self, call: Call, errno: Errno) {
        self.model.borrow_mut().failures.insert(call, (errno, true));
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.model.borrow().calls.clone()
    }

    pub(crate) fn calls_matching(&self, pred: impl Fn(&Call) -> bool) -> Vec<Call> {
        self.model
            .borrow()
            .calls
            .iter()
            .filter(|c| pred(c))
            .cloned()
            .collect()
    }

    pub(crate) fn attached(&self, device: impl AsRef<Path>) -> Option<PathBuf> {
        self.model.borrow().attached.get(device.as_ref()).cloned()
    }

    pub(crate) fn loop_name(&self, device: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.model.borrow().loop_names.get(device.as_ref()).cloned()
    }

    pub(crate) fn mounts(&self) -> Vec<PathBuf> {
        self.model.borrow().mounts.clone()
    }

    pub(crate) fn root(&self) -> PathBuf {
        self.model.borrow().root.clone()
    }

    fn record(&self, call: Call) -> nix::Result<()> {
        let mut model = self.model.borrow_mut();
        model.calls.push(call.clone());
        match model.failures.get(&call).copied() {
            Some((errno, once)) => {
                if once {
                    model.failures.remove(&call);
                }
                Err(errno)
            }
            None => Ok(()),
        }
    }
}

impl Kernel for RecordingKernel {
    type Handle = MockHandle;

    fn open(&self, path: &Path, _mode: OpenMode) -> nix::Result<MockHandle> {
        self.record(Call::Open(path.to_path_buf()))?;
        if self.exists(path) {
            Ok(MockHandle {
                path: path.to_path_buf(),
            })
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn mknod_block(&self, path: &Path, _major: u64, _minor: u64, _perm: u32) -> nix::Result<()> {
        self.record(Call::Mknod(path.to_path_buf()))?;
        if !self.model.borrow_mut().files.insert(path.to_path_buf()) {
            return Err(Errno::EEXIST);
        }
        Ok(())
    }

    fn loop_set_fd(&self, device: &MockHandle, image: &MockHandle) -> nix::Result<()> {
        self.record(Call::SetFd(device.path.clone()))?;
        let mut model = self.model.borrow_mut();
        if model.attached.contains_key(&device.path) {
            return Err(Errno::EBUSY);
        }
        model
            .attached
            .insert(device.path.clone(), image.path.clone());
        Ok(())
    }

    fn loop_set_status(&self, device: &MockHandle, info: &LoopInfo64) -> nix::Result<()> {
        self.record(Call::SetStatus(device.path.clone()))?;
        let mut model = self.model.borrow_mut();
        if !model.attached.contains_key(&device.path) {
            return Err(Errno::ENXIO);
        }
        model
            .loop_names
            .insert(device.path.clone(), info.file_name().to_vec());
        Ok(())
    }

    fn loop_clr_fd(&self, device: &MockHandle) -> nix::Result<()> {
        self.record(Call::ClrFd(device.path.clone()))?;
        let mut model = self.model.borrow_mut();
        if model.attached.remove(&device.path).is_none() {
            return Err(Errno::ENXIO);
        }
        model.loop_names.remove(&device.path);
        Ok(())
    }

    fn unlink(&self, path: &Path) -> nix::Result<()> {
        self.record(Call::Unlink(path.to_path_buf()))?;
        if !self.model.borrow_mut().files.remove(path) {
            return Err(Errno::ENOENT);
        }
        Ok(())
    }

    fn mkdir(&self, path: &Path, _perm: u32) -> nix::Result<()> {
        self.record(Call::Mkdir(path.to_path_buf()))?;
        if !self.model.borrow_mut().files.insert(path.to_path_buf()) {
            return Err(Errno::EEXIST);
        }
        Ok(())
    }

    fn mount(
        &self,
        _source: Option<&Path>,
        target: &Path,
        _fstype: Option<&str>,
        _flags: MsFlags,
    ) -> nix::Result<()> {
        self.record(Call::Mount(target.to_path_buf()))?;
        let mut model = self.model.borrow_mut();
        if model.mounts.iter().any(|m| m == target) {
            return Err(Errno::EBUSY);
        }
        model.mounts.push(target.to_path_buf());
        Ok(())
    }

    fn umount(&self, target: &Path) -> nix::Result<()> {
        self.record(Call::Umount(target.to_path_buf()))?;
        let mut model = self.model.borrow_mut();
        match model.mounts.iter().position(|m| m == target) {
            Some(index) => {
                model.mounts.remove(index);
                Ok(())
            }
            None => Err(Errno::EINVAL),
        }
    }

    fn chroot(&self, path: &Path) -> nix::Result<()> {
        self.record(Call::Chroot(path.to_path_buf()))?;
        let mut model = self.model.borrow_mut();
        model.root = if path == Path::new(".") {
            model.cwd.clone()
        } else {
            path.to_path_buf()
        };
        Ok(())
    }

    fn fchdir(&self, dir: &MockHandle) -> nix::Result<()> {
        self.record(Call::Fchdir(dir.path.clone()))?;
        self.model.borrow_mut().cwd = dir.path.clone();
        Ok(())
    }
}

/// Service double remembering each action and the process root it ran under.
pub(crate) struct RecordingService<'k> {
    kernel: &'k RecordingKernel,
    actions: RefCell<Vec<ServiceAction>>,
    roots: RefCell<Vec<PathBuf>>,
    failing: bool,
}

impl<'k> RecordingService<'k> {
    pub(crate) fn new(kernel: &'k RecordingKernel) -> Self {
        Self {
            kernel,
            actions: RefCell::new(Vec::new()),
            roots: RefCell::new(Vec::new()),
            failing: false,
        }
    }

    pub(crate) fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub(crate) fn actions(&self) -> Vec<ServiceAction> {
        self.actions.borrow().clone()
    }

    pub(crate) fn roots(&self) -> Vec<PathBuf> {
        self.roots.borrow().clone()
    }
}

impl ServiceControl for RecordingService<'_> {
    fn invoke(&self, action: ServiceAction) -> Result<()> {
        self.actions.borrow_mut().push(action);
        self.roots.borrow_mut().push(self.kernel.root());
        if self.failing {
            return Err(BootError::ServiceFailed {
                action: action.to_string(),
                reason: "exited with status 1".to_string(),
            });
        }
        Ok(())
    }
}
