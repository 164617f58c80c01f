//! Service control.
//!
//! The lifecycle only needs something it can ask to start or stop the
//! service once the host root is back. [`InitScript`] runs the image's init
//! script through the host `chroot` program.

use super::constants::{SERVICE_LAUNCHER, SERVICE_SCRIPT};
use super::error::{BootError, Result};
use log::{error, info};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// What to ask of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    /// Start the daemon
    Start,
    /// Stop the daemon
    Stop,
}

impl ServiceAction {
    /// The init-script verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Starts and stops the service living in the secondary root.
pub trait ServiceControl {
    /// Runs `action` once.
    fn invoke(&self, action: ServiceAction) -> Result<()>;
}

/// Runs `<launcher> <root> <script> <action>`.
#[derive(Debug, Clone)]
pub struct InitScript {
    launcher: PathBuf,
    root: PathBuf,
    script: PathBuf,
}

impl InitScript {
    /// The SSH init script of the image mounted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            launcher: PathBuf::from(SERVICE_LAUNCHER),
            root: root.to_path_buf(),
            script: PathBuf::from(SERVICE_SCRIPT),
        }
    }

    /// Replaces the program used to enter `root`.
    pub fn with_launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
        self.launcher = launcher.into();
        self
    }

    fn command(&self, action: ServiceAction) -> Command {
        let mut command = Command::new(&self.launcher);
        command
            .arg(&self.root)
            .arg(&self.script)
            .arg(action.as_str());
        command
    }
}

impl ServiceControl for InitScript {
    fn invoke(&self, action: ServiceAction) -> Result<()> {
        info!("Running {} {}...", self.script.display(), action);

        let status = self.command(action).status().map_err(|e| {
            error!("Failed to launch {}: {}", self.launcher.display(), e);
            BootError::ServiceFailed {
                action: action.to_string(),
                reason: e.to_string(),
            }
        })?;

        if status.success() {
            Ok(())
        } else {
            error!("ssh {} failed: {}", action, status);
            Err(BootError::ServiceFailed {
                action: action.to_string(),
                reason: format!("exited with {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_command_line() {
        let script = InitScript::new(Path::new("/data/local/mnt"));
        let command = script.command(ServiceAction::Start);

        assert_eq!(command.get_program(), OsStr::new("chroot"));
        let args: Vec<&OsStr> = command.get_args().collect();
        assert_eq!(
            args,
            vec![
                OsStr::new("/data/local/mnt"),
                OsStr::new("/etc/init.d/ssh"),
                OsStr::new("start"),
            ]
        );
    }

    #[test]
    fn test_successful_invoke() {
        let script = InitScript::new(Path::new("/data/local/mnt")).with_launcher("true");
        assert!(script.invoke(ServiceAction::Stop).is_ok());
    }

    #[test]
    fn test_failing_script() {
        let script = InitScript::new(Path::new("/data/local/mnt")).with_launcher("false");
        let err = script.invoke(ServiceAction::Start).unwrap_err();
        assert!(matches!(err, BootError::ServiceFailed { ref action, .. } if action == "start"));
    }

    #[test]
    fn test_missing_launcher() {
        let script = InitScript::new(Path::new("/data/local/mnt"))
            .with_launcher("/nonexistent/debroot-launcher");
        assert!(script.invoke(ServiceAction::Start).is_err());
    }
}
