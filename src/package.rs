use crate::runner::{render_command, CommandRunner};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("failed to run `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with status {status_code}: {stderr}")]
    Failed {
        command: String,
        status_code: i32,
        stderr: String,
    },
}

impl PackageError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PackageError::Failed { status_code, .. } => Some(*status_code),
            PackageError::Launch { .. } => None,
        }
    }
}

/// What a bundle removal did: ran to completion, or was handed to a detached process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalHandle {
    Completed,
    Detached { pid: u32, log_path: PathBuf },
}

/// Per-user Flatpak installation.
pub struct PackageRuntime<'a, R: CommandRunner> {
    runner: &'a R,
    command: &'a str,
}

impl<'a, R: CommandRunner> PackageRuntime<'a, R> {
    pub fn new(runner: &'a R, command: &'a str) -> Self {
        Self { runner, command }
    }

    pub fn available(&self) -> bool {
        self.runner.locate(self.command).is_some()
    }

    fn exec(&self, args: Vec<String>) -> Result<(), PackageError> {
        let command = render_command(self.command, &args);
        let output = self
            .runner
            .run(self.command, &args)
            .map_err(|source| PackageError::Launch {
                command: command.clone(),
                source,
            })?;
        if !output.success() {
            return Err(PackageError::Failed {
                command,
                status_code: output.status_code,
                stderr: output.stderr_text(),
            });
        }
        Ok(())
    }

    /// No-op when the runtime is already installed.
    pub fn install_runtime(&self, remote: &str, runtime_ref: &str) -> Result<(), PackageError> {
        self.exec(vec![
            "install".to_string(),
            "--user".to_string(),
            "--noninteractive".to_string(),
            "--or-update".to_string(),
            remote.to_string(),
            runtime_ref.to_string(),
        ])
    }

    pub fn install_bundle(&self, bundle: &Path) -> Result<(), PackageError> {
        self.exec(vec![
            "install".to_string(),
            "--user".to_string(),
            "--noninteractive".to_string(),
            "--reinstall".to_string(),
            "--bundle".to_string(),
            bundle.to_string_lossy().to_string(),
        ])
    }

    fn uninstall_args(app_id: &str) -> Vec<String> {
        vec![
            "uninstall".to_string(),
            "--user".to_string(),
            "--noninteractive".to_string(),
            app_id.to_string(),
        ]
    }

    pub fn uninstall(&self, app_id: &str) -> Result<RemovalHandle, PackageError> {
        self.exec(Self::uninstall_args(app_id))?;
        Ok(RemovalHandle::Completed)
    }

    pub fn uninstall_detached(
        &self,
        app_id: &str,
        log_path: &Path,
    ) -> Result<RemovalHandle, PackageError> {
        let args = Self::uninstall_args(app_id);
        let pid = self
            .runner
            .spawn_detached(self.command, &args, log_path)
            .map_err(|source| PackageError::Launch {
                command: render_command(self.command, &args),
                source,
            })?;
        Ok(RemovalHandle::Detached {
            pid,
            log_path: log_path.to_path_buf(),
        })
    }

    pub fn is_installed(&self, app_id: &str) -> bool {
        self.runner
            .run(self.command, &["info".to_string(), "--user".to_string(), app_id.to_string()])
            .map(|output| output.success())
            .unwrap_or(false)
    }
}
