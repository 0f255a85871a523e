//! The install/uninstall state machine.
//!
//! Stages run strictly in order. Each one either completes, is skipped because
//! its effect is already in place, records a warning and lets the run continue,
//! or fails and ends the run. Nothing already done is rolled back.

mod install;
mod probe;
mod uninstall;

#[cfg(test)]
pub(crate) mod testkit;

pub use probe::{EntityPresence, LifecycleState};

use crate::broker::{Decision, PrivilegeBroker};
use crate::config::{Config, LayoutPaths};
use crate::runner::CommandRunner;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DetectBackend,
    PrivilegeSetup,
    FetchBackend,
    PrivilegeGrant,
    ServiceUnit,
    RuntimeCheck,
    ResolveBundle,
    RuntimeDependency,
    BundleInstall,
    Icon,
    Shortcut,
    StopService,
    RemoveBackend,
    BundleRemoval,
    RemoveShortcut,
    RemoveIcon,
}

/// Transcript order of a fresh install.
#[cfg(test)]
pub const INSTALL_STAGES: [Stage; 11] = [
    Stage::DetectBackend,
    Stage::PrivilegeSetup,
    Stage::FetchBackend,
    Stage::PrivilegeGrant,
    Stage::ServiceUnit,
    Stage::RuntimeCheck,
    Stage::ResolveBundle,
    Stage::RuntimeDependency,
    Stage::BundleInstall,
    Stage::Icon,
    Stage::Shortcut,
];

#[cfg(test)]
pub const UNINSTALL_STAGES: [Stage; 6] = [
    Stage::StopService,
    Stage::RemoveBackend,
    Stage::RuntimeCheck,
    Stage::BundleRemoval,
    Stage::RemoveShortcut,
    Stage::RemoveIcon,
];

/// Install steps 2-5; the part `reinstall-backend` repeats.
pub const BACKEND_STAGES: [Stage; 4] = [
    Stage::PrivilegeSetup,
    Stage::FetchBackend,
    Stage::PrivilegeGrant,
    Stage::ServiceUnit,
];

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::DetectBackend => "detect_backend",
            Stage::PrivilegeSetup => "privilege_setup",
            Stage::FetchBackend => "fetch_backend",
            Stage::PrivilegeGrant => "privilege_grant",
            Stage::ServiceUnit => "service_unit",
            Stage::RuntimeCheck => "runtime_check",
            Stage::ResolveBundle => "resolve_bundle",
            Stage::RuntimeDependency => "runtime_dependency",
            Stage::BundleInstall => "bundle_install",
            Stage::Icon => "icon",
            Stage::Shortcut => "shortcut",
            Stage::StopService => "stop_service",
            Stage::RemoveBackend => "remove_backend",
            Stage::BundleRemoval => "bundle_removal",
            Stage::RemoveShortcut => "remove_shortcut",
            Stage::RemoveIcon => "remove_icon",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Stage::DetectBackend => "Detect existing backend",
            Stage::PrivilegeSetup => "One-time privilege setup",
            Stage::FetchBackend => "Fetch backend binary",
            Stage::PrivilegeGrant => "Register privilege grant",
            Stage::ServiceUnit => "Create and enable service unit",
            Stage::RuntimeCheck => "Verify package runtime",
            Stage::ResolveBundle => "Resolve and fetch latest bundle",
            Stage::RuntimeDependency => "Install shared runtime",
            Stage::BundleInstall => "Install bundle",
            Stage::Icon => "Fetch icon",
            Stage::Shortcut => "Write desktop shortcut",
            Stage::StopService => "Stop and disable service",
            Stage::RemoveBackend => "Remove backend files",
            Stage::BundleRemoval => "Remove bundle",
            Stage::RemoveShortcut => "Remove desktop shortcut",
            Stage::RemoveIcon => "Remove icon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Done,
    Skipped,
    Warning,
    Failed,
    Launched,
    Planned,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Done => "done",
            StageStatus::Skipped => "skipped",
            StageStatus::Warning => "warning",
            StageStatus::Failed => "failed",
            StageStatus::Launched => "launched",
            StageStatus::Planned => "planned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    FreshlyInstalled,
    AlreadyInstalled,
    BackendReinstalled,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub outcome: InstallOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_tag: Option<String>,
    pub stages: Vec<StageRecord>,
    pub warnings: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

/// Whether bundle removal runs in the foreground or is handed to a background process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleRemoval {
    Detach,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BundleRemovalOutcome {
    Completed,
    Launched { pid: u32, log_path: PathBuf },
    Skipped,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub stages: Vec<StageRecord>,
    pub warnings: Vec<String>,
    pub bundle_removal: BundleRemovalOutcome,
    pub finished_at: DateTime<Utc>,
}

/// Stages and warnings recorded so far; the payload of a failed run.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub stages: Vec<StageRecord>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("privilege setup was not granted ({})", .decision.as_str())]
    PrivilegeSetupDeclined { decision: Decision },
    #[error("could not fetch the backend: {message}")]
    BackendFetchFailed { message: String },
    #[error("could not register the privilege grant: {message}")]
    PrivilegeGrantFailed {
        message: String,
        exit_code: Option<i32>,
    },
    #[error("could not register the service unit: {message}")]
    ServiceRegistrationFailed {
        message: String,
        exit_code: Option<i32>,
    },
    #[error("package runtime `{command}` was not found on PATH")]
    RuntimeMissing { command: String },
    #[error("no usable release artifact: {message}")]
    ArtifactNotFound { message: String },
    #[error("could not download the release artifact: {message}")]
    ArtifactDownloadFailed { message: String },
    #[error("could not install the shared runtime: {message}")]
    RuntimeDependencyInstallFailed {
        message: String,
        exit_code: Option<i32>,
    },
    #[error("could not install the bundle: {message}")]
    BundleInstallFailed {
        message: String,
        exit_code: Option<i32>,
    },
}

impl InstallError {
    pub fn error_code(&self) -> &'static str {
        match self {
            InstallError::PrivilegeSetupDeclined { .. } => "privilege_setup_declined",
            InstallError::BackendFetchFailed { .. } => "backend_fetch_failed",
            InstallError::PrivilegeGrantFailed { .. } => "privilege_grant_failed",
            InstallError::ServiceRegistrationFailed { .. } => "service_registration_failed",
            InstallError::RuntimeMissing { .. } => "runtime_missing",
            InstallError::ArtifactNotFound { .. } => "artifact_not_found",
            InstallError::ArtifactDownloadFailed { .. } => "artifact_download_failed",
            InstallError::RuntimeDependencyInstallFailed { .. } => {
                "runtime_dependency_install_failed"
            }
            InstallError::BundleInstallFailed { .. } => "bundle_install_failed",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            InstallError::PrivilegeSetupDeclined { .. } => Stage::PrivilegeSetup,
            InstallError::BackendFetchFailed { .. } => Stage::FetchBackend,
            InstallError::PrivilegeGrantFailed { .. } => Stage::PrivilegeGrant,
            InstallError::ServiceRegistrationFailed { .. } => Stage::ServiceUnit,
            InstallError::RuntimeMissing { .. } => Stage::RuntimeCheck,
            InstallError::ArtifactNotFound { .. } | InstallError::ArtifactDownloadFailed { .. } => {
                Stage::ResolveBundle
            }
            InstallError::RuntimeDependencyInstallFailed { .. } => Stage::RuntimeDependency,
            InstallError::BundleInstallFailed { .. } => Stage::BundleInstall,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            InstallError::PrivilegeGrantFailed { exit_code, .. }
            | InstallError::ServiceRegistrationFailed { exit_code, .. }
            | InstallError::RuntimeDependencyInstallFailed { exit_code, .. }
            | InstallError::BundleInstallFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            InstallError::PrivilegeSetupDeclined { .. } => {
                Some("rerun from a terminal and approve the prompt, or pass --yes")
            }
            InstallError::BackendFetchFailed { .. } => {
                Some("check network access to backend.archive_url")
            }
            InstallError::PrivilegeGrantFailed { .. } => {
                Some("check that sudo and visudo are installed and paths.privilege_rule_dir is writable by root")
            }
            InstallError::ServiceRegistrationFailed { .. } => {
                Some("inspect the unit with `systemctl --user status` and `journalctl --user`")
            }
            InstallError::RuntimeMissing { .. } => {
                Some("install Flatpak with your distribution's package manager")
            }
            InstallError::ArtifactNotFound { .. } => {
                Some("check release.index_url and release.bundle_asset")
            }
            InstallError::ArtifactDownloadFailed { .. } => {
                Some("check network access to GitHub and retry; the API is rate limited")
            }
            InstallError::RuntimeDependencyInstallFailed { .. } => Some(
                "add the remote with `flatpak remote-add --user --if-not-exists flathub https://flathub.org/repo/flathub.flatpakrepo`",
            ),
            InstallError::BundleInstallFailed { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum UninstallError {
    #[error("backend is still present at {}: {message}", .path.display())]
    BackendRemovalFailed {
        path: PathBuf,
        message: String,
        exit_code: Option<i32>,
    },
}

impl UninstallError {
    pub fn error_code(&self) -> &'static str {
        match self {
            UninstallError::BackendRemovalFailed { .. } => "backend_removal_failed",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            UninstallError::BackendRemovalFailed { .. } => Stage::RemoveBackend,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            UninstallError::BackendRemovalFailed { exit_code, .. } => *exit_code,
        }
    }
}

/// The account the privilege grant is written for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user: String,
    pub group: Option<String>,
}

impl Principal {
    pub fn detect<R: CommandRunner>(runner: &R) -> Option<Self> {
        let query = |flag: &str| {
            runner
                .run("id", &[flag.to_string()])
                .ok()
                .filter(|out| out.success())
                .map(|out| out.stdout_text())
                .filter(|name| !name.is_empty())
        };
        let user = query("-un")?;
        Some(Self {
            user,
            group: query("-gn"),
        })
    }

    /// `%group` when the primary group is known, else the user name.
    pub fn sudoers_subject(&self) -> String {
        match &self.group {
            Some(group) => format!("%{group}"),
            None => self.user.clone(),
        }
    }
}

fn escape_sudoers(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | ',' | ':' | '=' | ' ' | '\t') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Passwordless rule for the backend binary and its CLI.
pub fn render_privilege_rule(principal: &Principal, paths: &LayoutPaths) -> String {
    format!(
        "# Managed by ztgui; removed by `ztgui uninstall`.\n\
         {subject} ALL=(root) NOPASSWD: {binary}, {cli}\n",
        subject = principal.sudoers_subject(),
        binary = escape_sudoers(&paths.backend_binary.to_string_lossy()),
        cli = escape_sudoers(&paths.backend_cli.to_string_lossy()),
    )
}

/// Facts about the machine the lifecycle runs on.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub principal: Principal,
    pub arch: String,
}

/// External collaborators, injected so tests can substitute fakes.
pub struct Collaborators<'a, R: CommandRunner> {
    pub runner: &'a R,
    pub broker: &'a dyn PrivilegeBroker,
    pub transport: &'a dyn Transport,
}

pub struct Lifecycle<'a, R: CommandRunner> {
    cfg: &'a Config,
    paths: &'a LayoutPaths,
    host: HostInfo,
    runner: &'a R,
    broker: &'a dyn PrivilegeBroker,
    transport: &'a dyn Transport,
    stages: Vec<StageRecord>,
    warnings: Vec<String>,
}

impl<'a, R: CommandRunner> Lifecycle<'a, R> {
    pub fn new(
        cfg: &'a Config,
        paths: &'a LayoutPaths,
        host: HostInfo,
        collaborators: Collaborators<'a, R>,
    ) -> Self {
        Self {
            cfg,
            paths,
            host,
            runner: collaborators.runner,
            broker: collaborators.broker,
            transport: collaborators.transport,
            stages: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            stages: self.stages.clone(),
            warnings: self.warnings.clone(),
        }
    }

    fn reset(&mut self) {
        self.stages.clear();
        self.warnings.clear();
    }

    fn record(&mut self, stage: Stage, status: StageStatus, detail: impl Into<String>) {
        let detail = detail.into();
        match status {
            StageStatus::Warning | StageStatus::Failed => {
                warn!(stage = stage.as_str(), status = status.as_str(), "{detail}")
            }
            _ => info!(stage = stage.as_str(), status = status.as_str(), "{detail}"),
        }
        self.stages.push(StageRecord {
            stage,
            status,
            detail,
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Records `err` against its stage and hands it back for `?`.
    fn fail(&mut self, err: InstallError) -> InstallError {
        self.record(err.stage(), StageStatus::Failed, err.to_string());
        err
    }
}
