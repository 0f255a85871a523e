use super::Lifecycle;
use crate::argv;
use crate::config::Config;
use crate::package::PackageRuntime;
use crate::runner::CommandRunner;
use crate::supervisor::Supervisor;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotInstalled,
    Installed,
    Partial,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::NotInstalled => "not_installed",
            LifecycleState::Installed => "installed",
            LifecycleState::Partial => "partial",
        }
    }
}

/// Presence of each core entity; drives the derived [`LifecycleState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntityPresence {
    pub backend: bool,
    pub unit_file: bool,
    pub grant: bool,
    pub shortcut: bool,
}

impl EntityPresence {
    pub fn state(&self) -> LifecycleState {
        let all = [self.backend, self.unit_file, self.grant, self.shortcut];
        if all.iter().all(|present| *present) {
            LifecycleState::Installed
        } else if all.iter().any(|present| *present) {
            LifecycleState::Partial
        } else {
            LifecycleState::NotInstalled
        }
    }
}

impl<'a, R: CommandRunner> Lifecycle<'a, R> {
    pub(super) fn supervisor(&self) -> Supervisor<'a, R> {
        let cfg: &'a Config = self.cfg;
        Supervisor::new(
            self.runner,
            &cfg.service.supervisor_command,
            &cfg.service.unit_name,
        )
    }

    pub(super) fn package(&self) -> PackageRuntime<'a, R> {
        let cfg: &'a Config = self.cfg;
        PackageRuntime::new(self.runner, &cfg.package.command)
    }

    pub fn backend_present(&self) -> bool {
        self.paths.backend_binary.is_file()
    }

    /// Marker from an earlier setup, or elevation that already works without a prompt.
    pub fn privilege_baseline_configured(&self) -> bool {
        self.paths.baseline_marker.is_file() || self.broker.elevation_cached()
    }

    pub fn runtime_available(&self) -> bool {
        self.package().available()
    }

    pub fn unit_active(&self) -> bool {
        self.supervisor().is_active()
    }

    pub fn unit_enabled(&self) -> bool {
        self.supervisor().is_enabled()
    }

    pub fn unit_file_present(&self) -> bool {
        self.paths.unit_file.is_file()
    }

    /// The rule directory is usually unreadable for the user, so an inconclusive
    /// stat falls back to asking sudo whether the binary is allowed without a password.
    pub fn grant_present(&self) -> bool {
        match self.paths.privilege_rule_file.try_exists() {
            Ok(exists) => exists,
            Err(err) => {
                debug!("cannot stat privilege rule: {err}");
                self.sudo_allows(&self.paths.backend_binary)
            }
        }
    }

    fn sudo_allows(&self, binary: &Path) -> bool {
        self.runner
            .run("sudo", &argv!["-n", "-l", binary.display()])
            .map(|out| out.success())
            .unwrap_or(false)
    }

    pub fn shortcut_present(&self) -> bool {
        self.paths.shortcut_path.is_file()
    }

    pub fn presence(&self) -> EntityPresence {
        EntityPresence {
            backend: self.backend_present(),
            unit_file: self.unit_file_present(),
            grant: self.grant_present(),
            shortcut: self.shortcut_present(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.presence().state()
    }
}
