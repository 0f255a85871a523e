use crate::argv;
use crate::config::{Config, LayoutPaths};
use crate::desktop::{read_version_marker, shortcut_version};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::package::PackageRuntime;
use crate::runner::CommandRunner;
use crate::supervisor::Supervisor;
use serde::Serialize;
use std::fs;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Ok,
    ServiceNotRunning,
    NoAuthToken,
    NotInstalled,
    ElevationRequired,
    Unknown,
}

impl BackendHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendHealth::Ok => "ok",
            BackendHealth::ServiceNotRunning => "service_not_running",
            BackendHealth::NoAuthToken => "no_auth_token",
            BackendHealth::NotInstalled => "not_installed",
            BackendHealth::ElevationRequired => "elevation_required",
            BackendHealth::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthProbe {
    pub status: BackendHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Predicates {
    pub backend_present: bool,
    pub privilege_baseline_configured: bool,
    pub runtime_available: bool,
    pub unit_file_present: bool,
    pub unit_enabled: bool,
    pub unit_active: bool,
    pub grant_present: bool,
    pub shortcut_present: bool,
    pub bundle_installed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCheck {
    pub id: String,
    pub ok: bool,
    pub severity: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

fn check(
    id: &str,
    ok: bool,
    severity: &str,
    message: impl Into<String>,
    remediation: Option<String>,
) -> StatusCheck {
    StatusCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        message: message.into(),
        remediation: if ok { None } else { remediation },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: LifecycleState,
    pub predicates: Predicates,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortcut_version: Option<String>,
    pub health: HealthProbe,
    pub system_service_conflict: bool,
    pub checks: Vec<StatusCheck>,
}

// zerotier-cli exit codes
const CLI_SERVICE_NOT_RUNNING: i32 = 1;
const CLI_NO_AUTH_TOKEN: i32 = 2;
const CLI_NOT_FOUND: i32 = 127;

/// Runs `zerotier-cli listnetworks` through `sudo -n`, which the grant allows.
pub fn probe_backend_health<R: CommandRunner>(runner: &R, paths: &LayoutPaths) -> HealthProbe {
    let early = |status, exit_code| HealthProbe {
        status,
        networks: None,
        exit_code,
    };
    if !paths.backend_cli.exists() {
        return early(BackendHealth::NotInstalled, None);
    }
    let args = argv![
        "-n",
        paths.backend_cli.display(),
        format!("-D{}", paths.backend_dir.display()),
        "listnetworks"
    ];
    let output = match runner.run("sudo", &args) {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return early(BackendHealth::ElevationRequired, None)
        }
        Err(_) => return early(BackendHealth::Unknown, None),
    };
    let code = output.status_code;
    let status = match code {
        0 => BackendHealth::Ok,
        CLI_SERVICE_NOT_RUNNING if output.stderr_text().contains("password is required") => {
            BackendHealth::ElevationRequired
        }
        CLI_SERVICE_NOT_RUNNING => BackendHealth::ServiceNotRunning,
        CLI_NO_AUTH_TOKEN => BackendHealth::NoAuthToken,
        CLI_NOT_FOUND => BackendHealth::NotInstalled,
        _ => BackendHealth::Unknown,
    };
    let networks = (status == BackendHealth::Ok).then(|| count_networks(&output.stdout_text()));
    HealthProbe {
        status,
        networks,
        exit_code: Some(code),
    }
}

/// `200 listnetworks <nwid> ...` rows, minus the header row.
fn count_networks(stdout: &str) -> usize {
    stdout
        .lines()
        .filter(|line| line.starts_with("200 listnetworks "))
        .filter(|line| !line.contains("<nwid>"))
        .count()
}

pub fn collect_status<R: CommandRunner>(
    lifecycle: &Lifecycle<'_, R>,
    runner: &R,
    cfg: &Config,
    paths: &LayoutPaths,
) -> StatusReport {
    let supervisor = Supervisor::new(
        runner,
        &cfg.service.supervisor_command,
        &cfg.service.unit_name,
    );
    let package = PackageRuntime::new(runner, &cfg.package.command);
    let runtime_available = package.available();
    let predicates = Predicates {
        backend_present: lifecycle.backend_present(),
        privilege_baseline_configured: lifecycle.privilege_baseline_configured(),
        runtime_available,
        unit_file_present: lifecycle.unit_file_present(),
        unit_enabled: supervisor.is_enabled(),
        unit_active: supervisor.is_active(),
        grant_present: lifecycle.grant_present(),
        shortcut_present: lifecycle.shortcut_present(),
        bundle_installed: runtime_available && package.is_installed(&cfg.package.app_id),
    };
    let state = lifecycle.state();
    let health = if predicates.backend_present {
        probe_backend_health(runner, paths)
    } else {
        HealthProbe {
            status: BackendHealth::NotInstalled,
            networks: None,
            exit_code: None,
        }
    };
    let system_service_conflict = predicates.unit_file_present && supervisor.system_unit_active();
    let shortcut_version = fs::read_to_string(&paths.shortcut_path)
        .ok()
        .and_then(|content| shortcut_version(&content).map(str::to_string));

    let unit = &cfg.service.unit_name;
    let checks = vec![
        check(
            "backend",
            predicates.backend_present,
            "error",
            format!("backend binary at {}", paths.backend_binary.display()),
            Some("run `ztgui install` or `ztgui reinstall-backend`".to_string()),
        ),
        check(
            "privilege_grant",
            predicates.grant_present,
            "error",
            format!("privilege rule at {}", paths.privilege_rule_file.display()),
            Some("run `ztgui reinstall-backend`".to_string()),
        ),
        check(
            "service_unit",
            predicates.unit_file_present && predicates.unit_enabled,
            "error",
            format!("user unit {unit} is installed and enabled"),
            Some(format!("run `systemctl --user enable --now {unit}`")),
        ),
        check(
            "service_running",
            predicates.unit_active,
            "warning",
            format!("user unit {unit} is active"),
            Some(format!("inspect `journalctl --user -u {unit}`")),
        ),
        check(
            "backend_health",
            health.status == BackendHealth::Ok,
            "warning",
            format!("backend answers listnetworks ({})", health.status.as_str()),
            Some(health_remediation(health.status, unit)),
        ),
        check(
            "system_service",
            !system_service_conflict,
            "error",
            format!("no system-wide {unit} unit competes with the user unit"),
            Some(format!("sudo systemctl disable --now {unit}")),
        ),
        check(
            "package_runtime",
            predicates.runtime_available,
            "error",
            format!("`{}` is on PATH", cfg.package.command),
            Some("install Flatpak with your distribution's package manager".to_string()),
        ),
        check(
            "bundle",
            predicates.bundle_installed,
            "warning",
            format!("{} is installed", cfg.package.app_id),
            Some("run `ztgui install`".to_string()),
        ),
        check(
            "shortcut",
            predicates.shortcut_present,
            "info",
            format!("desktop shortcut at {}", paths.shortcut_path.display()),
            Some("run `ztgui install` to rewrite it".to_string()),
        ),
    ];

    StatusReport {
        state,
        predicates,
        version: read_version_marker(&paths.version_marker, &cfg.shortcut.default_version),
        shortcut_version,
        health,
        system_service_conflict,
        checks,
    }
}

fn health_remediation(status: BackendHealth, unit: &str) -> String {
    match status {
        BackendHealth::ServiceNotRunning => format!("run `systemctl --user restart {unit}`"),
        BackendHealth::NoAuthToken => {
            "the backend has not created authtoken.secret yet; restart the service".to_string()
        }
        BackendHealth::ElevationRequired => "run `ztgui reinstall-backend`".to_string(),
        BackendHealth::NotInstalled => "run `ztgui install`".to_string(),
        BackendHealth::Ok | BackendHealth::Unknown => {
            format!("inspect `journalctl --user -u {unit}`")
        }
    }
}
