use crate::error::AppError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub backend: Backend,
    pub service: Service,
    pub privilege: Privilege,
    pub package: Package,
    pub release: Release,
    pub shortcut: Shortcut,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub backend_dir: String,
    pub unit_dir: String,
    pub privilege_rule_dir: String,
    pub shortcut_path: String,
    pub icon_path: String,
    pub state_dir: String,
    pub version_marker: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Backend {
    pub binary_name: String,
    pub cli_name: String,
    pub archive_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Service {
    pub unit_name: String,
    pub supervisor_command: String,
    pub restart_sec: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Sudo,
    Polkit,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Privilege {
    pub broker: BrokerKind,
    pub prompt_timeout_sec: u64,
    pub rule_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Package {
    pub command: String,
    pub app_id: String,
    pub remote: String,
    pub runtime_ref: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Release {
    pub index_url: String,
    pub bundle_asset: String,
    pub icon_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Shortcut {
    pub name: String,
    pub default_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            backend: Backend::default(),
            service: Service::default(),
            privilege: Privilege::default(),
            package: Package::default(),
            release: Release::default(),
            shortcut: Shortcut::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            backend_dir: "~/.zerotier-one".to_string(),
            unit_dir: "~/.config/systemd/user".to_string(),
            privilege_rule_dir: "/etc/sudoers.d".to_string(),
            shortcut_path: "~/Desktop/zerotier-gui.desktop".to_string(),
            icon_path: "~/.local/share/icons/zerotier-gui.png".to_string(),
            state_dir: "~/.local/share/zerotier-gui".to_string(),
            version_marker: String::new(),
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            binary_name: "zerotier-one".to_string(),
            cli_name: "zerotier-cli".to_string(),
            archive_url: "https://github.com/rafalb8/ZeroTierOne-Static/releases/latest/download/zerotier-one-{arch}.tar.gz".to_string(),
        }
    }
}

impl Default for Service {
    fn default() -> Self {
        Self {
            unit_name: "zerotier-one".to_string(),
            supervisor_command: "systemctl".to_string(),
            restart_sec: 5,
        }
    }
}

impl Default for Privilege {
    fn default() -> Self {
        Self {
            broker: BrokerKind::Sudo,
            prompt_timeout_sec: 180,
            rule_name: "zerotier-gui".to_string(),
        }
    }
}

impl Default for Package {
    fn default() -> Self {
        Self {
            command: "flatpak".to_string(),
            app_id: "io.github.aaron777collins.zerotier-gui".to_string(),
            remote: "flathub".to_string(),
            runtime_ref: "org.freedesktop.Platform//23.08".to_string(),
        }
    }
}

impl Default for Release {
    fn default() -> Self {
        Self {
            index_url:
                "https://api.github.com/repos/aaron777collins/ZeroTier-GUI-Arch/releases/latest"
                    .to_string(),
            bundle_asset: "zerotier-gui.flatpak".to_string(),
            icon_url: "https://raw.githubusercontent.com/aaron777collins/ZeroTier-GUI-Arch/master/img/zerotier-gui.png".to_string(),
        }
    }
}

impl Default for Shortcut {
    fn default() -> Self {
        Self {
            name: "ZeroTier GUI".to_string(),
            default_version: "0.0.82".to_string(),
        }
    }
}

impl Config {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.privilege.prompt_timeout_sec)
    }
}

/// Every on-disk location the lifecycle touches, resolved to absolute paths.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutPaths {
    pub backend_dir: PathBuf,
    pub backend_binary: PathBuf,
    pub backend_cli: PathBuf,
    pub networks_dir: PathBuf,
    pub unit_dir: PathBuf,
    pub unit_file: PathBuf,
    pub privilege_rule_file: PathBuf,
    pub shortcut_path: PathBuf,
    pub icon_path: PathBuf,
    pub state_dir: PathBuf,
    pub version_marker: PathBuf,
    pub baseline_marker: PathBuf,
    pub download_dir: PathBuf,
    pub uninstall_log: PathBuf,
}

impl LayoutPaths {
    pub fn resolve(cfg: &Config, home: &Path) -> Result<Self, AppError> {
        let backend_dir = expand_home_path(&cfg.paths.backend_dir, home, "paths.backend_dir")?;
        let unit_dir = expand_home_path(&cfg.paths.unit_dir, home, "paths.unit_dir")?;
        let rule_dir = expand_home_path(
            &cfg.paths.privilege_rule_dir,
            home,
            "paths.privilege_rule_dir",
        )?;
        let shortcut_path =
            expand_home_path(&cfg.paths.shortcut_path, home, "paths.shortcut_path")?;
        let icon_path = expand_home_path(&cfg.paths.icon_path, home, "paths.icon_path")?;
        let state_dir = expand_home_path(&cfg.paths.state_dir, home, "paths.state_dir")?;
        let version_marker = if cfg.paths.version_marker.trim().is_empty() {
            state_dir.join("version")
        } else {
            expand_home_path(&cfg.paths.version_marker, home, "paths.version_marker")?
        };
        Ok(Self {
            backend_binary: backend_dir.join(&cfg.backend.binary_name),
            backend_cli: backend_dir.join(&cfg.backend.cli_name),
            networks_dir: backend_dir.join("networks.d"),
            backend_dir,
            unit_file: unit_dir.join(format!("{}.service", cfg.service.unit_name)),
            unit_dir,
            privilege_rule_file: rule_dir.join(&cfg.privilege.rule_name),
            shortcut_path,
            icon_path,
            baseline_marker: state_dir.join("privilege-baseline"),
            download_dir: state_dir.join("downloads"),
            uninstall_log: state_dir.join("bundle-uninstall.log"),
            state_dir,
            version_marker,
        })
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("ZTGUI_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_config_dir().join("config.yaml")
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("ZTGUI_CONFIG_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("ztgui");
    base
}

pub fn required_home_dir() -> Result<PathBuf, AppError> {
    let home = home_dir().ok_or_else(|| {
        AppError::Config("unable to resolve $HOME; set HOME to an existing directory".to_string())
    })?;
    if !home.is_absolute() {
        return Err(AppError::Config(format!(
            "resolved HOME path is not absolute: {}",
            home.display()
        )));
    }
    Ok(home)
}

pub fn expand_home_path(input: &str, home: &Path, field: &str) -> Result<PathBuf, AppError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AppError::Config(format!("{field} must not be empty")));
    }
    let expanded = if trimmed == "~" {
        home.to_path_buf()
    } else if let Some(stripped) = trimmed.strip_prefix("~/") {
        home.join(stripped)
    } else {
        PathBuf::from(trimmed)
    };
    if !expanded.is_absolute() {
        return Err(AppError::Config(format!(
            "{field} must be an absolute path or start with ~/ (got {trimmed})"
        )));
    }
    Ok(expanded)
}

pub fn ensure_parent(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn read_config_from_str(content: &str) -> Result<Config, AppError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Loads the config file, falling back to built-in defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<(Config, bool), AppError> {
    if !path.exists() {
        return Ok((Config::default(), false));
    }
    let content = fs::read_to_string(path)?;
    Ok((read_config_from_str(&content)?, true))
}

fn require_non_empty(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Config(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_http_url(value: &str, field: &str) -> Result<(), AppError> {
    require_non_empty(value, field)?;
    let trimmed = value.trim();
    if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
        return Err(AppError::Config(format!(
            "{field} must be an http(s) URL (got {trimmed})"
        )));
    }
    Ok(())
}

fn require_plain_name(value: &str, field: &str) -> Result<(), AppError> {
    require_non_empty(value, field)?;
    if value.contains('/') || value.contains(char::is_whitespace) {
        return Err(AppError::Config(format!(
            "{field} must be a bare name without slashes or spaces (got {value})"
        )));
    }
    Ok(())
}

pub fn validate_config(cfg: &Config) -> Result<(), AppError> {
    if cfg.version != CONFIG_VERSION {
        return Err(AppError::Config(format!(
            "unsupported config version {} (expected {})",
            cfg.version, CONFIG_VERSION
        )));
    }
    require_plain_name(&cfg.backend.binary_name, "backend.binary_name")?;
    require_plain_name(&cfg.backend.cli_name, "backend.cli_name")?;
    require_http_url(&cfg.backend.archive_url, "backend.archive_url")?;
    require_plain_name(&cfg.service.unit_name, "service.unit_name")?;
    require_non_empty(&cfg.service.supervisor_command, "service.supervisor_command")?;
    if cfg.privilege.prompt_timeout_sec == 0 {
        return Err(AppError::Config(
            "privilege.prompt_timeout_sec must be greater than zero".to_string(),
        ));
    }
    require_plain_name(&cfg.privilege.rule_name, "privilege.rule_name")?;
    if cfg.privilege.rule_name.contains('.') || cfg.privilege.rule_name.ends_with('~') {
        // sudo silently ignores files in sudoers.d whose names contain '.' or end in '~'.
        return Err(AppError::Config(format!(
            "privilege.rule_name must not contain '.' or end with '~' (got {})",
            cfg.privilege.rule_name
        )));
    }
    require_non_empty(&cfg.package.command, "package.command")?;
    require_plain_name(&cfg.package.app_id, "package.app_id")?;
    require_plain_name(&cfg.package.remote, "package.remote")?;
    require_plain_name(&cfg.package.runtime_ref, "package.runtime_ref")?;
    require_http_url(&cfg.release.index_url, "release.index_url")?;
    require_plain_name(&cfg.release.bundle_asset, "release.bundle_asset")?;
    require_http_url(&cfg.release.icon_url, "release.icon_url")?;
    require_non_empty(&cfg.shortcut.name, "shortcut.name")?;
    require_non_empty(&cfg.shortcut.default_version, "shortcut.default_version")?;
    Ok(())
}

pub fn backend_arch() -> Result<&'static str, AppError> {
    match env::consts::ARCH {
        "x86_64" => Ok("x86_64"),
        "aarch64" => Ok("aarch64"),
        value => Err(AppError::Config(format!(
            "unsupported architecture for the backend: {value}"
        ))),
    }
}

pub fn backend_archive_url(cfg: &Config, arch: &str) -> String {
    cfg.backend.archive_url.replace("{arch}", arch)
}
