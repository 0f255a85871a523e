//! Fixtures for the lifecycle tests: a temp home, an emulated systemd, and a
//! broker that applies elevated file operations in-process.

use super::{Collaborators, HostInfo, Lifecycle, Principal};
use crate::broker::{BrokerError, Decision, ElevatedOp, PrivilegeBroker};
use crate::config::{Config, LayoutPaths};
use crate::runner::fake::{fail, ok, FakeRunner};
use crate::transport::fake::FakeTransport;
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

pub const INDEX_URL: &str = "https://api.example.test/repos/zt/gui/releases/latest";
pub const BUNDLE_URL: &str = "https://dl.example.test/v0.0.90/zerotier-gui.flatpak";
pub const ARCHIVE_URL: &str = "https://dl.example.test/zerotier-one-x86_64.tar.gz";
pub const ICON_URL: &str = "https://dl.example.test/zerotier-gui.png";

#[derive(Clone, Default)]
pub struct SystemdState {
    active: Rc<Cell<bool>>,
    enabled: Rc<Cell<bool>>,
}

impl SystemdState {
    pub fn active(&self) -> bool {
        self.active.get()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set(&self, active: bool, enabled: bool) {
        self.active.set(active);
        self.enabled.set(enabled);
    }
}

#[derive(Debug, Clone, Copy)]
enum BatchFailure {
    Denied,
    Status(i32),
}

pub struct FakeBroker {
    setup: Decision,
    cached: Cell<bool>,
    batching: Cell<bool>,
    failure: Cell<Option<BatchFailure>>,
    stuck: RefCell<Vec<PathBuf>>,
    setups: Cell<usize>,
    batches: RefCell<Vec<Vec<ElevatedOp>>>,
}

impl FakeBroker {
    fn new(setup: Decision) -> Self {
        Self {
            setup,
            cached: Cell::new(false),
            batching: Cell::new(true),
            failure: Cell::new(None),
            stuck: RefCell::new(Vec::new()),
            setups: Cell::new(0),
            batches: RefCell::new(Vec::new()),
        }
    }

    pub fn set_cached(&self, cached: bool) {
        self.cached.set(cached);
    }

    pub fn set_batching(&self, batching: bool) {
        self.batching.set(batching);
    }

    pub fn deny_batches(&self) {
        self.failure.set(Some(BatchFailure::Denied));
    }

    pub fn fail_batches_with(&self, status: i32) {
        self.failure.set(Some(BatchFailure::Status(status)));
    }

    /// Removing `path` fails, like a busy mount point would.
    pub fn stick(&self, path: &Path) {
        self.stuck.borrow_mut().push(path.to_path_buf());
    }

    pub fn setup_requests(&self) -> usize {
        self.setups.get()
    }

    pub fn batches(&self) -> Vec<Vec<ElevatedOp>> {
        self.batches.borrow().clone()
    }

    fn apply(&self, op: &ElevatedOp) -> Result<(), BrokerError> {
        let failed = |stderr: String| BrokerError::Failed {
            command: op.shell(),
            status_code: 1,
            stderr,
        };
        match op {
            ElevatedOp::CheckSudoers { path } => {
                if path.is_file() {
                    Ok(())
                } else {
                    Err(failed(format!("{}: No such file", path.display())))
                }
            }
            ElevatedOp::InstallFile { source, dest, .. } => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;
                }
                fs::copy(source, dest)
                    .map(|_| ())
                    .map_err(|e| failed(e.to_string()))
            }
            ElevatedOp::RemovePath { path } => {
                if self.stuck.borrow().iter().any(|p| p == path) {
                    return Err(failed("Device or resource busy".to_string()));
                }
                let result = if path.is_dir() {
                    fs::remove_dir_all(path)
                } else if path.symlink_metadata().is_ok() {
                    fs::remove_file(path)
                } else {
                    Ok(())
                };
                result.map_err(|e| failed(e.to_string()))
            }
        }
    }
}

impl PrivilegeBroker for FakeBroker {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn elevation_cached(&self) -> bool {
        self.cached.get()
    }

    fn request_one_time_setup(&self) -> Decision {
        self.setups.set(self.setups.get() + 1);
        self.setup
    }

    fn supports_batching(&self) -> bool {
        self.batching.get()
    }

    fn run_elevated_batch(&self, ops: &[ElevatedOp]) -> Result<(), BrokerError> {
        self.batches.borrow_mut().push(ops.to_vec());
        match self.failure.get() {
            Some(BatchFailure::Denied) => return Err(BrokerError::Denied),
            Some(BatchFailure::Status(status_code)) => {
                return Err(BrokerError::Failed {
                    command: "sh -c".to_string(),
                    status_code,
                    stderr: "sudo: a terminal is required".to_string(),
                })
            }
            None => {}
        }
        // set -e: stop at the first failing operation
        ops.iter().try_for_each(|op| self.apply(op))
    }

    fn exec_prefix(&self) -> Vec<String> {
        vec!["/usr/bin/sudo".to_string(), "-n".to_string()]
    }
}

pub struct Harness {
    _home: TempDir,
    pub cfg: Config,
    pub paths: LayoutPaths,
    pub runner: FakeRunner,
    pub broker: FakeBroker,
    pub transport: FakeTransport,
    pub systemd: SystemdState,
    pub grant_seen_at_enable: Rc<Cell<Option<bool>>>,
}

fn release_json() -> String {
    serde_json::json!({
        "tag_name": "v0.0.90",
        "assets": [
            {"name": "zerotier-gui.flatpak.sha256", "browser_download_url": "https://dl.example.test/sum", "size": 64},
            {"name": "zerotier-gui.flatpak", "browser_download_url": BUNDLE_URL, "size": 4096}
        ]
    })
    .to_string()
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Decision::Granted, true)
    }

    pub fn with_setup(decision: Decision) -> Self {
        Self::build(decision, true)
    }

    pub fn without_release() -> Self {
        Self::build(Decision::Granted, false)
    }

    fn build(setup: Decision, serve_release: bool) -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let root = home.path();
        let mut cfg = Config::default();
        let at = |rel: &str| root.join(rel).to_string_lossy().to_string();
        cfg.paths.backend_dir = at(".zerotier-one");
        cfg.paths.unit_dir = at(".config/systemd/user");
        cfg.paths.privilege_rule_dir = at("etc/sudoers.d");
        cfg.paths.shortcut_path = at("Desktop/zerotier-gui.desktop");
        cfg.paths.icon_path = at(".local/share/icons/zerotier-gui.png");
        cfg.paths.state_dir = at(".local/share/zerotier-gui");
        cfg.backend.archive_url = "https://dl.example.test/zerotier-one-{arch}.tar.gz".to_string();
        cfg.release.index_url = INDEX_URL.to_string();
        cfg.release.icon_url = ICON_URL.to_string();
        let paths = LayoutPaths::resolve(&cfg, root).expect("layout");

        let runner = FakeRunner::new();
        runner.installed("flatpak");
        runner.respond("tar -tzf", ok("zerotier-one\nzerotier-cli\n"));
        runner.on("tar -xzf", |args| {
            let dest = Path::new(&args[3]);
            match fs::write(dest.join("zerotier-one"), "#!/bin/sh\n") {
                Ok(()) => ok(""),
                Err(err) => fail(2, &err.to_string()),
            }
        });
        runner.respond("systemctl is-active", fail(3, "inactive"));

        let systemd = SystemdState::default();
        let state = systemd.clone();
        runner.on("systemctl --user is-active", move |_| {
            if state.active() {
                ok("active")
            } else {
                fail(3, "inactive")
            }
        });
        let state = systemd.clone();
        runner.on("systemctl --user is-enabled", move |_| {
            if state.enabled() {
                ok("enabled")
            } else {
                fail(1, "disabled")
            }
        });
        let state = systemd.clone();
        runner.on("systemctl --user enable", move |_| {
            state.set(true, true);
            ok("")
        });
        let state = systemd.clone();
        runner.on("systemctl --user stop", move |_| {
            state.active.set(false);
            ok("")
        });
        let state = systemd.clone();
        runner.on("systemctl --user disable", move |_| {
            state.enabled.set(false);
            ok("")
        });

        let transport = FakeTransport::new();
        transport.serve(ARCHIVE_URL, b"archive".to_vec());
        transport.serve(ICON_URL, b"\x89PNG".to_vec());
        if serve_release {
            transport.serve(INDEX_URL, release_json());
            transport.serve(BUNDLE_URL, b"bundle".to_vec());
        }

        Self {
            _home: home,
            cfg,
            paths,
            runner,
            broker: FakeBroker::new(setup),
            transport,
            systemd,
            grant_seen_at_enable: Rc::new(Cell::new(None)),
        }
    }

    /// Records whether the privilege rule existed when the unit was started.
    pub fn watch_grant_at_enable(&self) {
        let rule = self.paths.privilege_rule_file.clone();
        let seen = self.grant_seen_at_enable.clone();
        let state = self.systemd.clone();
        self.runner.on("systemctl --user enable --now", move |_| {
            seen.set(Some(rule.is_file()));
            state.set(true, true);
            ok("")
        });
    }

    pub fn lifecycle(&self) -> Lifecycle<'_, FakeRunner> {
        self.lifecycle_with(&self.broker)
    }

    /// Same fixture, driven through another broker (e.g. a real `SudoBroker` over the runner).
    pub fn lifecycle_with<'a>(&'a self, broker: &'a dyn PrivilegeBroker) -> Lifecycle<'a, FakeRunner> {
        Lifecycle::new(
            &self.cfg,
            &self.paths,
            HostInfo {
                principal: Principal {
                    user: "deck".to_string(),
                    group: Some("deck".to_string()),
                },
                arch: "x86_64".to_string(),
            },
            Collaborators {
                runner: &self.runner,
                broker,
                transport: &self.transport,
            },
        )
    }
}
