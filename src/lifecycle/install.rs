use super::{
    render_privilege_rule, InstallError, InstallOutcome, InstallReport, Lifecycle, Stage,
    StageRecord, StageStatus, BACKEND_STAGES,
};
use crate::archive::extract_tarball;
use crate::broker::{Decision, ElevatedOp};
use crate::config::backend_archive_url;
use crate::desktop::{self, read_version_marker, ShortcutSpec};
use crate::runner::CommandRunner;
use crate::supervisor::{render_unit, UnitSpec};
use crate::transport::{resolve_latest_artifact, ReleaseError, ResolvedArtifact};
use chrono::Utc;
use std::fs;
use std::path::Path;

const BACKEND_ARCHIVE_NAME: &str = "zerotier-one.tar.gz";
const STAGED_RULE_NAME: &str = "privilege-rule.staged";

impl<R: CommandRunner> Lifecycle<'_, R> {
    /// Full install. A present backend short-circuits steps 2-5; the frontend
    /// steps still run since each is idempotent.
    pub fn install(&mut self) -> Result<InstallReport, InstallError> {
        self.reset();
        let outcome = if self.backend_present() {
            let detail = format!(
                "backend already installed at {}",
                self.paths.backend_binary.display()
            );
            self.record(Stage::DetectBackend, StageStatus::Skipped, detail);
            for stage in BACKEND_STAGES {
                self.record(stage, StageStatus::Skipped, "backend already installed");
            }
            InstallOutcome::AlreadyInstalled
        } else {
            self.record(Stage::DetectBackend, StageStatus::Done, "no backend found");
            self.provision_backend()?;
            InstallOutcome::FreshlyInstalled
        };
        let (artifact, version) = self.install_frontend()?;
        Ok(self.install_report(outcome, Some(version), Some(artifact.tag)))
    }

    /// Stops the current unit and repeats steps 2-5 regardless of what is present.
    pub fn reinstall_backend(&mut self) -> Result<InstallReport, InstallError> {
        self.reset();
        // A running daemon keeps the binary busy, so it must stop before the fetch.
        self.stop_unit(Stage::StopService);
        self.provision_backend()?;
        Ok(self.install_report(InstallOutcome::BackendReinstalled, None, None))
    }

    /// Stage outline without side effects beyond the read-only predicates.
    pub fn plan_install(&self) -> Vec<StageRecord> {
        let backend = self.backend_present();
        let planned = |stage, detail: String| StageRecord {
            stage,
            status: StageStatus::Planned,
            detail,
        };
        let mut plan = Vec::new();
        if backend {
            plan.push(StageRecord {
                stage: Stage::DetectBackend,
                status: StageStatus::Skipped,
                detail: format!(
                    "backend already installed at {}",
                    self.paths.backend_binary.display()
                ),
            });
            for stage in BACKEND_STAGES {
                plan.push(StageRecord {
                    stage,
                    status: StageStatus::Skipped,
                    detail: "backend already installed".to_string(),
                });
            }
        } else {
            plan.push(planned(Stage::DetectBackend, "no backend found".to_string()));
            let setup = if self.privilege_baseline_configured() {
                StageRecord {
                    stage: Stage::PrivilegeSetup,
                    status: StageStatus::Skipped,
                    detail: "baseline already configured".to_string(),
                }
            } else {
                planned(
                    Stage::PrivilegeSetup,
                    format!("prompt via {} unless elevation is cached", self.broker.name()),
                )
            };
            plan.push(setup);
            plan.push(planned(
                Stage::FetchBackend,
                format!(
                    "download {} into {}",
                    backend_archive_url(self.cfg, &self.host.arch),
                    self.paths.backend_dir.display()
                ),
            ));
            plan.push(planned(
                Stage::PrivilegeGrant,
                format!("install {}", self.paths.privilege_rule_file.display()),
            ));
            plan.push(planned(
                Stage::ServiceUnit,
                format!(
                    "write {} and enable {}",
                    self.paths.unit_file.display(),
                    self.cfg.service.unit_name
                ),
            ));
        }
        plan.push(planned(
            Stage::RuntimeCheck,
            format!("require `{}` on PATH", self.cfg.package.command),
        ));
        plan.push(planned(
            Stage::ResolveBundle,
            format!(
                "fetch {} from {}",
                self.cfg.release.bundle_asset, self.cfg.release.index_url
            ),
        ));
        plan.push(planned(
            Stage::RuntimeDependency,
            format!(
                "install {} from {}",
                self.cfg.package.runtime_ref, self.cfg.package.remote
            ),
        ));
        plan.push(planned(
            Stage::BundleInstall,
            format!("install {}", self.cfg.package.app_id),
        ));
        plan.push(planned(
            Stage::Icon,
            format!("write {}", self.paths.icon_path.display()),
        ));
        plan.push(planned(
            Stage::Shortcut,
            format!(
                "write {} (version {})",
                self.paths.shortcut_path.display(),
                self.resolved_version()
            ),
        ));
        plan
    }

    fn install_report(
        &self,
        outcome: InstallOutcome,
        version: Option<String>,
        release_tag: Option<String>,
    ) -> InstallReport {
        InstallReport {
            outcome,
            version,
            release_tag,
            stages: self.stages.clone(),
            warnings: self.warnings.clone(),
            finished_at: Utc::now(),
        }
    }

    fn resolved_version(&self) -> String {
        read_version_marker(
            &self.paths.version_marker,
            &self.cfg.shortcut.default_version,
        )
    }

    fn provision_backend(&mut self) -> Result<(), InstallError> {
        self.ensure_privilege_baseline()?;
        self.fetch_backend()?;
        self.register_grant()?;
        self.register_service()
    }

    fn ensure_privilege_baseline(&mut self) -> Result<(), InstallError> {
        if self.privilege_baseline_configured() {
            self.record(
                Stage::PrivilegeSetup,
                StageStatus::Skipped,
                "privilege baseline already configured",
            );
            return Ok(());
        }
        match self.broker.request_one_time_setup() {
            Decision::Granted => {
                let stamp = format!("{}\n", Utc::now().to_rfc3339());
                if let Err(err) =
                    desktop::write_atomic(&self.paths.baseline_marker, stamp.as_bytes(), Some(0o600))
                {
                    self.warn(format!(
                        "could not record privilege baseline at {}: {err}",
                        self.paths.baseline_marker.display()
                    ));
                }
                let detail = format!("granted via {}", self.broker.name());
                self.record(Stage::PrivilegeSetup, StageStatus::Done, detail);
                Ok(())
            }
            decision => Err(self.fail(InstallError::PrivilegeSetupDeclined { decision })),
        }
    }

    fn fetch_backend(&mut self) -> Result<(), InstallError> {
        let (cfg, paths) = (self.cfg, self.paths);
        let url = backend_archive_url(cfg, &self.host.arch);
        let archive = paths.download_dir.join(BACKEND_ARCHIVE_NAME);
        let fetch_failed = |message: String| InstallError::BackendFetchFailed { message };

        if let Err(err) = self.transport.download(&url, &archive) {
            return Err(self.fail(fetch_failed(err.to_string())));
        }
        for dir in [&paths.backend_dir, &paths.networks_dir] {
            if let Err(err) = fs::create_dir_all(dir) {
                return Err(self.fail(fetch_failed(format!(
                    "failed to create {}: {err}",
                    dir.display()
                ))));
            }
        }
        if let Err(err) = extract_tarball(self.runner, &archive, &paths.backend_dir) {
            return Err(self.fail(fetch_failed(err.to_string())));
        }
        if !self.backend_present() {
            return Err(self.fail(fetch_failed(format!(
                "archive did not contain {}",
                cfg.backend.binary_name
            ))));
        }
        if let Err(err) = make_executable(&paths.backend_binary) {
            return Err(self.fail(fetch_failed(format!(
                "failed to mark {} executable: {err}",
                paths.backend_binary.display()
            ))));
        }
        if !paths.backend_cli.exists() {
            // zerotier-one acts as the CLI when invoked under that name.
            if let Err(err) = link_cli(&cfg.backend.binary_name, &paths.backend_cli) {
                self.warn(format!(
                    "could not create {}: {err}",
                    paths.backend_cli.display()
                ));
            }
        }
        if let Err(err) = fs::remove_file(&archive) {
            self.warn(format!(
                "could not remove {}: {err}",
                archive.display()
            ));
        }
        let detail = format!("{url} -> {}", paths.backend_dir.display());
        self.record(Stage::FetchBackend, StageStatus::Done, detail);
        Ok(())
    }

    fn register_grant(&mut self) -> Result<(), InstallError> {
        let staged = self.paths.state_dir.join(STAGED_RULE_NAME);
        let rule = render_privilege_rule(&self.host.principal, self.paths);
        if let Err(err) = desktop::write_atomic(&staged, rule.as_bytes(), Some(0o600)) {
            return Err(self.fail(InstallError::PrivilegeGrantFailed {
                message: format!("failed to stage rule at {}: {err}", staged.display()),
                exit_code: None,
            }));
        }
        let ops = [
            ElevatedOp::CheckSudoers {
                path: staged.clone(),
            },
            ElevatedOp::InstallFile {
                source: staged.clone(),
                dest: self.paths.privilege_rule_file.clone(),
                mode: 0o440,
            },
        ];
        let result = self.broker.run_elevated_batch(&ops);
        if let Err(err) = desktop::remove_if_present(&staged) {
            self.warn(format!("could not remove {}: {err}", staged.display()));
        }
        if let Err(err) = result {
            return Err(self.fail(InstallError::PrivilegeGrantFailed {
                message: err.to_string(),
                exit_code: err.exit_code(),
            }));
        }
        let detail = format!(
            "{} for {}",
            self.paths.privilege_rule_file.display(),
            self.host.principal.sudoers_subject()
        );
        self.record(Stage::PrivilegeGrant, StageStatus::Done, detail);
        Ok(())
    }

    fn register_service(&mut self) -> Result<(), InstallError> {
        let supervisor = self.supervisor();
        let mut replaced = false;
        if supervisor.is_enabled() || supervisor.is_active() {
            replaced = true;
            if let Err(err) = supervisor.stop() {
                self.warn(format!("could not stop the previous unit: {err}"));
            }
            if let Err(err) = supervisor.disable() {
                self.warn(format!("could not disable the previous unit: {err}"));
            }
        }

        let mut exec = self.broker.exec_prefix();
        exec.push(self.paths.backend_binary.to_string_lossy().to_string());
        exec.push(self.paths.backend_dir.to_string_lossy().to_string());
        let unit = render_unit(&UnitSpec {
            description: "ZeroTier One (user service)",
            working_dir: &self.paths.backend_dir,
            exec: &exec,
            restart_sec: self.cfg.service.restart_sec,
        });
        if let Err(err) = desktop::write_atomic(&self.paths.unit_file, unit.as_bytes(), Some(0o644))
        {
            return Err(self.fail(InstallError::ServiceRegistrationFailed {
                message: format!("failed to write {}: {err}", self.paths.unit_file.display()),
                exit_code: None,
            }));
        }
        let activation = supervisor
            .daemon_reload()
            .and_then(|_| supervisor.enable_now());
        if let Err(err) = activation {
            return Err(self.fail(InstallError::ServiceRegistrationFailed {
                message: err.to_string(),
                exit_code: err.exit_code(),
            }));
        }
        let detail = if replaced {
            format!("{} replaced and started", supervisor.unit())
        } else {
            format!("{} enabled and started", supervisor.unit())
        };
        self.record(Stage::ServiceUnit, StageStatus::Done, detail);
        Ok(())
    }

    fn install_frontend(&mut self) -> Result<(ResolvedArtifact, String), InstallError> {
        let package = self.package();
        if !package.available() {
            return Err(self.fail(InstallError::RuntimeMissing {
                command: self.cfg.package.command.clone(),
            }));
        }
        self.record(
            Stage::RuntimeCheck,
            StageStatus::Done,
            format!("`{}` found", self.cfg.package.command),
        );

        let artifact = self.fetch_bundle()?;
        let bundle = self.paths.download_dir.join(&artifact.name);

        if let Err(err) =
            package.install_runtime(&self.cfg.package.remote, &self.cfg.package.runtime_ref)
        {
            return Err(self.fail(InstallError::RuntimeDependencyInstallFailed {
                message: err.to_string(),
                exit_code: err.exit_code(),
            }));
        }
        self.record(
            Stage::RuntimeDependency,
            StageStatus::Done,
            self.cfg.package.runtime_ref.clone(),
        );

        if let Err(err) = package.install_bundle(&bundle) {
            return Err(self.fail(InstallError::BundleInstallFailed {
                message: err.to_string(),
                exit_code: err.exit_code(),
            }));
        }
        if let Err(err) = fs::remove_file(&bundle) {
            self.warn(format!("could not remove {}: {err}", bundle.display()));
        }
        let detail = format!("{} {}", self.cfg.package.app_id, artifact.tag);
        self.record(Stage::BundleInstall, StageStatus::Done, detail);

        self.fetch_icon();
        let version = self.write_shortcut();
        Ok((artifact, version))
    }

    fn fetch_bundle(&mut self) -> Result<ResolvedArtifact, InstallError> {
        let artifact = match resolve_latest_artifact(
            self.transport,
            &self.cfg.release.index_url,
            &self.cfg.release.bundle_asset,
        ) {
            Ok(artifact) => artifact,
            Err(err @ (ReleaseError::NoMatchingAsset { .. } | ReleaseError::Malformed(_))) => {
                return Err(self.fail(InstallError::ArtifactNotFound {
                    message: err.to_string(),
                }))
            }
            Err(err @ ReleaseError::Index(_)) => {
                return Err(self.fail(InstallError::ArtifactDownloadFailed {
                    message: err.to_string(),
                }))
            }
        };
        let dest = self.paths.download_dir.join(&artifact.name);
        if let Err(err) = self.transport.download(&artifact.url, &dest) {
            return Err(self.fail(InstallError::ArtifactDownloadFailed {
                message: err.to_string(),
            }));
        }
        let detail = format!("{} from release {}", artifact.name, artifact.tag);
        self.record(Stage::ResolveBundle, StageStatus::Done, detail);
        Ok(artifact)
    }

    fn fetch_icon(&mut self) {
        match self
            .transport
            .download(&self.cfg.release.icon_url, &self.paths.icon_path)
        {
            Ok(_) => {
                let detail = self.paths.icon_path.display().to_string();
                self.record(Stage::Icon, StageStatus::Done, detail);
            }
            Err(err) => {
                let message = format!("icon not fetched: {err}");
                self.warn(message.clone());
                self.record(Stage::Icon, StageStatus::Warning, message);
            }
        }
    }

    fn write_shortcut(&mut self) -> String {
        let version = self.resolved_version();
        let spec = ShortcutSpec {
            name: &self.cfg.shortcut.name,
            version: &version,
            app_id: &self.cfg.package.app_id,
            package_command: &self.cfg.package.command,
            icon_path: &self.paths.icon_path,
        };
        match desktop::write_shortcut(&self.paths.shortcut_path, &spec) {
            Ok(()) => {
                let detail = format!("{} (version {version})", self.paths.shortcut_path.display());
                self.record(Stage::Shortcut, StageStatus::Done, detail);
            }
            Err(err) => {
                let message = format!(
                    "could not write {}: {err}",
                    self.paths.shortcut_path.display()
                );
                self.warn(message.clone());
                self.record(Stage::Shortcut, StageStatus::Warning, message);
            }
        }
        version
    }
}

fn make_executable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn link_cli(binary_name: &str, cli: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(binary_name, cli)
    }
    #[cfg(not(unix))]
    {
        let _ = (binary_name, cli);
        Ok(())
    }
}
