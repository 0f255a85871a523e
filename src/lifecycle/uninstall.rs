use super::{
    BundleRemoval, BundleRemovalOutcome, Lifecycle, Stage, StageRecord, StageStatus,
    UninstallError, UninstallReport,
};
use crate::broker::{BrokerError, ElevatedOp};
use crate::desktop;
use crate::package::RemovalHandle;
use crate::runner::CommandRunner;
use chrono::Utc;
use std::path::Path;

impl<R: CommandRunner> Lifecycle<'_, R> {
    /// Tears everything down. Only a backend that survives removal is fatal, and
    /// even then the bundle, shortcut and icon are still removed.
    pub fn uninstall(&mut self, removal: BundleRemoval) -> Result<UninstallReport, UninstallError> {
        self.reset();
        let paths = self.paths;
        let fatal = if self.backend_present() {
            self.stop_unit(Stage::StopService);
            self.remove_backend_files().err()
        } else {
            self.record(Stage::StopService, StageStatus::Skipped, "backend not installed");
            self.record(Stage::RemoveBackend, StageStatus::Skipped, "backend not installed");
            None
        };

        let bundle_removal = if self.runtime_available() {
            let detail = format!("`{}` found", self.cfg.package.command);
            self.record(Stage::RuntimeCheck, StageStatus::Done, detail);
            self.remove_bundle(removal)
        } else {
            let message = format!(
                "package runtime `{}` not found; bundle removal skipped",
                self.cfg.package.command
            );
            self.warn(message.clone());
            self.record(Stage::RuntimeCheck, StageStatus::Warning, message);
            self.record(
                Stage::BundleRemoval,
                StageStatus::Skipped,
                "package runtime unavailable",
            );
            BundleRemovalOutcome::Skipped
        };

        self.remove_file_stage(Stage::RemoveShortcut, &paths.shortcut_path);
        self.remove_file_stage(Stage::RemoveIcon, &paths.icon_path);

        match fatal {
            Some(err) => Err(err),
            None => Ok(UninstallReport {
                stages: self.stages.clone(),
                warnings: self.warnings.clone(),
                bundle_removal,
                finished_at: Utc::now(),
            }),
        }
    }

    pub fn plan_uninstall(&self, removal: BundleRemoval) -> Vec<StageRecord> {
        let paths = self.paths;
        let entry = |stage, status, detail: String| StageRecord {
            stage,
            status,
            detail,
        };
        let mut plan = Vec::new();
        if self.backend_present() {
            plan.push(entry(
                Stage::StopService,
                StageStatus::Planned,
                format!("stop and disable {}", self.cfg.service.unit_name),
            ));
            plan.push(entry(
                Stage::RemoveBackend,
                StageStatus::Planned,
                format!(
                    "remove {}, {} and {} via {}",
                    paths.backend_dir.display(),
                    paths.unit_file.display(),
                    paths.privilege_rule_file.display(),
                    self.broker.name()
                ),
            ));
        } else {
            for stage in [Stage::StopService, Stage::RemoveBackend] {
                plan.push(entry(
                    stage,
                    StageStatus::Skipped,
                    "backend not installed".to_string(),
                ));
            }
        }
        if self.runtime_available() {
            plan.push(entry(
                Stage::RuntimeCheck,
                StageStatus::Planned,
                format!("require `{}` on PATH", self.cfg.package.command),
            ));
            let how = match removal {
                BundleRemoval::Detach => {
                    format!("in the background, log at {}", paths.uninstall_log.display())
                }
                BundleRemoval::Wait => "and wait for completion".to_string(),
            };
            plan.push(entry(
                Stage::BundleRemoval,
                StageStatus::Planned,
                format!("uninstall {} {how}", self.cfg.package.app_id),
            ));
        } else {
            plan.push(entry(
                Stage::RuntimeCheck,
                StageStatus::Warning,
                format!("package runtime `{}` not found", self.cfg.package.command),
            ));
            plan.push(entry(
                Stage::BundleRemoval,
                StageStatus::Skipped,
                "package runtime unavailable".to_string(),
            ));
        }
        for (stage, path) in [
            (Stage::RemoveShortcut, &paths.shortcut_path),
            (Stage::RemoveIcon, &paths.icon_path),
        ] {
            if path.is_file() {
                plan.push(entry(
                    stage,
                    StageStatus::Planned,
                    format!("delete {}", path.display()),
                ));
            } else {
                plan.push(entry(
                    stage,
                    StageStatus::Skipped,
                    format!("{} not present", path.display()),
                ));
            }
        }
        plan
    }

    /// Best-effort stop and disable of the user unit.
    pub(super) fn stop_unit(&mut self, stage: Stage) {
        let supervisor = self.supervisor();
        if !supervisor.is_active() && !supervisor.is_enabled() {
            let detail = format!("{} is not running", supervisor.unit());
            self.record(stage, StageStatus::Skipped, detail);
            return;
        }
        let mut problems = Vec::new();
        if let Err(err) = supervisor.stop() {
            problems.push(format!("could not stop {}: {err}", supervisor.unit()));
        }
        if let Err(err) = supervisor.disable() {
            problems.push(format!("could not disable {}: {err}", supervisor.unit()));
        }
        if problems.is_empty() {
            let detail = format!("{} stopped and disabled", supervisor.unit());
            self.record(stage, StageStatus::Done, detail);
        } else {
            for problem in &problems {
                self.warn(problem.clone());
            }
            self.record(stage, StageStatus::Warning, problems.join("; "));
        }
    }

    fn remove_backend_files(&mut self) -> Result<(), UninstallError> {
        let paths = self.paths;
        let ops = [
            ElevatedOp::RemovePath {
                path: paths.backend_dir.clone(),
            },
            ElevatedOp::RemovePath {
                path: paths.unit_file.clone(),
            },
            ElevatedOp::RemovePath {
                path: paths.privilege_rule_file.clone(),
            },
        ];
        let mut failures = Vec::new();
        let mut exit_code = None;
        if self.broker.supports_batching() {
            if let Err(err) = self.broker.run_elevated_batch(&ops) {
                exit_code = err.exit_code();
                match &err {
                    BrokerError::Denied | BrokerError::TimedOut => {
                        failures.push(format!("elevated removal not authorized: {err}"));
                    }
                    _ => {
                        self.warn(format!("batched removal failed ({err}); retrying each path"));
                        failures = self.remove_each(&ops);
                    }
                }
            }
        } else {
            failures = self.remove_each(&ops);
        }
        for failure in &failures {
            self.warn(failure.clone());
        }
        if let Err(err) = self.supervisor().daemon_reload() {
            self.warn(format!("supervisor reload failed: {err}"));
        }

        if self.backend_present() {
            let message = if failures.is_empty() {
                "backend files remain after removal".to_string()
            } else {
                failures.join("; ")
            };
            let err = UninstallError::BackendRemovalFailed {
                path: paths.backend_dir.clone(),
                message,
                exit_code,
            };
            self.record(Stage::RemoveBackend, StageStatus::Failed, err.to_string());
            return Err(err);
        }
        if failures.is_empty() {
            let detail = format!(
                "removed {}, {} and {}",
                paths.backend_dir.display(),
                paths.unit_file.display(),
                paths.privilege_rule_file.display()
            );
            self.record(Stage::RemoveBackend, StageStatus::Done, detail);
        } else {
            self.record(Stage::RemoveBackend, StageStatus::Warning, failures.join("; "));
        }
        Ok(())
    }

    fn remove_each(&self, ops: &[ElevatedOp]) -> Vec<String> {
        ops.iter()
            .filter_map(|op| {
                self.broker
                    .run_elevated_batch(std::slice::from_ref(op))
                    .err()
                    .map(|err| format!("could not remove {}: {err}", op.target().display()))
            })
            .collect()
    }

    fn remove_bundle(&mut self, removal: BundleRemoval) -> BundleRemovalOutcome {
        let (cfg, paths) = (self.cfg, self.paths);
        let package = self.package();
        let result = match removal {
            BundleRemoval::Wait => package.uninstall(&cfg.package.app_id),
            BundleRemoval::Detach => {
                package.uninstall_detached(&cfg.package.app_id, &paths.uninstall_log)
            }
        };
        match result {
            Ok(RemovalHandle::Completed) => {
                let detail = format!("{} removed", cfg.package.app_id);
                self.record(Stage::BundleRemoval, StageStatus::Done, detail);
                BundleRemovalOutcome::Completed
            }
            Ok(RemovalHandle::Detached { pid, log_path }) => {
                let detail = format!(
                    "removal of {} running as pid {pid}, log at {}",
                    cfg.package.app_id,
                    log_path.display()
                );
                self.record(Stage::BundleRemoval, StageStatus::Launched, detail);
                BundleRemovalOutcome::Launched { pid, log_path }
            }
            Err(err) => {
                let message = format!("bundle removal failed: {err}");
                self.warn(message.clone());
                self.record(Stage::BundleRemoval, StageStatus::Warning, message.clone());
                BundleRemovalOutcome::Failed { message }
            }
        }
    }

    fn remove_file_stage(&mut self, stage: Stage, path: &Path) {
        match desktop::remove_if_present(path) {
            Ok(true) => {
                self.record(stage, StageStatus::Done, format!("removed {}", path.display()))
            }
            Ok(false) => self.record(
                stage,
                StageStatus::Skipped,
                format!("{} not present", path.display()),
            ),
            Err(err) => {
                let message = format!("could not remove {}: {err}", path.display());
                self.warn(message.clone());
                self.record(stage, StageStatus::Warning, message);
            }
        }
    }
}
