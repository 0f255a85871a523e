mod archive;
mod broker;
mod config;
mod desktop;
mod error;
mod lifecycle;
mod package;
mod runner;
mod status;
mod supervisor;
mod transport;

use crate::broker::{Consent, PolkitBroker, PrivilegeBroker, SudoBroker};
use crate::config::{
    backend_arch, ensure_parent, load_config, required_home_dir, resolve_config_path, BrokerKind,
    Config, LayoutPaths, DEFAULT_CONFIG_YAML,
};
use crate::error::{AppError, ErrorDetails};
use crate::lifecycle::{
    BundleRemoval, BundleRemovalOutcome, Collaborators, HostInfo, InstallOutcome, InstallReport,
    Lifecycle, Principal, Progress, StageRecord, UninstallReport,
};
use crate::runner::SystemRunner;
use crate::status::{collect_status, StatusReport};
use crate::transport::HttpTransport;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ztgui",
    version,
    about = "Install, repair and remove the ZeroTier GUI and its user-level backend"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision the backend service, then install the GUI bundle and shortcut.
    Install {
        /// Skip the confirmation before the one-time privilege prompt.
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove the backend, service unit, privilege rule, bundle and shortcut.
    Uninstall {
        /// Wait for the bundle removal instead of running it in the background.
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Stop the service and provision the backend again from scratch.
    ReinstallBackend {
        #[arg(long)]
        yes: bool,
    },
    Status,
    Paths,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

struct Context {
    config_path: PathBuf,
    json: bool,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

/// A command error plus whatever the lifecycle got through before it.
struct CommandFailure {
    error: AppError,
    progress: Option<Progress>,
}

impl From<AppError> for CommandFailure {
    fn from(error: AppError) -> Self {
        Self {
            error,
            progress: None,
        }
    }
}

type CommandResult = Result<(), CommandFailure>;

/// Loaded config with every path resolved against `$HOME`.
struct Setup {
    cfg: Config,
    paths: LayoutPaths,
    config_exists: bool,
}

fn main() -> Result<(), AppError> {
    init_tracing();
    let cli = Cli::parse();
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };
    let runner = SystemRunner;

    let result = match cli.command {
        Commands::Install { yes, dry_run } => handle_install(&ctx, &runner, yes, dry_run),
        Commands::Uninstall { wait, dry_run } => handle_uninstall(&ctx, &runner, wait, dry_run),
        Commands::ReinstallBackend { yes } => handle_reinstall_backend(&ctx, &runner, yes),
        Commands::Status => handle_status(&ctx, &runner),
        Commands::Paths => handle_paths(&ctx).map_err(CommandFailure::from),
        Commands::Config { command } => handle_config(&ctx, command).map_err(CommandFailure::from),
    };

    if let Err(failure) = result {
        if ctx.json {
            let payload = JsonResult {
                ok: false,
                result: failure.progress,
                error: Some(failure.error.to_string()),
                error_details: failure.error.details(),
            };
            print_json(&payload)?;
        } else {
            if let Some(progress) = &failure.progress {
                print_stages(&progress.stages);
                print_warnings(&progress.warnings);
            }
            eprintln!("error: {}", failure.error);
            if let Some(hint) = failure.error.details().and_then(|d| d.hint) {
                eprintln!("hint: {hint}");
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ZTGUI_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_setup(ctx: &Context) -> Result<Setup, AppError> {
    let (cfg, config_exists) = load_config(&ctx.config_path)?;
    let home = required_home_dir()?;
    let paths = LayoutPaths::resolve(&cfg, &home)?;
    debug!(config = %ctx.config_path.display(), exists = config_exists, "config loaded");
    Ok(Setup {
        cfg,
        paths,
        config_exists,
    })
}

fn detect_host(runner: &SystemRunner, arch: &str) -> Result<HostInfo, AppError> {
    let principal = Principal::detect(runner)
        .or_else(|| {
            env::var("USER")
                .ok()
                .filter(|user| !user.trim().is_empty())
                .map(|user| Principal { user, group: None })
        })
        .ok_or_else(|| {
            AppError::Config("unable to determine the current user (`id -un` failed)".to_string())
        })?;
    Ok(HostInfo {
        principal,
        arch: arch.to_string(),
    })
}

fn build_broker<'a>(
    cfg: &Config,
    runner: &'a SystemRunner,
    consent: Consent,
) -> Box<dyn PrivilegeBroker + 'a> {
    match cfg.privilege.broker {
        BrokerKind::Sudo => Box::new(SudoBroker::new(runner, consent, cfg.prompt_timeout())),
        BrokerKind::Polkit => Box::new(PolkitBroker::new(runner, consent, cfg.prompt_timeout())),
    }
}

fn handle_install(ctx: &Context, runner: &SystemRunner, yes: bool, dry_run: bool) -> CommandResult {
    let setup = load_setup(ctx)?;
    let host = detect_host(runner, backend_arch()?)?;
    let broker = build_broker(&setup.cfg, runner, Consent::detect(yes));
    let transport = HttpTransport::new().map_err(AppError::from)?;
    let mut lifecycle = Lifecycle::new(
        &setup.cfg,
        &setup.paths,
        host,
        Collaborators {
            runner,
            broker: broker.as_ref(),
            transport: &transport,
        },
    );

    if dry_run {
        let plan = lifecycle.plan_install();
        return Ok(emit_plan(ctx, "install", &plan)?);
    }
    match lifecycle.install() {
        Ok(report) => Ok(emit_install(ctx, &report)?),
        Err(err) => Err(CommandFailure {
            progress: Some(lifecycle.progress()),
            error: err.into(),
        }),
    }
}

fn handle_reinstall_backend(ctx: &Context, runner: &SystemRunner, yes: bool) -> CommandResult {
    let setup = load_setup(ctx)?;
    let host = detect_host(runner, backend_arch()?)?;
    let broker = build_broker(&setup.cfg, runner, Consent::detect(yes));
    let transport = HttpTransport::new().map_err(AppError::from)?;
    let mut lifecycle = Lifecycle::new(
        &setup.cfg,
        &setup.paths,
        host,
        Collaborators {
            runner,
            broker: broker.as_ref(),
            transport: &transport,
        },
    );
    match lifecycle.reinstall_backend() {
        Ok(report) => Ok(emit_install(ctx, &report)?),
        Err(err) => Err(CommandFailure {
            progress: Some(lifecycle.progress()),
            error: err.into(),
        }),
    }
}

fn handle_uninstall(ctx: &Context, runner: &SystemRunner, wait: bool, dry_run: bool) -> CommandResult {
    let setup = load_setup(ctx)?;
    let host = detect_host(runner, env::consts::ARCH)?;
    let broker = build_broker(&setup.cfg, runner, Consent::Assumed);
    let transport = HttpTransport::new().map_err(AppError::from)?;
    let mut lifecycle = Lifecycle::new(
        &setup.cfg,
        &setup.paths,
        host,
        Collaborators {
            runner,
            broker: broker.as_ref(),
            transport: &transport,
        },
    );
    let removal = if wait {
        BundleRemoval::Wait
    } else {
        BundleRemoval::Detach
    };

    if dry_run {
        let plan = lifecycle.plan_uninstall(removal);
        return Ok(emit_plan(ctx, "uninstall", &plan)?);
    }
    match lifecycle.uninstall(removal) {
        Ok(report) => Ok(emit_uninstall(ctx, &report)?),
        Err(err) => Err(CommandFailure {
            progress: Some(lifecycle.progress()),
            error: err.into(),
        }),
    }
}

fn handle_status(ctx: &Context, runner: &SystemRunner) -> CommandResult {
    let setup = load_setup(ctx)?;
    let host = detect_host(runner, env::consts::ARCH)?;
    let broker = build_broker(&setup.cfg, runner, Consent::detect(false));
    let transport = HttpTransport::new().map_err(AppError::from)?;
    let lifecycle = Lifecycle::new(
        &setup.cfg,
        &setup.paths,
        host,
        Collaborators {
            runner,
            broker: broker.as_ref(),
            transport: &transport,
        },
    );
    let report = collect_status(&lifecycle, runner, &setup.cfg, &setup.paths);
    Ok(emit_status(ctx, &report)?)
}

fn handle_paths(ctx: &Context) -> Result<(), AppError> {
    let setup = load_setup(ctx)?;
    if ctx.json {
        return print_ok(json!({
            "config_path": ctx.config_path,
            "config_exists": setup.config_exists,
            "paths": setup.paths,
        }));
    }
    let value = serde_json::to_value(&setup.paths)?;
    println!(
        "config_path: {}{}",
        ctx.config_path.display(),
        if setup.config_exists { "" } else { " (missing; using defaults)" }
    );
    if let Some(map) = value.as_object() {
        for (key, path) in map {
            println!("{key}: {}", path.as_str().unwrap_or_default());
        }
    }
    Ok(())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), AppError> {
    match command {
        ConfigCommand::Init => {
            let created = if ctx.config_path.exists() {
                false
            } else {
                ensure_parent(&ctx.config_path)?;
                fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
                true
            };
            if ctx.json {
                return print_ok(json!({"path": ctx.config_path, "created": created}));
            }
            if created {
                println!("wrote {}", ctx.config_path.display());
            } else {
                println!("{} already exists; left unchanged", ctx.config_path.display());
            }
            Ok(())
        }
        ConfigCommand::Validate => {
            let (_cfg, exists) = load_config(&ctx.config_path)?;
            if ctx.json {
                return print_ok(json!({"path": ctx.config_path, "exists": exists, "valid": true}));
            }
            if exists {
                println!("{} is valid", ctx.config_path.display());
            } else {
                println!(
                    "{} does not exist; built-in defaults are valid",
                    ctx.config_path.display()
                );
            }
            Ok(())
        }
    }
}

fn emit_plan(ctx: &Context, operation: &str, plan: &[StageRecord]) -> Result<(), AppError> {
    if ctx.json {
        return print_ok(json!({"operation": operation, "dry_run": true, "stages": plan}));
    }
    println!("{operation} plan (dry run, nothing changed):");
    print_stages(plan);
    Ok(())
}

fn emit_install(ctx: &Context, report: &InstallReport) -> Result<(), AppError> {
    if ctx.json {
        return print_ok(report);
    }
    print_stages(&report.stages);
    print_warnings(&report.warnings);
    let version = report.version.as_deref().unwrap_or("");
    match report.outcome {
        InstallOutcome::FreshlyInstalled => println!("ZeroTier GUI {version} installed."),
        InstallOutcome::AlreadyInstalled => println!(
            "Backend was already installed; ZeroTier GUI {version} refreshed."
        ),
        InstallOutcome::BackendReinstalled => println!("Backend reinstalled and started."),
    }
    Ok(())
}

fn emit_uninstall(ctx: &Context, report: &UninstallReport) -> Result<(), AppError> {
    if ctx.json {
        return print_ok(report);
    }
    print_stages(&report.stages);
    print_warnings(&report.warnings);
    match &report.bundle_removal {
        BundleRemovalOutcome::Launched { log_path, .. } => println!(
            "Uninstalled. Bundle removal continues in the background; see {}.",
            log_path.display()
        ),
        _ => println!("Uninstalled."),
    }
    Ok(())
}

fn emit_status(ctx: &Context, report: &StatusReport) -> Result<(), AppError> {
    if ctx.json {
        return print_ok(report);
    }
    println!("state: {}", report.state.as_str());
    println!("version: {}", report.version);
    println!("backend health: {}", report.health.status.as_str());
    if let Some(networks) = report.health.networks {
        println!("joined networks: {networks}");
    }
    for check in &report.checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!("[{state}] {} ({}) - {}", check.id, check.severity, check.message);
        if let Some(remediation) = &check.remediation {
            println!("  remediation: {remediation}");
        }
    }
    Ok(())
}

fn print_stages(stages: &[StageRecord]) {
    for record in stages {
        println!(
            "[{:>8}] {}: {}",
            record.status.as_str(),
            record.stage.title(),
            record.detail
        );
    }
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

fn print_ok<T: Serialize>(result: T) -> Result<(), AppError> {
    print_json(&JsonResult {
        ok: true,
        result: Some(result),
        error: None,
        error_details: None,
    })
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
