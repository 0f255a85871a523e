//! Elevation through `sudo` (terminal prompt) or `pkexec` (polkit agent).
//!
//! The lifecycle only sees the [`PrivilegeBroker`] trait: a one-time setup
//! prompt that yields a [`Decision`], and an elevated batch of file operations
//! that runs under a single authorization.

use crate::argv;
use crate::runner::{render_command, CommandRunner};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Granted,
    Denied,
    TimedOut,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Granted => "granted",
            Decision::Denied => "denied",
            Decision::TimedOut => "timed_out",
        }
    }
}

/// Whether the one-time setup may ask the user before prompting for a password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    /// `--yes`: go straight to the elevation prompt.
    Assumed,
    /// Ask on the terminal before prompting.
    Ask,
    /// No terminal and no `--yes`: the setup is declined.
    Unattended,
}

impl Consent {
    pub fn detect(assume_yes: bool) -> Self {
        if assume_yes {
            Consent::Assumed
        } else if io::stdin().is_terminal() {
            Consent::Ask
        } else {
            Consent::Unattended
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevatedOp {
    /// `visudo -c` on a staged rule file; a broken sudoers file locks sudo out.
    CheckSudoers { path: PathBuf },
    InstallFile {
        source: PathBuf,
        dest: PathBuf,
        mode: u32,
    },
    RemovePath { path: PathBuf },
}

impl ElevatedOp {
    pub fn shell(&self) -> String {
        match self {
            ElevatedOp::CheckSudoers { path } => format!(
                "visudo -c -q -f {}",
                shell_single_quote(&path.to_string_lossy())
            ),
            ElevatedOp::InstallFile { source, dest, mode } => format!(
                "install -D -m {:04o} -o root -g root {} {}",
                mode,
                shell_single_quote(&source.to_string_lossy()),
                shell_single_quote(&dest.to_string_lossy())
            ),
            ElevatedOp::RemovePath { path } => format!(
                "rm -rf -- {}",
                shell_single_quote(&path.to_string_lossy())
            ),
        }
    }

    pub fn target(&self) -> &Path {
        match self {
            ElevatedOp::CheckSudoers { path } => path.as_path(),
            ElevatedOp::InstallFile { dest, .. } => dest.as_path(),
            ElevatedOp::RemovePath { path } => path.as_path(),
        }
    }
}

pub fn batch_script(ops: &[ElevatedOp]) -> String {
    let mut script = String::from("set -e");
    for op in ops {
        script.push('\n');
        script.push_str(&op.shell());
    }
    script.push('\n');
    script
}

pub fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("elevation was denied")]
    Denied,
    #[error("elevation prompt timed out")]
    TimedOut,
    #[error("elevated command `{command}` exited with status {status_code}{}", stderr_suffix(.stderr))]
    Failed {
        command: String,
        status_code: i32,
        stderr: String,
    },
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl BrokerError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BrokerError::Failed { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

pub trait PrivilegeBroker {
    fn name(&self) -> &'static str;

    /// True when elevation currently works without a prompt. Must not prompt.
    fn elevation_cached(&self) -> bool;

    fn request_one_time_setup(&self) -> Decision;

    fn supports_batching(&self) -> bool {
        true
    }

    fn run_elevated_batch(&self, ops: &[ElevatedOp]) -> Result<(), BrokerError>;

    /// Elevated argv prefix the service unit uses at start time.
    fn exec_prefix(&self) -> Vec<String>;
}

fn confirm_setup(consent: Consent, broker: &'static str, timeout: Duration) -> Decision {
    match consent {
        Consent::Assumed => Decision::Granted,
        Consent::Unattended => {
            warn!("stdin is not a terminal; declining privilege setup (pass --yes to allow)");
            Decision::Denied
        }
        Consent::Ask => answer_within(timeout, move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!(
                    "Administrator access is needed once (via {broker}) to register the ZeroTier backend. Continue?"
                ))
                .default(true)
                .interact()
        }),
    }
}

/// Waits at most `timeout` for `ask`; an unanswered prompt is abandoned on its thread.
fn answer_within<F>(timeout: Duration, ask: F) -> Decision
where
    F: FnOnce() -> Result<bool, dialoguer::Error> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(ask());
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(true)) => Decision::Granted,
        Ok(Ok(false)) => Decision::Denied,
        Ok(Err(err)) => {
            warn!("confirmation prompt failed: {err}");
            Decision::Denied
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "no answer to the confirmation within {}s",
                timeout.as_secs()
            );
            Decision::TimedOut
        }
        Err(RecvTimeoutError::Disconnected) => Decision::Denied,
    }
}

fn classify_prompt_result(result: io::Result<crate::runner::CommandOutput>) -> Decision {
    match result {
        Ok(output) if output.success() => Decision::Granted,
        Ok(output) => {
            debug!(status = output.status_code, "elevation prompt refused");
            Decision::Denied
        }
        Err(err) if err.kind() == io::ErrorKind::TimedOut => Decision::TimedOut,
        Err(err) => {
            warn!("elevation prompt could not run: {err}");
            Decision::Denied
        }
    }
}

pub struct SudoBroker<'a, R: CommandRunner> {
    runner: &'a R,
    consent: Consent,
    timeout: Duration,
}

impl<'a, R: CommandRunner> SudoBroker<'a, R> {
    pub fn new(runner: &'a R, consent: Consent, timeout: Duration) -> Self {
        Self {
            runner,
            consent,
            timeout,
        }
    }

    /// The only step that may prompt. A refusal here is final, and the batch
    /// that follows runs with `-n` so its failures are never authentication.
    fn authenticate(&self) -> Result<(), BrokerError> {
        match self.runner.run_interactive("sudo", &argv!["-v"], self.timeout) {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => {
                debug!(status = output.status_code, "sudo authentication refused");
                Err(BrokerError::Denied)
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Err(BrokerError::TimedOut),
            Err(source) => Err(BrokerError::Launch {
                program: "sudo".to_string(),
                source,
            }),
        }
    }
}

impl<R: CommandRunner> PrivilegeBroker for SudoBroker<'_, R> {
    fn name(&self) -> &'static str {
        "sudo"
    }

    fn elevation_cached(&self) -> bool {
        self.runner
            .run("sudo", &argv!["-n", "true"])
            .map(|out| out.success())
            .unwrap_or(false)
    }

    fn request_one_time_setup(&self) -> Decision {
        match confirm_setup(self.consent, self.name(), self.timeout) {
            Decision::Granted => {}
            other => return other,
        }
        info!("requesting sudo credentials");
        classify_prompt_result(self.runner.run_interactive("sudo", &argv!["-v"], self.timeout))
    }

    fn run_elevated_batch(&self, ops: &[ElevatedOp]) -> Result<(), BrokerError> {
        if ops.is_empty() {
            return Ok(());
        }
        self.authenticate()?;
        let args = argv!["-n", "sh", "-c", batch_script(ops)];
        let command = render_command("sudo", &args);
        match self.runner.run("sudo", &args) {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(BrokerError::Failed {
                command,
                status_code: output.status_code,
                stderr: output.stderr_text(),
            }),
            Err(source) => Err(BrokerError::Launch {
                program: "sudo".to_string(),
                source,
            }),
        }
    }

    fn exec_prefix(&self) -> Vec<String> {
        argv!["/usr/bin/sudo", "-n"]
    }
}

// pkexec exit codes: 126 = dialog dismissed, 127 = not authorized.
const PKEXEC_DISMISSED: i32 = 126;
const PKEXEC_NOT_AUTHORIZED: i32 = 127;

pub struct PolkitBroker<'a, R: CommandRunner> {
    runner: &'a R,
    consent: Consent,
    timeout: Duration,
}

impl<'a, R: CommandRunner> PolkitBroker<'a, R> {
    pub fn new(runner: &'a R, consent: Consent, timeout: Duration) -> Self {
        Self {
            runner,
            consent,
            timeout,
        }
    }
}

impl<R: CommandRunner> PrivilegeBroker for PolkitBroker<'_, R> {
    fn name(&self) -> &'static str {
        "polkit"
    }

    fn elevation_cached(&self) -> bool {
        // pkexec has no non-interactive probe; only a recorded setup counts.
        false
    }

    fn request_one_time_setup(&self) -> Decision {
        match confirm_setup(self.consent, self.name(), self.timeout) {
            Decision::Granted => {}
            other => return other,
        }
        info!("requesting polkit authorization");
        classify_prompt_result(self.runner.run_interactive("pkexec", &argv!["true"], self.timeout))
    }

    fn run_elevated_batch(&self, ops: &[ElevatedOp]) -> Result<(), BrokerError> {
        if ops.is_empty() {
            return Ok(());
        }
        let args = argv!["sh", "-c", batch_script(ops)];
        let command = render_command("pkexec", &args);
        match self.runner.run_interactive("pkexec", &args, self.timeout) {
            Ok(output) if output.success() => Ok(()),
            Ok(output)
                if output.status_code == PKEXEC_DISMISSED
                    || output.status_code == PKEXEC_NOT_AUTHORIZED =>
            {
                Err(BrokerError::Denied)
            }
            Ok(output) => Err(BrokerError::Failed {
                command,
                status_code: output.status_code,
                stderr: output.stderr_text(),
            }),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Err(BrokerError::TimedOut),
            Err(source) => Err(BrokerError::Launch {
                program: "pkexec".to_string(),
                source,
            }),
        }
    }

    fn exec_prefix(&self) -> Vec<String> {
        // The unit starts non-interactively, so it still relies on the sudoers grant.
        argv!["/usr/bin/sudo", "-n"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::{fail, ok, CallMode, FakeRunner};

    fn ops() -> Vec<ElevatedOp> {
        vec![
            ElevatedOp::RemovePath {
                path: PathBuf::from("/home/deck/.zerotier-one"),
            },
            ElevatedOp::InstallFile {
                source: PathBuf::from("/tmp/staged rule"),
                dest: PathBuf::from("/etc/sudoers.d/zerotier-gui"),
                mode: 0o440,
            },
        ]
    }

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(shell_single_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn batch_script_is_fail_fast_and_ordered() {
        let script = batch_script(&ops());
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "set -e");
        assert_eq!(lines[1], "rm -rf -- '/home/deck/.zerotier-one'");
        assert_eq!(
            lines[2],
            "install -D -m 0440 -o root -g root '/tmp/staged rule' '/etc/sudoers.d/zerotier-gui'"
        );
    }

    #[test]
    fn check_sudoers_uses_visudo() {
        let op = ElevatedOp::CheckSudoers {
            path: PathBuf::from("/tmp/rule"),
        };
        assert_eq!(op.shell(), "visudo -c -q -f '/tmp/rule'");
        assert_eq!(op.target(), Path::new("/tmp/rule"));
    }

    #[test]
    fn sudo_batch_authenticates_once_then_runs_without_prompting() {
        let runner = FakeRunner::new();
        let broker = SudoBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        broker.run_elevated_batch(&ops()).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].line(), "sudo -v");
        assert_eq!(calls[0].mode, CallMode::Interactive);
        assert_eq!(calls[1].mode, CallMode::Captured);
        assert_eq!(calls[1].args[..2], ["-n".to_string(), "sh".to_string()]);
        assert!(calls[1].args[3].contains("rm -rf"));
    }

    #[test]
    fn sudo_refusal_is_denied_before_the_batch() {
        let runner = FakeRunner::new();
        runner.respond("sudo -v", fail(1, "Sorry, try again."));
        let broker = SudoBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        let err = broker.run_elevated_batch(&ops()).expect_err("refused");
        assert!(matches!(err, BrokerError::Denied));
        assert!(!runner.ran("sudo -n sh"));
    }

    #[test]
    fn sudo_batch_failure_carries_status() {
        let runner = FakeRunner::new();
        runner.respond("sudo -n sh", fail(1, "permission denied"));
        let broker = SudoBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        let err = broker.run_elevated_batch(&ops()).expect_err("failure");
        assert_eq!(err.exit_code(), Some(1));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn empty_batch_does_not_prompt() {
        let runner = FakeRunner::new();
        let broker = SudoBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        broker.run_elevated_batch(&[]).unwrap();
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn sudo_setup_maps_refusal_to_denied() {
        let runner = FakeRunner::new();
        runner.respond("sudo -v", fail(1, ""));
        let broker = SudoBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        assert_eq!(broker.request_one_time_setup(), Decision::Denied);
    }

    #[test]
    fn sudo_setup_granted_on_success() {
        let runner = FakeRunner::new();
        runner.respond("sudo -v", ok(""));
        let broker = SudoBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        assert_eq!(broker.request_one_time_setup(), Decision::Granted);
    }

    #[test]
    fn sudo_cached_probe_never_prompts() {
        let runner = FakeRunner::new();
        runner.respond("sudo -n true", fail(1, "a password is required"));
        let broker = SudoBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        assert!(!broker.elevation_cached());
        assert_eq!(runner.calls()[0].mode, CallMode::Captured);
    }

    #[test]
    fn sudo_prompt_timeout_is_timed_out() {
        let runner = FakeRunner::new();
        runner.stall("sudo -v");
        let broker = SudoBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        assert_eq!(broker.request_one_time_setup(), Decision::TimedOut);
        let err = broker.run_elevated_batch(&ops()).expect_err("timed out");
        assert!(matches!(err, BrokerError::TimedOut));
        assert!(!runner.ran("sudo -n sh"));
    }

    #[test]
    fn polkit_prompt_timeout_is_timed_out() {
        let runner = FakeRunner::new();
        runner.stall("pkexec");
        let broker = PolkitBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        assert_eq!(broker.request_one_time_setup(), Decision::TimedOut);
        let err = broker.run_elevated_batch(&ops()).expect_err("timed out");
        assert!(matches!(err, BrokerError::TimedOut));
    }

    #[test]
    fn unattended_setup_is_declined_without_prompting() {
        let runner = FakeRunner::new();
        let sudo = SudoBroker::new(&runner, Consent::Unattended, Duration::from_secs(5));
        assert_eq!(sudo.request_one_time_setup(), Decision::Denied);
        let polkit = PolkitBroker::new(&runner, Consent::Unattended, Duration::from_secs(5));
        assert_eq!(polkit.request_one_time_setup(), Decision::Denied);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn yes_flag_assumes_consent() {
        assert_eq!(Consent::detect(true), Consent::Assumed);
    }

    #[test]
    fn unanswered_confirmation_times_out() {
        let decision = answer_within(Duration::from_millis(50), || {
            thread::sleep(Duration::from_secs(2));
            Ok(true)
        });
        assert_eq!(decision, Decision::TimedOut);
    }

    #[test]
    fn confirmation_answers_map_to_decisions() {
        let timeout = Duration::from_secs(5);
        assert_eq!(answer_within(timeout, || Ok(true)), Decision::Granted);
        assert_eq!(answer_within(timeout, || Ok(false)), Decision::Denied);
        assert_eq!(
            answer_within(timeout, || Err(io::Error::other("terminal closed").into())),
            Decision::Denied
        );
    }

    #[test]
    fn polkit_dismissal_is_denied() {
        let runner = FakeRunner::new();
        runner.respond("pkexec sh", fail(PKEXEC_DISMISSED, ""));
        let broker = PolkitBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        let err = broker.run_elevated_batch(&ops()).expect_err("denied");
        assert!(matches!(err, BrokerError::Denied));
    }

    #[test]
    fn missing_pkexec_is_a_launch_error() {
        let runner = FakeRunner::new();
        runner.missing("pkexec");
        let broker = PolkitBroker::new(&runner, Consent::Assumed, Duration::from_secs(5));
        let err = broker.run_elevated_batch(&ops()).expect_err("launch");
        assert!(matches!(err, BrokerError::Launch { .. }));
        assert_eq!(broker.request_one_time_setup(), Decision::Denied);
    }
}
