use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const INTERACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a timed-out prompt gets to restore the terminal after SIGTERM.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Executes the external collaborators (systemctl, flatpak, sudo, tar, ...).
pub trait CommandRunner {
    /// Runs to completion with captured output.
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, io::Error>;

    /// Runs attached to the user's terminal so prompts reach them. Waits at most
    /// `timeout`; on expiry the child is killed and `ErrorKind::TimedOut` returned.
    fn run_interactive(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, io::Error>;

    /// Starts the command without waiting for it. Output goes to `log_path`.
    fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        log_path: &Path,
    ) -> Result<u32, io::Error>;

    fn locate(&self, program: &str) -> Option<PathBuf>;
}

pub struct SystemRunner;

fn status_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or(if status.success() { 0 } else { 1 })
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, io::Error> {
        debug!(command = %render_command(program, args), "running");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            status_code: status_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn run_interactive(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, io::Error> {
        debug!(command = %render_command(program, args), timeout_sec = timeout.as_secs(), "running interactively");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(CommandOutput {
                    status_code: status_code(status),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                });
            }
            if Instant::now() >= deadline {
                terminate(&mut child);
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "{program} did not finish within {}s",
                        timeout.as_secs()
                    ),
                ));
            }
            thread::sleep(INTERACTIVE_POLL_INTERVAL);
        }
    }

    fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        log_path: &Path,
    ) -> Result<u32, io::Error> {
        debug!(command = %render_command(program, args), log = %log_path.display(), "spawning detached");
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        Ok(child.id())
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// SIGTERM first so sudo/pkexec can reset terminal echo; SIGKILL only if it lingers.
fn terminate(child: &mut Child) {
    let signalled = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .stdin(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if signalled {
        let grace = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < grace {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(INTERACTIVE_POLL_INTERVAL),
                Err(_) => break,
            }
        }
    }
    debug!(pid = child.id(), "prompt ignored SIGTERM; killing");
    let _ = child.kill();
    let _ = child.wait();
}

pub fn render_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    for arg in args {
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            parts.push(format!("{arg:?}"));
        } else {
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}

/// Builds an owned argv from string literals and paths.
#[macro_export]
macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        vec![$($arg.to_string()),*]
    };
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedCall {
        pub program: String,
        pub args: Vec<String>,
        pub mode: CallMode,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CallMode {
        Captured,
        Interactive,
        Detached,
    }

    impl RecordedCall {
        pub fn line(&self) -> String {
            render_command(&self.program, &self.args)
        }
    }

    type Hook = Box<dyn Fn(&[String]) -> CommandOutput>;

    /// Records every invocation. Responses are matched by the longest rendered
    /// command prefix registered with `respond`/`on`; unmatched calls succeed.
    #[derive(Default)]
    pub struct FakeRunner {
        calls: RefCell<Vec<RecordedCall>>,
        responses: RefCell<BTreeMap<String, CommandOutput>>,
        hooks: RefCell<Vec<(String, Hook)>>,
        missing: RefCell<Vec<String>>,
        present: RefCell<Vec<String>>,
        stalled: RefCell<Vec<String>>,
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            status_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            status_code: code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, prefix: &str, output: CommandOutput) {
            self.responses
                .borrow_mut()
                .insert(prefix.to_string(), output);
        }

        /// Runs `hook` for matching calls; lets tests emulate side effects.
        pub fn on(&self, prefix: &str, hook: impl Fn(&[String]) -> CommandOutput + 'static) {
            self.hooks
                .borrow_mut()
                .push((prefix.to_string(), Box::new(hook)));
        }

        /// Programs reported as absent by `locate` and failing with NotFound.
        pub fn missing(&self, program: &str) {
            self.missing.borrow_mut().push(program.to_string());
        }

        /// Interactive calls matching `prefix` never answer and hit their timeout.
        pub fn stall(&self, prefix: &str) {
            self.stalled.borrow_mut().push(prefix.to_string());
        }

        pub fn installed(&self, program: &str) {
            self.present.borrow_mut().push(program.to_string());
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.borrow().clone()
        }

        pub fn lines(&self) -> Vec<String> {
            self.calls().iter().map(RecordedCall::line).collect()
        }

        pub fn ran(&self, prefix: &str) -> bool {
            self.lines().iter().any(|line| line.starts_with(prefix))
        }

        fn dispatch(
            &self,
            program: &str,
            args: &[String],
            mode: CallMode,
        ) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(RecordedCall {
                program: program.to_string(),
                args: args.to_vec(),
                mode,
            });
            if self.missing.borrow().iter().any(|p| p == program) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{program}: not found"),
                ));
            }
            let line = render_command(program, args);
            if mode == CallMode::Interactive
                && self
                    .stalled
                    .borrow()
                    .iter()
                    .any(|prefix| line.starts_with(prefix.as_str()))
            {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{program} did not answer"),
                ));
            }
            let hooks = self.hooks.borrow();
            let hook = hooks
                .iter()
                .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            if let Some((_, hook)) = hook {
                return Ok(hook(args));
            }
            let responses = self.responses.borrow();
            let matched = responses
                .iter()
                .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, output)| output.clone());
            Ok(matched.unwrap_or_else(|| ok("")))
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, io::Error> {
            self.dispatch(program, args, CallMode::Captured)
        }

        fn run_interactive(
            &self,
            program: &str,
            args: &[String],
            _timeout: Duration,
        ) -> Result<CommandOutput, io::Error> {
            self.dispatch(program, args, CallMode::Interactive)
        }

        fn spawn_detached(
            &self,
            program: &str,
            args: &[String],
            _log_path: &Path,
        ) -> Result<u32, io::Error> {
            self.dispatch(program, args, CallMode::Detached)?;
            Ok(4242)
        }

        fn locate(&self, program: &str) -> Option<PathBuf> {
            if self.missing.borrow().iter().any(|p| p == program) {
                return None;
            }
            if self.present.borrow().iter().any(|p| p == program) {
                return Some(PathBuf::from("/usr/bin").join(program));
            }
            None
        }
    }
}
