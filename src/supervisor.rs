use crate::runner::{render_command, CommandOutput, CommandRunner};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to run `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with status {status_code}: {stderr}")]
    Failed {
        command: String,
        status_code: i32,
        stderr: String,
    },
}

impl SupervisorError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SupervisorError::Failed { status_code, .. } => Some(*status_code),
            SupervisorError::Launch { .. } => None,
        }
    }
}

/// `systemctl --user` for a single named unit.
pub struct Supervisor<'a, R: CommandRunner> {
    runner: &'a R,
    command: &'a str,
    unit: &'a str,
}

impl<'a, R: CommandRunner> Supervisor<'a, R> {
    pub fn new(runner: &'a R, command: &'a str, unit: &'a str) -> Self {
        Self {
            runner,
            command,
            unit,
        }
    }

    pub fn unit(&self) -> &str {
        self.unit
    }

    fn user_args(&self, verb: &str) -> Vec<String> {
        vec!["--user".to_string(), verb.to_string(), self.unit.to_string()]
    }

    fn query(&self, args: &[String]) -> bool {
        match self.runner.run(self.command, args) {
            Ok(output) => output.success(),
            Err(err) => {
                debug!("{} unavailable: {err}", self.command);
                false
            }
        }
    }

    fn mutate(&self, args: &[String]) -> Result<CommandOutput, SupervisorError> {
        let command = render_command(self.command, args);
        let output = self
            .runner
            .run(self.command, args)
            .map_err(|source| SupervisorError::Launch {
                command: command.clone(),
                source,
            })?;
        if !output.success() {
            return Err(SupervisorError::Failed {
                command,
                status_code: output.status_code,
                stderr: output.stderr_text(),
            });
        }
        Ok(output)
    }

    pub fn is_active(&self) -> bool {
        self.query(&self.user_args("is-active"))
    }

    pub fn is_enabled(&self) -> bool {
        self.query(&self.user_args("is-enabled"))
    }

    /// A system-wide unit of the same name (e.g. from a distro package).
    pub fn system_unit_active(&self) -> bool {
        self.query(&["is-active".to_string(), self.unit.to_string()])
    }

    pub fn daemon_reload(&self) -> Result<(), SupervisorError> {
        self.mutate(&["--user".to_string(), "daemon-reload".to_string()])
            .map(|_| ())
    }

    pub fn enable_now(&self) -> Result<(), SupervisorError> {
        let args = vec![
            "--user".to_string(),
            "enable".to_string(),
            "--now".to_string(),
            self.unit.to_string(),
        ];
        self.mutate(&args).map(|_| ())
    }

    pub fn stop(&self) -> Result<(), SupervisorError> {
        self.mutate(&self.user_args("stop")).map(|_| ())
    }

    pub fn disable(&self) -> Result<(), SupervisorError> {
        self.mutate(&self.user_args("disable")).map(|_| ())
    }
}

pub struct UnitSpec<'a> {
    pub description: &'a str,
    pub working_dir: &'a Path,
    pub exec: &'a [String],
    pub restart_sec: u32,
}

fn escape_exec_arg(arg: &str) -> String {
    let escaped = arg.replace('%', "%%");
    if escaped.is_empty()
        || escaped.contains(char::is_whitespace)
        || escaped.contains('"')
        || escaped.contains('\\')
    {
        format!(
            "\"{}\"",
            escaped.replace('\\', "\\\\").replace('"', "\\\"")
        )
    } else {
        escaped
    }
}

pub fn render_unit(spec: &UnitSpec<'_>) -> String {
    let exec = spec
        .exec
        .iter()
        .map(|arg| escape_exec_arg(arg))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "[Unit]\n\
         Description={description}\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         WorkingDirectory={working_dir}\n\
         ExecStart={exec}\n\
         Restart=on-failure\n\
         RestartSec={restart_sec}\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        description = spec.description,
        working_dir = escape_exec_arg(&spec.working_dir.to_string_lossy()),
        exec = exec,
        restart_sec = spec.restart_sec,
    )
}
