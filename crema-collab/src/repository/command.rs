//! External version-control command assembly and execution.

use std::fmt;
use std::path::Path;
use std::process::Command;

use super::RepositoryError;

/// One invocation of a version-control program, as an argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsCommand {
    program: String,
    args: Vec<String>,
}

impl VcsCommand {
    pub fn new(program: impl Into<String>, subcommand: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![subcommand.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path(self, path: &Path) -> Self {
        let text = path.to_string_lossy().into_owned();
        self.arg(text)
    }

    /// Append `--name`.
    pub fn option(self, name: &str) -> Self {
        self.arg(format!("--{name}"))
    }

    /// Append `--name value`.
    pub fn option_value(self, name: &str, value: impl Into<String>) -> Self {
        self.option(name).arg(value)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn subcommand(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for VcsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Runs a [`VcsCommand`] and returns its standard output.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &VcsCommand, working_dir: &Path) -> Result<String, RepositoryError>;
}

/// Runs commands as child processes, blocking until they exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, command: &VcsCommand, working_dir: &Path) -> Result<String, RepositoryError> {
        log::debug!("{}", command);
        let output = Command::new(command.program())
            .args(command.args())
            .current_dir(working_dir)
            .output()
            .map_err(|e| RepositoryError::Command {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(RepositoryError::Command {
                command: command.to_string(),
                message,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_command_builder() {
        let cmd = VcsCommand::new("svn", "commit")
            .path(&PathBuf::from("/repo"))
            .option_value("with-revprop", "key=value")
            .option("quiet");
        assert_eq!(cmd.program(), "svn");
        assert_eq!(cmd.subcommand(), "commit");
        assert_eq!(cmd.args(), ["commit", "/repo", "--with-revprop", "key=value", "--quiet"]);
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let cmd = VcsCommand::new("svn", "commit").option_value("message", "fix the \"row\" bug");
        assert_eq!(cmd.to_string(), r#"svn commit --message "fix the \"row\" bug""#);
    }

    #[test]
    fn test_process_runner_reports_missing_program() {
        let dir = tempfile::TempDir::new().unwrap();
        let cmd = VcsCommand::new("crema-no-such-program", "stat");
        let err = ProcessRunner.run(&cmd, dir.path()).unwrap_err();
        match err {
            RepositoryError::Command { command, .. } => assert!(command.starts_with("crema-no-such-program")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
