//! Subversion working-copy backend.

use std::path::{Path, PathBuf};

use super::command::{CommandRunner, ProcessRunner, VcsCommand};
use super::{LogPropertyInfo, RepositoryError, VcsBackend};

pub struct SvnBackend<R: CommandRunner = ProcessRunner> {
    base_path: PathBuf,
    program: String,
    runner: R,
}

impl SvnBackend<ProcessRunner> {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self::with_runner(base_path, ProcessRunner)
    }
}

impl<R: CommandRunner> SvnBackend<R> {
    pub fn with_runner(base_path: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            base_path: base_path.into(),
            program: "svn".to_string(),
            runner,
        }
    }

    /// Use a different executable, e.g. an absolute path to `svn`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn command(&self, subcommand: &str) -> VcsCommand {
        VcsCommand::new(self.program.clone(), subcommand)
    }

    fn run(&self, command: VcsCommand) -> Result<String, RepositoryError> {
        self.runner.run(&command, &self.base_path)
    }
}

impl<R: CommandRunner> VcsBackend for SvnBackend<R> {
    fn name(&self) -> &'static str {
        "svn"
    }

    fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn status(&self) -> Result<Vec<String>, RepositoryError> {
        let output = self.run(self.command("stat").path(&self.base_path).option("quiet"))?;
        Ok(output
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn diff(&self) -> Result<String, RepositoryError> {
        self.run(self.command("diff").path(&self.base_path).option("patch-compatible"))
    }

    fn update(&self) -> Result<(), RepositoryError> {
        self.run(self.command("update").path(&self.base_path))?;
        Ok(())
    }

    fn commit(
        &self,
        author: &str,
        message: &str,
        properties: &[LogPropertyInfo],
    ) -> Result<String, RepositoryError> {
        let mut command = self
            .command("commit")
            .path(&self.base_path)
            .option_value("message", message);
        for property in properties {
            command = command.option_value("with-revprop", format!("{}={}", property.key, property.value));
        }
        let command = command
            .option_value("encoding", "utf-8")
            .option_value("username", author);
        self.run(command)
    }

    fn revert(&self) -> Result<(), RepositoryError> {
        self.run(self.command("revert").path(&self.base_path).option("recursive"))?;
        Ok(())
    }

    fn cleanup(&self) -> Result<(), RepositoryError> {
        self.run(self.command("cleanup").path(&self.base_path))?;
        Ok(())
    }

    fn apply_patch(&self, patch_path: &Path) -> Result<(), RepositoryError> {
        self.run(self.command("patch").path(patch_path).path(&self.base_path))?;
        Ok(())
    }

    fn add(&self, path: &Path) -> Result<(), RepositoryError> {
        self.run(self.command("add").path(path).option("parents").option("force"))?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<(), RepositoryError> {
        self.run(self.command("delete").path(path).option("force"))?;
        Ok(())
    }

    fn move_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError> {
        self.run(self.command("move").path(from).path(to))?;
        Ok(())
    }

    fn copy_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError> {
        self.run(self.command("copy").path(from).path(to))?;
        Ok(())
    }
}
