//! Git working-copy backend.
//!
//! Git has no revision properties, so commit properties are written as
//! message trailers (`key: value`). When the working copy has a remote,
//! `update` rebases onto it and `commit` pushes afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use super::command::{CommandRunner, ProcessRunner, VcsCommand};
use super::{LogPropertyInfo, RepositoryError, VcsBackend};

pub struct GitBackend<R: CommandRunner = ProcessRunner> {
    base_path: PathBuf,
    program: String,
    runner: R,
}

impl GitBackend<ProcessRunner> {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self::with_runner(base_path, ProcessRunner)
    }
}

impl<R: CommandRunner> GitBackend<R> {
    pub fn with_runner(base_path: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            base_path: base_path.into(),
            program: "git".to_string(),
            runner,
        }
    }

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

    fn has_remote(&self) -> Result<bool, RepositoryError> {
        let remotes = self.run(self.command("remote"))?;
        Ok(remotes.lines().any(|line| !line.trim().is_empty()))
    }

    fn stage_all(&self) -> Result<(), RepositoryError> {
        self.run(self.command("add").arg("-A"))?;
        Ok(())
    }
}

fn commit_message(message: &str, properties: &[LogPropertyInfo]) -> String {
    if properties.is_empty() {
        return message.to_string();
    }
    let trailers: Vec<String> = properties
        .iter()
        .map(|p| format!("{}: {}", p.key, p.value))
        .collect();
    format!("{}\n\n{}", message, trailers.join("\n"))
}

impl<R: CommandRunner> VcsBackend for GitBackend<R> {
    fn name(&self) -> &'static str {
        "git"
    }

    fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn status(&self) -> Result<Vec<String>, RepositoryError> {
        let output = self.run(self.command("status").option("porcelain"))?;
        Ok(output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn diff(&self) -> Result<String, RepositoryError> {
        // Untracked files only show up in a diff once staged.
        self.stage_all()?;
        self.run(self.command("diff").option("cached").option("binary"))
    }

    fn update(&self) -> Result<(), RepositoryError> {
        if !self.has_remote()? {
            return Ok(());
        }
        self.run(self.command("pull").option("rebase").option("autostash"))?;
        Ok(())
    }

    fn commit(
        &self,
        author: &str,
        message: &str,
        properties: &[LogPropertyInfo],
    ) -> Result<String, RepositoryError> {
        self.stage_all()?;
        let output = self.run(
            self.command("commit")
                .option_value("message", commit_message(message, properties))
                .option_value("author", format!("{author} <{author}@crema>")),
        )?;
        if self.has_remote()? {
            self.run(self.command("push"))?;
        }
        Ok(output)
    }

    fn revert(&self) -> Result<(), RepositoryError> {
        self.run(self.command("reset").option("hard").arg("HEAD"))?;
        self.run(self.command("clean").arg("-fd"))?;
        Ok(())
    }

    fn cleanup(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    fn apply_patch(&self, patch_path: &Path) -> Result<(), RepositoryError> {
        self.run(
            self.command("apply")
                .option_value("whitespace", "nowarn")
                .path(patch_path),
        )?;
        Ok(())
    }

    fn add(&self, path: &Path) -> Result<(), RepositoryError> {
        self.run(self.command("add").option("force").path(path))?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<(), RepositoryError> {
        self.run(self.command("rm").arg("-r").option("force").path(path))?;
        Ok(())
    }

    fn move_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError> {
        self.run(self.command("mv").path(from).path(to))?;
        Ok(())
    }

    fn copy_path(&self, from: &Path, to: &Path) -> Result<(), RepositoryError> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
        self.add(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::svn::tests::RecordingRunner;

    fn backend() -> GitBackend<RecordingRunner> {
        GitBackend::with_runner("/wc", RecordingRunner::default())
    }

    #[test]
    fn test_status_porcelain() {
        let git = backend();
        git.runner().answer("status", " M tables/a.json\n?? tables/b.json\n");
        assert_eq!(git.status().unwrap(), vec![" M tables/a.json", "?? tables/b.json"]);
        assert_eq!(git.runner().args()[0], ["status", "--porcelain"]);
    }

    #[test]
    fn test_diff_stages_untracked_files() {
        let git = backend();
        git.runner().answer("diff", "diff --git a/x b/x\n");
        assert_eq!(git.diff().unwrap(), "diff --git a/x b/x\n");
        let args = git.runner().args();
        assert_eq!(args[0], ["add", "-A"]);
        assert_eq!(args[1], ["diff", "--cached", "--binary"]);
    }

    #[test]
    fn test_commit_without_remote_skips_push() {
        let git = backend();
        git.commit("bob", "save", &[LogPropertyInfo::new("domain", "d1")]).unwrap();
        let args = git.runner().args();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], ["add", "-A"]);
        assert_eq!(
            args[1],
            ["commit", "--message", "save\n\ndomain: d1", "--author", "bob <bob@crema>"]
        );
        assert_eq!(args[2], ["remote"]);
    }

    #[test]
    fn test_commit_with_remote_pushes() {
        let git = backend();
        git.runner().answer("remote", "origin\n");
        git.commit("bob", "save", &[]).unwrap();
        let args = git.runner().args();
        assert_eq!(args.last().unwrap(), &["push"]);
    }

    #[test]
    fn test_update_without_remote_is_noop() {
        let git = backend();
        git.update().unwrap();
        assert_eq!(git.runner().args(), vec![vec!["remote".to_string()]]);

        git.runner().answer("remote", "origin\n");
        git.update().unwrap();
        assert_eq!(git.runner().args()[2], ["pull", "--rebase", "--autostash"]);
    }

    #[test]
    fn test_revert_resets_and_cleans() {
        let git = backend();
        git.revert().unwrap();
        git.cleanup().unwrap();
        let args = git.runner().args();
        assert_eq!(args, vec![vec!["reset", "--hard", "HEAD"], vec!["clean", "-fd"]]);
    }

    #[test]
    fn test_copy_path_adds_copy() {
        let dir = tempfile::TempDir::new().unwrap();
        let git = GitBackend::with_runner(dir.path(), RecordingRunner::default());
        let from = dir.path().join("a.json");
        let to = dir.path().join("nested").join("b.json");
        fs::write(&from, "{}").unwrap();
        git.copy_path(&from, &to).unwrap();
        assert_eq!(fs::read_to_string(&to).unwrap(), "{}");
        assert_eq!(git.runner().args()[0][0], "add");
    }
}
