use std::{
    path::{Path, PathBuf},
    process::Command,
};

use crate::error::{Error, Result};

/// Supplies the source revision sent in `x-recording-sha`.
pub trait RevisionSource: Send + Sync {
    fn revision(&self) -> Result<String>;
}

/// Asks git for `HEAD` of the repository containing `repo_dir`.
#[derive(Debug, Clone)]
pub struct GitRevision {
    repo_dir: PathBuf,
}

impl GitRevision {
    pub fn new(repo_dir: impl AsRef<Path>) -> Self {
        Self {
            repo_dir: repo_dir.as_ref().to_path_buf(),
        }
    }
}

impl RevisionSource for GitRevision {
    fn revision(&self) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.repo_dir)
            .output()
            .map_err(|err| Error::Revision(format!("run `git rev-parse HEAD`: {err}")))?;
        if !output.status.success() {
            return Err(Error::Revision(format!(
                "`git rev-parse HEAD` in {} exited with {}: {}",
                self.repo_dir.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if sha.is_empty() {
            return Err(Error::Revision("`git rev-parse HEAD` printed nothing".to_owned()));
        }
        Ok(sha)
    }
}

#[derive(Debug, Clone)]
pub struct FixedRevision(String);

impl FixedRevision {
    pub fn new(sha: impl Into<String>) -> Self {
        Self(sha.into())
    }
}

impl RevisionSource for FixedRevision {
    fn revision(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
