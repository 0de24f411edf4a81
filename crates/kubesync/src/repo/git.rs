//! Git CLI backed [`Repository`].
//!
//! Keeps a `--mirror` clone of the upstream repository. Every checkout is a
//! throwaway clone of the mirror in a temp directory; the watermark is an
//! annotated tag force-pushed to the upstream URL.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use super::auth::build_auth_env;
use super::{CheckoutConfig, Repository, WorkingCopy};
use crate::config::{GitAuthSettings, GitSettings};
use crate::error::{classify_git_error, Result, SyncError};
use crate::manifest::is_manifest_path;
use crate::process::{format_command_error, non_empty_lines, stdout_text};

/// Runs git in `cwd`, returning trimmed stdout or a classified error.
async fn run_git(cwd: &Path, args: &[&str], auth: Option<&GitAuthSettings>) -> Result<String> {
    let auth_env = auth.map(build_auth_env).transpose()?;

    let mut cmd = Command::new("git");
    cmd.current_dir(cwd)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(env) = &auth_env {
        env.apply(&mut cmd);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| SyncError::GitOperation(format!("failed to run git: {}", e)))?;

    // The askpass script must outlive the command.
    drop(auth_env);

    if output.status.success() {
        Ok(stdout_text(&output))
    } else {
        log::debug!("git {} failed in {}", args.join(" "), cwd.display());
        Err(classify_git_error(&format_command_error(&output)))
    }
}

/// Repository backed by a local mirror of the upstream.
pub struct GitRepository {
    settings: GitSettings,
    mirror: PathBuf,
}

impl GitRepository {
    pub fn new(settings: GitSettings) -> Self {
        let mirror = settings.mirror_dir();
        Self { settings, mirror }
    }

    pub fn mirror_path(&self) -> &Path {
        &self.mirror
    }

    pub fn settings(&self) -> &GitSettings {
        &self.settings
    }

    fn has_mirror(&self) -> bool {
        self.mirror.join("HEAD").exists()
    }

    /// Clones the mirror on first use.
    async fn ensure_mirror(&self) -> Result<()> {
        if self.has_mirror() {
            return Ok(());
        }

        let parent = self
            .mirror
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        log::info!("Cloning mirror of {} into {}", self.settings.url, self.mirror.display());
        let mirror = self.mirror.to_string_lossy();
        run_git(
            parent,
            &["clone", "--mirror", "--quiet", &self.settings.url, &mirror],
            Some(&self.settings.auth),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for GitRepository {
    async fn checkout(&self, config: &CheckoutConfig) -> Result<Box<dyn WorkingCopy>> {
        self.ensure_mirror().await?;

        let dir = tempfile::Builder::new().prefix("kubesync-").tempdir()?;
        let root = dir.path().join("repo");
        let mirror = self.mirror.to_string_lossy();
        let root_arg = root.to_string_lossy();
        run_git(
            dir.path(),
            &[
                "clone",
                "--quiet",
                "--branch",
                &self.settings.branch,
                &mirror,
                &root_arg,
            ],
            None,
        )
        .await?;

        let manifest_dir = root.join(&self.settings.path);
        if !manifest_dir.is_dir() {
            return Err(SyncError::ManifestDirNotFound(PathBuf::from(&self.settings.path)));
        }

        Ok(Box::new(GitWorkingCopy {
            _dir: dir,
            root,
            manifest_dir,
            config: config.clone(),
            upstream: self.settings.url.clone(),
            auth: self.settings.auth.clone(),
        }))
    }

    async fn refresh(&self) -> Result<()> {
        if !self.has_mirror() {
            return self.ensure_mirror().await;
        }
        run_git(
            &self.mirror,
            &["remote", "update", "--prune"],
            Some(&self.settings.auth),
        )
        .await?;
        Ok(())
    }

    async fn revision(&self) -> Result<String> {
        self.ensure_mirror().await?;
        let spec = format!("refs/heads/{}^{{commit}}", self.settings.branch);
        run_git(&self.mirror, &["rev-parse", "--verify", &spec], None).await
    }
}

/// Clone of the mirror living for one sync attempt.
pub struct GitWorkingCopy {
    /// Removes the clone on drop.
    _dir: TempDir,
    root: PathBuf,
    manifest_dir: PathBuf,
    config: CheckoutConfig,
    upstream: String,
    auth: GitAuthSettings,
}

#[async_trait]
impl WorkingCopy for GitWorkingCopy {
    fn manifest_dir(&self) -> &Path {
        &self.manifest_dir
    }

    async fn watermark_revision(&self) -> Result<Option<String>> {
        let spec = format!("refs/tags/{}^{{commit}}", self.config.sync_tag);
        match run_git(&self.root, &["rev-parse", "--verify", &spec], None).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if e.is_unknown_revision() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn head_revision(&self) -> Result<String> {
        run_git(&self.root, &["rev-parse", "--verify", "HEAD"], None).await
    }

    async fn changed_files_since(&self, revision: &str) -> Result<Vec<PathBuf>> {
        let output = run_git(
            &self.manifest_dir,
            &["diff", "--name-only", "--relative", revision, "HEAD", "--", "."],
            None,
        )
        .await?;

        Ok(non_empty_lines(&output)
            .into_iter()
            .map(PathBuf::from)
            .filter(|path| is_manifest_path(path))
            .collect())
    }

    async fn file_last_commit(&self, path: &Path) -> Result<String> {
        let path_arg = path.to_string_lossy();
        let commit = run_git(
            &self.manifest_dir,
            &["log", "-1", "--format=%H", "--", &path_arg],
            None,
        )
        .await?;

        if commit.is_empty() {
            return Err(SyncError::GitOperation(format!(
                "No commit touches {}",
                path.display()
            )));
        }
        Ok(commit)
    }

    async fn advance_watermark(&self, revision: &str, message: &str) -> Result<()> {
        let user_name = format!("user.name={}", self.config.user_name);
        let user_email = format!("user.email={}", self.config.user_email);
        run_git(
            &self.root,
            &[
                "-c",
                &user_name,
                "-c",
                &user_email,
                "tag",
                "--force",
                "--annotate",
                "--message",
                message,
                &self.config.sync_tag,
                revision,
            ],
            None,
        )
        .await?;

        let tag_ref = format!("refs/tags/{}", self.config.sync_tag);
        run_git(
            &self.root,
            &["push", "--force", "--quiet", &self.upstream, &tag_ref],
            Some(&self.auth),
        )
        .await?;

        log::info!("Moved {} to {}", self.config.sync_tag, revision);
        Ok(())
    }
}
