//! Credentials for git commands that talk to the upstream repository.

use std::path::PathBuf;

use secrecy::ExposeSecret;
use tokio::process::Command;

use crate::config::{GitAuthSettings, GitAuthType};
use crate::error::{Result, SyncError};
use crate::secrets::{expand_home, resolve_secret};

/// Escapes a token for use inside a single-quoted shell string.
pub fn shell_escape_token(token: &str) -> String {
    token.replace('\'', "'\\''")
}

/// Deletes the askpass script when dropped so tokens never outlive the command.
#[derive(Debug)]
pub struct AskpassCleanup {
    path: Option<PathBuf>,
}

impl AskpassCleanup {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn empty() -> Self {
        Self { path: None }
    }
}

impl Drop for AskpassCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to clean up askpass script: {}", e);
            }
        }
    }
}

/// Environment for an authenticated git command.
///
/// Must stay alive until the command has exited.
#[derive(Debug)]
pub struct AuthEnv {
    pub env_vars: Vec<(String, String)>,
    _cleanup: AskpassCleanup,
}

impl AuthEnv {
    fn plain(env_vars: Vec<(String, String)>) -> Self {
        Self {
            env_vars,
            _cleanup: AskpassCleanup::empty(),
        }
    }

    /// Adds the credentials to `cmd`.
    pub fn apply(&self, cmd: &mut Command) {
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
    }
}

/// Builds the environment for the configured auth type.
pub fn build_auth_env(auth: &GitAuthSettings) -> Result<AuthEnv> {
    match auth.auth_type {
        GitAuthType::None => Ok(AuthEnv::plain(Vec::new())),
        GitAuthType::Token => token_env(auth),
        GitAuthType::SshKey => ssh_env(auth),
    }
}

fn token_env(auth: &GitAuthSettings) -> Result<AuthEnv> {
    let env_var = Some(auth.token_env_var.as_str()).filter(|v| !v.is_empty());
    let token = resolve_secret(
        auth.token_insecure.as_deref(),
        auth.token_file.as_deref(),
        env_var,
    )
    .map_err(|e| SyncError::GitAuthFailed(format!("Failed to resolve git token: {}", e)))?;

    let script = format!(
        "#!/bin/sh\necho '{}'\n",
        shell_escape_token(token.expose_secret())
    );
    let path = std::env::temp_dir().join(format!(".kubesync-askpass-{}.sh", uuid::Uuid::new_v4()));
    write_private(&path, script.as_bytes())?;
    let cleanup = AskpassCleanup::new(path.clone());

    let path = path
        .to_str()
        .ok_or_else(|| {
            SyncError::GitAuthFailed("Temp directory path contains non-UTF8 characters".to_string())
        })?
        .to_string();

    Ok(AuthEnv {
        env_vars: vec![
            ("GIT_ASKPASS".to_string(), path),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ],
        _cleanup: cleanup,
    })
}

#[cfg(unix)]
fn write_private(path: &std::path::Path, content: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(path)?;
    file.write_all(content)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &std::path::Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content)?;
    Ok(())
}

fn ssh_env(auth: &GitAuthSettings) -> Result<AuthEnv> {
    let key_path = if auth.ssh_key_path.is_empty() {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("id_ed25519"))
            .unwrap_or_else(|| PathBuf::from(".ssh/id_ed25519"))
    } else {
        PathBuf::from(expand_home(&auth.ssh_key_path))
    };

    if !key_path.exists() {
        return Err(SyncError::GitAuthFailed(format!(
            "SSH key file not found: {}",
            key_path.display()
        )));
    }

    let escaped = key_path.display().to_string().replace('\'', "'\\''");
    let quoted = if escaped.starts_with('-') {
        format!("'./{}'", escaped)
    } else {
        format!("'{}'", escaped)
    };

    Ok(AuthEnv::plain(vec![(
        "GIT_SSH_COMMAND".to_string(),
        format!("ssh -i {} -o StrictHostKeyChecking=accept-new", quoted),
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_auth_env_none() {
        let auth = build_auth_env(&GitAuthSettings::default()).unwrap();
        assert!(auth.env_vars.is_empty());
    }

    #[test]
    fn test_shell_escape_token() {
        assert_eq!(shell_escape_token("simple"), "simple");
        assert_eq!(shell_escape_token("it's"), "it'\\''s");
    }

    #[test]
    fn test_token_askpass_removed_on_drop() {
        let settings = GitAuthSettings {
            auth_type: GitAuthType::Token,
            token_insecure: Some("s3cret".to_string()),
            ..Default::default()
        };

        let auth = build_auth_env(&settings).unwrap();
        let script = auth
            .env_vars
            .iter()
            .find(|(k, _)| k == "GIT_ASKPASS")
            .map(|(_, v)| PathBuf::from(v))
            .unwrap();
        assert!(std::fs::read_to_string(&script).unwrap().contains("s3cret"));

        drop(auth);
        assert!(!script.exists());
    }

    #[test]
    fn test_token_without_source_fails() {
        let settings = GitAuthSettings {
            auth_type: GitAuthType::Token,
            ..Default::default()
        };
        assert!(matches!(
            build_auth_env(&settings),
            Err(SyncError::GitAuthFailed(_))
        ));
    }

    #[test]
    fn test_ssh_key_not_found() {
        let settings = GitAuthSettings {
            auth_type: GitAuthType::SshKey,
            ssh_key_path: "/nonexistent/path/id_rsa".to_string(),
            ..Default::default()
        };
        let err = build_auth_env(&settings).unwrap_err().to_string();
        assert!(err.contains("SSH key file not found"));
    }

    #[test]
    fn test_ssh_key_command() {
        let key = NamedTempFile::new().unwrap();
        let settings = GitAuthSettings {
            auth_type: GitAuthType::SshKey,
            ssh_key_path: key.path().to_string_lossy().into_owned(),
            ..Default::default()
        };

        let auth = build_auth_env(&settings).unwrap();
        let (name, command) = &auth.env_vars[0];
        assert_eq!(name, "GIT_SSH_COMMAND");
        assert!(command.starts_with("ssh -i '"));
        assert!(command.ends_with("StrictHostKeyChecking=accept-new"));
    }
}
