//! Secret resolution for repository credentials.
//!
//! A secret can be given in three ways, checked in this order:
//!
//! 1. **Direct value** in the config file (`token: ...`)
//! 2. **File reference**, e.g. a mounted Kubernetes secret (`tokenFile: /var/run/secrets/git/token`)
//! 3. **Env var reference** (`tokenEnvVar: GIT_TOKEN`)

use std::env::VarError;
use std::fs;

use secrecy::SecretString;
use thiserror::Error;

/// Why a credential could not be resolved.
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Credential has no source: set a value, a file or an environment variable")]
    NoSource,

    #[error("Cannot read credential file '{path}': {source}")]
    UnreadableFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Credential variable '{name}' is not set")]
    MissingEnvVar { name: String },

    #[error("Credential variable '{name}' is not valid UTF-8")]
    NonUnicodeEnvVar { name: String },
}

/// Resolves a secret from the first non-empty source.
pub fn resolve_secret(
    value: Option<&str>,
    file: Option<&str>,
    env_name: Option<&str>,
) -> Result<SecretString, SecretError> {
    let present = |s: &&str| !s.is_empty();

    if let Some(value) = value.filter(present) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(file) = file.filter(present) {
        let path = expand_home(file);
        let content = fs::read_to_string(&path)
            .map_err(|source| SecretError::UnreadableFile { path, source })?;
        return Ok(SecretString::from(content.trim().to_string()));
    }

    let Some(name) = env_name.filter(present) else {
        return Err(SecretError::NoSource);
    };
    // Values injected from Kubernetes secrets often end in a newline.
    match std::env::var(name) {
        Ok(token) => Ok(SecretString::from(token.trim().to_string())),
        Err(VarError::NotPresent) => Err(SecretError::MissingEnvVar {
            name: name.to_string(),
        }),
        Err(VarError::NotUnicode(_)) => Err(SecretError::NonUnicodeEnvVar {
            name: name.to_string(),
        }),
    }
}

/// Returns true when at least one source is configured.
pub fn has_secret_source(
    value: Option<&str>,
    file: Option<&str>,
    env_name: Option<&str>,
) -> bool {
    [value, file, env_name]
        .into_iter()
        .any(|source| source.is_some_and(|s| !s.is_empty()))
}

/// Expands a leading `~` to the current user's home directory.
///
/// `~user/path` is not supported.
pub fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
