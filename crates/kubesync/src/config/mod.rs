//! Agent configuration.
//!
//! Loaded from a single YAML file with camelCase keys. Every field except
//! `git.url` and `sync.namespaces` has a default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::resource::ResourceId;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub git: GitSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub logging: LogSettings,
}

impl AgentConfig {
    /// Reads, parses and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::ReadConfig {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::from_yaml(&content)
    }

    /// Parses and validates config text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AgentConfig = serde_yaml::from_str(content)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.git.url.trim().is_empty() {
            errors.push("git.url is required".to_string());
        }
        if self.git.branch.trim().is_empty() {
            errors.push("git.branch must not be empty".to_string());
        }
        if self.git.sync_tag.trim().is_empty() {
            errors.push("git.syncTag must not be empty".to_string());
        }
        if self.git.timeout_secs == 0 {
            errors.push("git.timeoutSecs must be greater than 0".to_string());
        }
        if self.git.poll_interval_secs == 0 {
            errors.push("git.pollIntervalSecs must be greater than 0".to_string());
        }
        let auth = &self.git.auth;
        if auth.auth_type == GitAuthType::Token
            && !crate::secrets::has_secret_source(
                auth.token_insecure.as_deref(),
                auth.token_file.as_deref(),
                Some(auth.token_env_var.as_str()),
            )
        {
            errors.push("git.auth: token auth needs token, tokenFile, or tokenEnvVar".to_string());
        }
        if Path::new(&self.git.path).is_absolute() || self.git.path.split('/').any(|s| s == "..") {
            errors.push(format!(
                "git.path must stay inside the repository: {}",
                self.git.path
            ));
        }

        if self.sync.namespaces.is_empty() {
            errors.push("sync.namespaces must list at least one namespace".to_string());
        }
        if self.sync.namespaces.iter().any(|ns| ns.trim().is_empty()) {
            errors.push("sync.namespaces must not contain empty names".to_string());
        }
        if self.sync.interval_secs == 0 {
            errors.push("sync.intervalSecs must be greater than 0".to_string());
        }

        if self.cluster.request_timeout_secs == 0 {
            errors.push("cluster.requestTimeoutSecs must be greater than 0".to_string());
        }
        if let Some(identity) = &self.cluster.self_identity {
            if let Err(e) = identity.parse::<ResourceId>() {
                errors.push(format!("cluster.selfIdentity: {}", e));
            }
        }
        for id in &self.cluster.exclude {
            if let Err(e) = id.parse::<ResourceId>() {
                errors.push(format!("cluster.exclude: {}", e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::InvalidConfig(errors.join("; ")))
        }
    }
}

/// Repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSettings {
    /// Upstream repository URL.
    #[serde(default)]
    pub url: String,

    /// Branch to sync from.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Manifest directory inside the repository.
    #[serde(default)]
    pub path: String,

    /// Prefix of the per-namespace watermark tag.
    #[serde(default = "default_sync_tag")]
    pub sync_tag: String,

    /// Upper bound for a single repository call.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// How often the mirror is refreshed from upstream.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Where the mirror clone lives. Defaults to the user cache directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_path: Option<String>,

    #[serde(default)]
    pub auth: GitAuthSettings,

    /// Tagger identity for watermark tags.
    #[serde(default = "default_user_name")]
    pub user_name: String,

    #[serde(default = "default_user_email")]
    pub user_email: String,
}

impl GitSettings {
    /// Watermark tag name for `namespace`.
    pub fn tag_for(&self, namespace: &str) -> String {
        format!("{}-{}", self.sync_tag, namespace)
    }

    /// Resolved mirror location.
    pub fn mirror_dir(&self) -> PathBuf {
        match &self.mirror_path {
            Some(path) => PathBuf::from(crate::secrets::expand_home(path)),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("kubesync")
                .join("mirror"),
        }
    }
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            branch: default_branch(),
            path: String::new(),
            sync_tag: default_sync_tag(),
            timeout_secs: default_timeout(),
            poll_interval_secs: default_poll_interval(),
            mirror_path: None,
            auth: GitAuthSettings::default(),
            user_name: default_user_name(),
            user_email: default_user_email(),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_sync_tag() -> String {
    "kubesync-sync".to_string()
}

fn default_timeout() -> u64 {
    20
}

fn default_poll_interval() -> u64 {
    300 // 5 minutes
}

fn default_user_name() -> String {
    "kubesync".to_string()
}

fn default_user_email() -> String {
    "kubesync@localhost".to_string()
}

/// Git authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitAuthSettings {
    /// Authentication type: none, token, or ssh-key.
    #[serde(default, rename = "type")]
    pub auth_type: GitAuthType,

    /// Environment variable containing the token.
    #[serde(default)]
    pub token_env_var: String,

    /// Direct token value. Stored in plaintext in the config file.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "token")]
    pub token_insecure: Option<String>,

    /// Path to file containing the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// Path to SSH key file.
    #[serde(default)]
    pub ssh_key_path: String,
}

/// Git authentication type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitAuthType {
    #[default]
    None,
    Token,
    SshKey,
}

/// When the watermark moves after an attempt that reached the apply step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatermarkPolicy {
    /// Advance even when resources failed; their errors live on in the event.
    Always,
    /// Hold the watermark while any resource or file failed.
    #[default]
    OnSuccess,
}

/// Sync loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Namespaces to keep in sync, one loop each.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Period of the sync timer.
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub watermark: WatermarkPolicy,

    /// Delete cluster objects that the repository no longer declares.
    #[serde(default = "default_true")]
    pub garbage_collect: bool,

    /// Version recorded on every applied resource.
    #[serde(default = "default_agent_version")]
    pub agent_version: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            interval_secs: default_sync_interval(),
            watermark: WatermarkPolicy::default(),
            garbage_collect: true,
            agent_version: default_agent_version(),
        }
    }
}

fn default_sync_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_agent_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Cluster access settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSettings {
    /// `kubectl` binary to run.
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Passed to every `kubectl` call as `--request-timeout`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// The agent's own object, as `namespace:kind/name`. Never exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_identity: Option<String>,

    /// Further objects to leave alone, as `namespace:kind/name`.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ClusterSettings {
    pub fn self_identity(&self) -> Result<Option<ResourceId>> {
        self.self_identity.as_deref().map(str::parse::<ResourceId>).transpose()
    }

    pub fn excluded(&self) -> Result<Vec<ResourceId>> {
        self.exclude.iter().map(|id| id.parse()).collect()
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            kubeconfig: None,
            context: None,
            request_timeout_secs: default_request_timeout(),
            self_identity: None,
            exclude: Vec::new(),
        }
    }
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSettings {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}
