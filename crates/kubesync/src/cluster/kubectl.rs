//! `kubectl`-backed cluster client.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use serde_yaml::Value;

use super::{ClusterClient, ClusterError, TrackedKind};
use crate::apply::{ApplyClient, Operation};
use crate::process::format_command_error;
use crate::resource::{Resource, SharedResource};

/// Talks to the cluster by running `kubectl`.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    request_timeout_secs: Option<u64>,
}

impl Kubectl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: None,
            context: None,
            request_timeout_secs: None,
        }
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Bounds each API request so a hung server cannot stall a sync.
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    /// Flags shared by every invocation.
    fn global_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push(OsString::from("--kubeconfig"));
            args.push(kubeconfig.clone().into_os_string());
        }
        if let Some(context) = &self.context {
            args.push(OsString::from("--context"));
            args.push(OsString::from(context));
        }
        if let Some(secs) = self.request_timeout_secs {
            args.push(OsString::from(format!("--request-timeout={}s", secs)));
        }
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.global_args());
        cmd
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, ClusterError> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ClusterError::Request(format!("failed to run kubectl: {}", e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // Feed stdin from a helper thread so a chatty stdout cannot block us.
            let input = input.to_vec();
            let writer = std::thread::spawn(move || pipe.write_all(&input));
            let output = child
                .wait_with_output()
                .map_err(|e| ClusterError::Request(e.to_string()))?;
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("kubectl closed stdin early: {}", e),
                Err(_) => log::warn!("kubectl stdin writer panicked"),
            }
            return Ok(output);
        }

        child
            .wait_with_output()
            .map_err(|e| ClusterError::Request(e.to_string()))
    }
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

/// Returns true when kubectl reports that the kind is not served.
fn is_unsupported_kind(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("doesn't have a resource type")
        || lower.contains("could not find the requested resource")
        || lower.contains("no matches for kind")
}

/// Joins documents into multidoc text for `kubectl --filename -`.
pub fn multidoc(resources: &[SharedResource]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for resource in resources {
        buffer.extend_from_slice(b"---\n");
        buffer.extend_from_slice(resource.bytes());
        if !resource.bytes().ends_with(b"\n") {
            buffer.push(b'\n');
        }
    }
    buffer
}

impl ClusterClient for Kubectl {
    fn list(&self, namespace: &str, kind: &TrackedKind) -> Result<Vec<Value>, ClusterError> {
        let plural = kind.qualified_plural();
        let output = self.run(
            &["get", &plural, "--namespace", namespace, "--output", "yaml"],
            None,
        )?;

        if !output.status.success() {
            let message = format_command_error(&output);
            if is_unsupported_kind(&message) {
                return Err(ClusterError::UnsupportedKind(kind.kind.to_string()));
            }
            return Err(ClusterError::Request(message));
        }

        let list: Value = serde_yaml::from_slice(&output.stdout)
            .map_err(|e| ClusterError::Decode(e.to_string()))?;

        Ok(list
            .get("items")
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default())
    }
}

impl ApplyClient for Kubectl {
    fn submit(
        &self,
        namespace: &str,
        operation: Operation,
        resources: &[SharedResource],
    ) -> Result<(), ClusterError> {
        if resources.is_empty() {
            return Ok(());
        }

        let mut args = vec![operation.verb(), "--namespace", namespace];
        if operation == Operation::Delete {
            args.push("--ignore-not-found");
        }
        args.extend(["--filename", "-"]);

        let output = self.run(&args, Some(&multidoc(resources)))?;
        if output.status.success() {
            log::debug!(
                "kubectl {} ok: {}",
                operation,
                String::from_utf8_lossy(&output.stdout).trim()
            );
            Ok(())
        } else {
            Err(ClusterError::Request(format_command_error(&output)))
        }
    }
}
