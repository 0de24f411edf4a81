//! Agent wiring: builds the default capabilities from config and runs one
//! sync loop per namespace plus the mirror poller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::apply::{Applier, BatchApplier};
use crate::cluster::{ClusterExporter, ClusterSnapshot, KindRegistry, Kubectl};
use crate::config::AgentConfig;
use crate::controller::{spawn_sync_loop, Capabilities, ControllerSettings, SyncController, SyncHandle};
use crate::error::Result;
use crate::event::{EventReporter, SyncNotification};
use crate::relabel::{Relabel, RelabelTable};
use crate::repo::{with_timeout, GitRepository, Repository};

/// A configured, not yet running agent.
pub struct Agent {
    config: AgentConfig,
    caps: Capabilities,
}

impl Agent {
    /// Production constructor: git mirror, `kubectl`, standard tables.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        config.validate()?;

        let mut kubectl = Kubectl::new(&config.cluster.kubectl)
            .with_request_timeout(config.cluster.request_timeout_secs);
        if let Some(kubeconfig) = &config.cluster.kubeconfig {
            kubectl = kubectl.with_kubeconfig(crate::secrets::expand_home(kubeconfig));
        }
        if let Some(context) = &config.cluster.context {
            kubectl = kubectl.with_context(context);
        }

        let mut exporter = ClusterExporter::new(kubectl.clone(), KindRegistry::standard())
            .with_excluded(config.cluster.excluded()?);
        if let Some(identity) = config.cluster.self_identity()? {
            exporter = exporter.with_self_identity(identity);
        }

        let caps = Capabilities {
            repo: Arc::new(GitRepository::new(config.git.clone())),
            cluster: Arc::new(exporter),
            applier: Arc::new(BatchApplier::new(kubectl)),
            relabel: Arc::new(RelabelTable::standard()),
            reporter: EventReporter::default(),
        };

        Ok(Self { config, caps })
    }

    /// Builds an agent around custom capabilities.
    pub fn new(
        config: AgentConfig,
        repo: Arc<dyn Repository>,
        cluster: Arc<dyn ClusterSnapshot>,
        applier: Arc<dyn Applier>,
        relabel: Arc<dyn Relabel>,
    ) -> Self {
        Self {
            config,
            caps: Capabilities {
                repo,
                cluster,
                applier,
                relabel,
                reporter: EventReporter::default(),
            },
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Subscribes before start so no notification is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.caps.reporter.subscribe()
    }

    /// Spawns the mirror poller and one sync loop per configured namespace.
    pub fn start(self) -> Result<AgentHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (upstream_tx, upstream_rx) = watch::channel(None);
        let mut threads = Vec::new();

        threads.push(spawn_mirror_poller(
            Arc::clone(&self.caps.repo),
            Duration::from_secs(self.config.git.poll_interval_secs),
            self.config.git.timeout_secs,
            upstream_tx,
            shutdown_rx.clone(),
        )?);

        let interval = Duration::from_secs(self.config.sync.interval_secs);
        let mut handles = BTreeMap::new();
        for namespace in &self.config.sync.namespaces {
            let controller = SyncController::new(
                namespace.clone(),
                self.caps.clone(),
                ControllerSettings::from_config(&self.config, namespace),
            );
            let (handle, thread) = spawn_sync_loop(
                Arc::new(controller),
                interval,
                upstream_rx.clone(),
                shutdown_rx.clone(),
            )?;
            handles.insert(namespace.clone(), handle);
            threads.push(thread);
        }

        log::info!(
            "Agent started for {} namespace(s), syncing from {}",
            handles.len(),
            self.config.git.url
        );

        Ok(AgentHandle {
            handles,
            threads,
            shutdown: shutdown_tx,
            reporter: self.caps.reporter,
        })
    }
}

/// Control surface of a running agent.
pub struct AgentHandle {
    handles: BTreeMap<String, SyncHandle>,
    threads: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    reporter: EventReporter,
}

impl AgentHandle {
    /// Asks for an extra sync of `namespace`. False for unmanaged namespaces.
    pub fn ask_for_sync(&self, namespace: &str) -> bool {
        self.handles
            .get(namespace)
            .map(SyncHandle::ask_for_sync)
            .unwrap_or(false)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.reporter.subscribe()
    }

    /// Stops every loop and waits for in-flight attempts to finish.
    pub fn stop(self) {
        let _ = self.shutdown.send(true);
        for thread in self.threads {
            if thread.join().is_err() {
                log::error!("Sync thread panicked");
            }
        }
        log::info!("Agent stopped");
    }
}

/// Refreshes the mirror periodically and publishes the upstream revision.
fn spawn_mirror_poller(
    repo: Arc<dyn Repository>,
    interval: Duration,
    timeout_secs: u64,
    upstream: watch::Sender<Option<String>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mirror-poller".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start mirror poller runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = timer.tick() => {},
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    if *shutdown.borrow() {
                        break;
                    }

                    let revision = async {
                        with_timeout(timeout_secs, repo.refresh()).await?;
                        with_timeout(timeout_secs, repo.revision()).await
                    };
                    match revision.await {
                        Ok(revision) => {
                            upstream.send_if_modified(|current| {
                                if current.as_deref() == Some(revision.as_str()) {
                                    false
                                } else {
                                    log::info!("Upstream moved to {}", revision);
                                    *current = Some(revision);
                                    true
                                }
                            });
                        }
                        Err(e) => log::warn!("Mirror refresh failed: {}", e),
                    }
                }
            });
        })
}
