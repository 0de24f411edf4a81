//! Per-namespace sync loop.
//!
//! Each loop owns a thread with a current-thread runtime and wakes up on the
//! sync timer, on a new upstream revision, on an explicit request or on
//! shutdown. Requests made while one is already pending collapse into it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::SyncController;

/// Asks a running loop for an extra sync.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    namespace: String,
    requests: mpsc::Sender<()>,
}

impl SyncHandle {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Requests a sync as soon as the loop is idle. Never blocks.
    ///
    /// Returns false when the loop has stopped.
    pub fn ask_for_sync(&self) -> bool {
        match self.requests.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                log::debug!("Sync of {} already pending", self.namespace);
                true
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Why the loop woke up.
#[derive(Debug, PartialEq, Eq)]
enum Wake {
    Timer,
    Upstream,
    Request,
    Shutdown,
}

/// Starts the sync loop for `controller` on its own thread.
///
/// `upstream` carries the latest upstream revision; only an actual change of
/// value triggers a sync. The loop exits once `shutdown` turns true or its
/// sender is dropped; an attempt in flight finishes first.
pub fn spawn_sync_loop(
    controller: Arc<SyncController>,
    interval: Duration,
    mut upstream: watch::Receiver<Option<String>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<(SyncHandle, JoinHandle<()>)> {
    let namespace = controller.namespace().to_string();
    let (requests_tx, mut requests) = mpsc::channel(1);

    let thread = std::thread::Builder::new()
        .name(format!("sync-{}", namespace))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start runtime for {}: {}", controller.namespace(), e);
                    return;
                }
            };

            rt.block_on(async move {
                // The first tick fires immediately.
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut last_upstream = upstream.borrow_and_update().clone();
                let mut upstream_open = true;

                loop {
                    if *shutdown.borrow() {
                        break;
                    }

                    let wake = tokio::select! {
                        _ = timer.tick() => Wake::Timer,
                        changed = upstream.changed(), if upstream_open => {
                            if changed.is_err() {
                                upstream_open = false;
                                continue;
                            }
                            let current = upstream.borrow_and_update().clone();
                            if current == last_upstream {
                                continue;
                            }
                            last_upstream = current;
                            Wake::Upstream
                        }
                        Some(()) = requests.recv() => Wake::Request,
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            Wake::Shutdown
                        }
                    };

                    if wake == Wake::Shutdown {
                        continue;
                    }

                    log::debug!("Sync of {} woken by {:?}", controller.namespace(), wake);
                    // Failures are reported as events; the next wake retries.
                    let _ = controller.sync_once().await;
                }

                log::info!("Sync loop for {} stopped", controller.namespace());
            });
        })?;

    Ok((
        SyncHandle {
            namespace,
            requests: requests_tx,
        },
        thread,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::Applier;
    use crate::cluster::ClusterSnapshot;
    use crate::controller::{Capabilities, ControllerSettings};
    use crate::config::WatermarkPolicy;
    use crate::error::{Result, SyncError};
    use crate::event::{EventReporter, ResourceError};
    use crate::plan::SyncDef;
    use crate::relabel::RelabelTable;
    use crate::repo::{CheckoutConfig, Repository, WorkingCopy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast::error::TryRecvError;

    /// Repository whose checkouts always fail, counting attempts.
    struct FailingRepo {
        checkouts: AtomicUsize,
    }

    #[async_trait]
    impl Repository for FailingRepo {
        async fn checkout(&self, _config: &CheckoutConfig) -> Result<Box<dyn WorkingCopy>> {
            self.checkouts.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::GitNetworkError("unreachable".to_string()))
        }

        async fn refresh(&self) -> Result<()> {
            Ok(())
        }

        async fn revision(&self) -> Result<String> {
            Ok("0".repeat(40))
        }
    }

    struct NoCluster;

    impl ClusterSnapshot for NoCluster {
        fn export(&self, _namespace: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct NoApplier;

    impl Applier for NoApplier {
        fn apply(&self, _namespace: &str, _sync: &SyncDef) -> Vec<ResourceError> {
            Vec::new()
        }
    }

    fn controller(repo: Arc<FailingRepo>, reporter: EventReporter) -> Arc<SyncController> {
        let caps = Capabilities {
            repo,
            cluster: Arc::new(NoCluster),
            applier: Arc::new(NoApplier),
            relabel: Arc::new(RelabelTable::standard()),
            reporter,
        };
        let settings = ControllerSettings {
            checkout: CheckoutConfig {
                sync_tag: "kubesync-sync-web".to_string(),
                user_name: "kubesync".to_string(),
                user_email: "kubesync@localhost".to_string(),
            },
            timeout_secs: 5,
            agent_version: "test".to_string(),
            watermark: WatermarkPolicy::OnSuccess,
            garbage_collect: true,
        };
        Arc::new(SyncController::new("web", caps, settings))
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_first_tick_immediate_then_shutdown() {
        let repo = Arc::new(FailingRepo {
            checkouts: AtomicUsize::new(0),
        });
        let reporter = EventReporter::default();
        let mut events = reporter.subscribe();
        let (_upstream_tx, upstream_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (_handle, thread) = spawn_sync_loop(
            controller(Arc::clone(&repo), reporter),
            Duration::from_secs(3600),
            upstream_rx,
            shutdown_rx,
        )
        .unwrap();

        assert!(wait_for(|| repo.checkouts.load(Ordering::SeqCst) == 1));
        let notification = loop {
            match events.try_recv() {
                Ok(n) => break n,
                Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("unexpected: {:?}", e),
            }
        };
        assert!(notification.event.failure.is_some());

        shutdown_tx.send(true).unwrap();
        thread.join().expect("sync loop panicked");
    }

    #[test]
    fn test_requests_and_upstream_changes_trigger_sync() {
        let repo = Arc::new(FailingRepo {
            checkouts: AtomicUsize::new(0),
        });
        let (upstream_tx, upstream_rx) = watch::channel(Some("a".to_string()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (handle, thread) = spawn_sync_loop(
            controller(Arc::clone(&repo), EventReporter::default()),
            Duration::from_secs(3600),
            upstream_rx,
            shutdown_rx,
        )
        .unwrap();
        assert!(wait_for(|| repo.checkouts.load(Ordering::SeqCst) == 1));

        assert!(handle.ask_for_sync());
        assert!(wait_for(|| repo.checkouts.load(Ordering::SeqCst) == 2));

        // Same revision again is not a change.
        upstream_tx.send(Some("a".to_string())).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(repo.checkouts.load(Ordering::SeqCst), 2);

        upstream_tx.send(Some("b".to_string())).unwrap();
        assert!(wait_for(|| repo.checkouts.load(Ordering::SeqCst) == 3));

        shutdown_tx.send(true).unwrap();
        thread.join().expect("sync loop panicked");
        assert!(!handle.ask_for_sync());
    }

    #[test]
    fn test_dropped_shutdown_sender_stops_loop() {
        let repo = Arc::new(FailingRepo {
            checkouts: AtomicUsize::new(0),
        });
        let (_upstream_tx, upstream_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (_handle, thread) = spawn_sync_loop(
            controller(repo, EventReporter::default()),
            Duration::from_secs(3600),
            upstream_rx,
            shutdown_rx,
        )
        .unwrap();

        drop(shutdown_tx);
        thread.join().expect("sync loop panicked");
    }
}
