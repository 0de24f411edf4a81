//! Agent start/stop against fake capabilities.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::TryRecvError};

use common::{FakeCluster, FakeRepo, SyncHarness, NAMESPACE};
use kubesync::{
    Agent, AgentConfig, BatchApplier, ClusterExporter, KindRegistry, RelabelTable, ResourceId,
    SyncNotification,
};

const CONFIG: &str = r#"
git:
  url: https://example.com/deploy.git
  pollIntervalSecs: 3600
sync:
  namespaces: [web]
  intervalSecs: 3600
"#;

const SERVICE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: svc-a
"#;

fn agent(repo: &FakeRepo, cluster: &FakeCluster) -> Agent {
    Agent::new(
        AgentConfig::from_yaml(CONFIG).unwrap(),
        Arc::new(repo.clone()),
        Arc::new(ClusterExporter::new(cluster.clone(), KindRegistry::standard())),
        Arc::new(BatchApplier::new(cluster.clone())),
        Arc::new(RelabelTable::standard()),
    )
}

fn next_notification(rx: &mut broadcast::Receiver<SyncNotification>) -> SyncNotification {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match rx.try_recv() {
            Ok(notification) => return notification,
            Err(TryRecvError::Empty) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10))
            }
            Err(e) => panic!("no notification: {:?}", e),
        }
    }
}

#[test]
fn test_agent_syncs_on_start_and_on_request() {
    let harness = SyncHarness::new();
    harness.commit(&[("svc-a.yaml", Some(SERVICE))]);

    let agent = agent(&harness.repo, &harness.cluster);
    let mut events = agent.subscribe();
    let handle = agent.start().unwrap();
    assert_eq!(handle.namespaces().collect::<Vec<_>>(), vec![NAMESPACE]);

    let first = next_notification(&mut events);
    assert!(first.event.initial_sync);
    assert!(first.event.is_clean());
    assert!(harness
        .cluster
        .contains(&ResourceId::new(NAMESPACE, "Service", "svc-a")));

    assert!(handle.ask_for_sync(NAMESPACE));
    assert!(!handle.ask_for_sync("payments"));
    let second = next_notification(&mut events);
    assert!(!second.event.initial_sync);
    assert!(second.event.resource_ids.is_empty());

    handle.stop();
}

#[test]
fn test_agent_reports_unreachable_repository() {
    let harness = SyncHarness::new();
    harness.repo.fail_checkout(Some("could not resolve host"));

    let agent = agent(&harness.repo, &harness.cluster);
    let mut events = agent.subscribe();
    let handle = agent.start().unwrap();

    let notification = next_notification(&mut events);
    assert!(notification.event.failure.is_some());

    handle.stop();
    assert!(harness.cluster.ids().is_empty());
}
