//! Coverage of `Coordinator::spawn_persistence_bridge`: registry/delegator
//! status changes published on the bus land in the recovery-snapshot stores
//! without either in-memory component touching SQL directly.

use std::time::Duration;

use agorum::config::CoordinatorConfig;
use agorum::coordinator::Coordinator;
use agorum::domain_types::{AgentCategory, AgentId, Priority};
use agorum::registry::AgentRecord;
use agorum::storage::{AgentStore, TaskStore};

async fn coordinator() -> (tempfile::TempDir, Coordinator) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = CoordinatorConfig::development();
    config.storage_path = dir.path().join("bridge.db");
    let coordinator = Coordinator::build(config).await.expect("coordinator builds");
    (dir, coordinator)
}

#[tokio::test]
async fn registering_an_agent_eventually_persists_its_status_snapshot() {
    let (_dir, coordinator) = coordinator().await;
    coordinator.spawn_persistence_bridge();

    let id = AgentId::generate();
    coordinator.registry.register(AgentRecord::new(id, AgentCategory::Market, "bridge-test", "", vec![])).unwrap();

    let mut found = false;
    for _ in 0..50 {
        let snapshots = coordinator.agent_store.load_all().await.unwrap();
        if snapshots.iter().any(|s| s.agent_id == id) {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(found, "registering an agent must eventually persist an AgentStatusRecord snapshot");
}

#[tokio::test]
async fn delegating_a_task_eventually_persists_its_snapshot() {
    let (_dir, coordinator) = coordinator().await;
    coordinator.spawn_persistence_bridge();

    let agent_id = AgentId::generate();
    coordinator.registry.register(AgentRecord::new(agent_id, AgentCategory::Market, "worker", "", vec![])).unwrap();

    let task_id = coordinator
        .delegator
        .delegate("fetch_price", std::collections::HashMap::new(), Some(agent_id), None, Priority::Normal, None)
        .await
        .unwrap();

    let mut found = false;
    for _ in 0..50 {
        let snapshots = coordinator.task_store.load_active().await.unwrap();
        if snapshots.iter().any(|s| s.task_id == task_id) {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(found, "delegating a task must eventually persist a PersistedTaskRecord snapshot");
}
