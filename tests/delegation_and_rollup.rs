//! End-to-end coverage of capability-routed delegation and parent/subtask
//! rollup (Components C and D working together, with no REST or storage
//! layer involved).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agorum::bus::EventBus;
use agorum::delegator::{TaskDelegator, TaskEvent, TaskStatus};
use agorum::domain_types::{AgentCategory, AgentId, Capability, Priority};
use agorum::registry::{AgentRecord, AgentRegistry};
use agorum::time_provider::test_time_provider;
use serde_json::json;

fn harness() -> (Arc<AgentRegistry>, Arc<TaskDelegator>) {
    let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&bus),
        test_time_provider(),
        Duration::from_secs(60),
        Duration::from_secs(300),
    ));
    let delegator = Arc::new(TaskDelegator::new(Arc::clone(&registry), bus, test_time_provider()));
    (registry, delegator)
}

#[tokio::test]
async fn capability_routed_delegation_ties_broken_by_agent_id_and_completes_with_result() {
    let (registry, delegator) = harness();
    let required = Capability::named("market_data").with_tag("crypto");

    let mut ids = vec![AgentId::generate(), AgentId::generate()];
    ids.sort_by_key(ToString::to_string);
    let (m1, m2) = (ids[0], ids[1]);

    registry
        .register(AgentRecord::new(m1, AgentCategory::Market, "m1", "crypto desk", vec![required.clone()]))
        .unwrap();
    registry
        .register(AgentRecord::new(
            m2,
            AgentCategory::Market,
            "m2",
            "crypto and stocks desk",
            vec![Capability::named("market_data").with_tag("crypto").with_tag("stocks")],
        ))
        .unwrap();

    let task_id = delegator
        .delegate("fetch_price", HashMap::new(), None, Some(&required), Priority::Normal, None)
        .await
        .unwrap();

    let assigned = delegator.get(task_id).unwrap();
    assert_eq!(assigned.assigned_agent, Some(m1), "lowest agent id among equally-loaded qualified agents wins");
    assert_eq!(assigned.status, TaskStatus::Assigned);

    let result = json!({"bitcoin": {"price": 50000, "volume": 1_000_000}});
    let status = delegator.apply(task_id, TaskEvent::Complete(result.clone())).await.unwrap();
    assert_eq!(status, TaskStatus::Completed);

    let completed = delegator.get(task_id).unwrap();
    assert_eq!(completed.result, Some(result));
    assert!(
        completed.transitioned_at.windows(2).all(|pair| pair[0].1 <= pair[1].1),
        "lifecycle timestamps must be monotonically non-decreasing"
    );
}

#[tokio::test]
async fn capability_mismatch_leaves_no_eligible_agent() {
    let (registry, delegator) = harness();
    let id = AgentId::generate();
    registry
        .register(AgentRecord::new(id, AgentCategory::Market, "m1", "", vec![Capability::named("market_data").with_tag("stocks")]))
        .unwrap();

    let required = Capability::named("market_data").with_tag("crypto");
    let result = delegator.delegate("fetch_price", HashMap::new(), None, Some(&required), Priority::Normal, None).await;
    assert!(result.is_err(), "no registered agent offers the crypto tag, delegation must fail");
}

#[tokio::test]
async fn parent_subtask_rollup_merges_results_keyed_by_subtask_id_in_any_completion_order() {
    let (registry, delegator) = harness();
    let agent = AgentId::generate();
    registry.register(AgentRecord::new(agent, AgentCategory::Market, "worker", "", vec![])).unwrap();

    let parent_id = delegator.create_task("decompose_report", HashMap::new(), None, Priority::Normal, None);
    let subtasks = delegator
        .decompose(
            parent_id,
            vec![
                ("s1".to_string(), HashMap::new(), Priority::Normal, None),
                ("s2".to_string(), HashMap::new(), Priority::Normal, None),
                ("s3".to_string(), HashMap::new(), Priority::Normal, None),
            ],
        )
        .unwrap();
    assert_eq!(subtasks.len(), 3);

    for &subtask in &subtasks {
        delegator.assign(subtask, agent).await.unwrap();
    }

    // Complete out of order: s2, then s3, then s1 — rollup must not depend on order.
    delegator.apply(subtasks[1], TaskEvent::Complete(json!("b"))).await.unwrap();
    assert_eq!(delegator.get(parent_id).unwrap().status, TaskStatus::Created, "parent rolls up only once every subtask is terminal");

    delegator.apply(subtasks[2], TaskEvent::Complete(json!("c"))).await.unwrap();
    delegator.apply(subtasks[0], TaskEvent::Complete(json!("a"))).await.unwrap();

    let parent = delegator.get(parent_id).unwrap();
    assert_eq!(parent.status, TaskStatus::Completed);
    let expected = json!({
        subtasks[0].to_string(): "a",
        subtasks[1].to_string(): "b",
        subtasks[2].to_string(): "c",
    });
    assert_eq!(parent.result, Some(expected));
}

#[tokio::test]
async fn one_failed_subtask_fails_the_parent_even_if_siblings_completed() {
    let (registry, delegator) = harness();
    let agent = AgentId::generate();
    registry.register(AgentRecord::new(agent, AgentCategory::Market, "worker", "", vec![])).unwrap();

    let parent_id = delegator.create_task("decompose_report", HashMap::new(), None, Priority::Normal, None);
    let subtasks = delegator
        .decompose(
            parent_id,
            vec![
                ("s1".to_string(), HashMap::new(), Priority::Normal, None),
                ("s2".to_string(), HashMap::new(), Priority::Normal, None),
            ],
        )
        .unwrap();
    for &subtask in &subtasks {
        delegator.assign(subtask, agent).await.unwrap();
    }

    delegator.apply(subtasks[0], TaskEvent::Complete(json!("ok"))).await.unwrap();
    delegator.apply(subtasks[1], TaskEvent::Fail("upstream timeout".to_string())).await.unwrap();

    assert_eq!(delegator.get(parent_id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn unregistering_an_agent_removes_it_from_every_lookup() {
    let (registry, _delegator) = harness();
    let id = AgentId::generate();
    let cap = Capability::named("market_data");
    registry.register(AgentRecord::new(id, AgentCategory::Market, "m1", "", vec![cap.clone()])).unwrap();
    assert!(registry.get(id).is_some());
    assert_eq!(registry.select_least_loaded(&cap), Some(id));

    registry.unregister(id);

    assert!(registry.get(id).is_none());
    assert!(registry.find_by_type(AgentCategory::Market).is_empty());
    assert_eq!(registry.select_least_loaded(&cap), None);
}
