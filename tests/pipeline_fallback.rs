//! End-to-end coverage of a pipeline stage falling back to an alternate
//! stage when its primary agent category has no eligible responder
//! (Components G and H working together over a fake bus responder).

use std::sync::Arc;
use std::time::Duration;

use agorum::bus::{Event, EventBus, Filter};
use agorum::communication::CommunicationManager;
use agorum::domain_types::AgentCategory;
use agorum::pipeline::{PipelineDefinition, PipelineController, Stage};
use agorum::realtime::RealtimeBroadcaster;
use agorum::registry::{AgentRecord, AgentRegistry};
use agorum::domain_types::AgentId;
use agorum::time_provider::test_time_provider;
use serde_json::{json, Value};

/// Replies "ok" to every dispatched command, tagging the response with
/// `stage` so the test can see which responder answered last.
fn install_stage_responder(bus: &Arc<EventBus>, stage_label: &'static str) {
    let bus = Arc::clone(bus);
    bus.subscribe(
        Filter::Name("message_dispatched".to_string()),
        Arc::new(move |event: Event| {
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                if event.payload.get("body_kind").and_then(Value::as_str) != Some("Command") {
                    return;
                }
                let Some(correlation_id) = event.correlation_id else { return };
                let payload = json!({"body_kind": "Response", "status": "ok", "stage": stage_label});
                let response = Event::notification("message_dispatched", "test-responder", payload).with_correlation(correlation_id);
                let _ = bus.publish(response).await;
            })
        }),
    );
}

#[tokio::test]
async fn required_stage_with_no_eligible_agent_falls_back_and_the_run_still_succeeds() {
    let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&bus),
        test_time_provider(),
        Duration::from_secs(60),
        Duration::from_secs(300),
    ));

    // Stage "a" targets Market, but no Market agent is ever registered, so
    // dispatch_to_category immediately reports NoEligibleAgent and the
    // pipeline falls back to stage "b" without waiting out a timeout.
    registry
        .register(AgentRecord::new(AgentId::generate(), AgentCategory::Logistics, "b-worker", "", vec![]))
        .unwrap();
    registry
        .register(AgentRecord::new(AgentId::generate(), AgentCategory::Content, "c-worker", "", vec![]))
        .unwrap();

    let communication = Arc::new(CommunicationManager::new(Arc::clone(&registry), Arc::clone(&bus)).with_response_timeout(Duration::from_millis(500)));
    communication.install_response_listener();
    install_stage_responder(&bus, "B");
    install_stage_responder(&bus, "C");

    let broadcaster = Arc::new(RealtimeBroadcaster::new(64));
    let controller = PipelineController::new(
        Arc::clone(&communication),
        Arc::clone(&broadcaster),
        test_time_provider(),
        Duration::from_millis(200),
        1.0,
    );

    let definition = PipelineDefinition::sequential(
        "fallback-run",
        "stage a falls back to stage b, then stage c runs",
        vec![
            Stage::new("a", AgentCategory::Market, "unstable").with_fallback("b"),
            Stage::new("b", AgentCategory::Logistics, "stable"),
            Stage::new("c", AgentCategory::Content, "finish"),
        ],
    );
    controller.register_pipeline(definition).unwrap();

    let execution_id = agorum::domain_types::ExecutionId::generate();
    let mut progress_stream = broadcaster.subscribe_workflow(execution_id, 32);

    let result = controller.execute("fallback-run", json!({}), Some(execution_id)).await.unwrap();

    assert!(result.success, "stage a's fallback to b must let the run succeed");
    assert!(result.stages_completed >= 2, "fallback credit for a plus b's own turn should count at least twice");
    assert_eq!(result.result_data.get("stage"), Some(&json!("C")), "the last stage to respond wins the merge");

    let mut progresses = Vec::new();
    while let Ok(message) = progress_stream.try_recv() {
        progresses.push(message.payload["progress"].as_f64().unwrap());
    }
    assert!(!progresses.is_empty(), "pipeline execution must broadcast workflow_update progress events");
    assert!(
        progresses.windows(2).all(|pair| pair[0] <= pair[1]),
        "progress must never regress across the run: {progresses:?}"
    );
    assert!((progresses.last().unwrap() - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn required_stage_with_no_fallback_and_no_agent_aborts_the_run() {
    let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&bus),
        test_time_provider(),
        Duration::from_secs(60),
        Duration::from_secs(300),
    ));
    let communication = Arc::new(CommunicationManager::new(registry, Arc::clone(&bus)).with_response_timeout(Duration::from_millis(100)));
    let broadcaster = Arc::new(RealtimeBroadcaster::new(64));
    let controller = PipelineController::new(communication, broadcaster, test_time_provider(), Duration::from_millis(100), 1.0);

    let definition = PipelineDefinition::sequential(
        "doomed-run",
        "single required stage, nobody home",
        vec![Stage::new("a", AgentCategory::Market, "unstable")],
    );
    controller.register_pipeline(definition).unwrap();

    let result = controller.execute("doomed-run", json!({}), None).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.stages_failed, 1);
}
