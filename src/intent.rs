//! Intent router and chat orchestrator.
//!
//! `ChatOrchestrator::handle_message` is the single entry point a chat
//! transport calls per inbound user turn: classify intent, detect a
//! workflow trigger, route to (and possibly hand off between) agents, and
//! persist the exchange. Grounded in the same "component owns its state,
//! suspension points never hold a lock" discipline as `pipeline.rs`, with
//! routing decisions themselves being pure functions over a scored keyword
//! table so they're unit-testable without any collaborator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::communication::CommunicationManager;
use crate::domain_types::{AgentCategory, AgentId, Priority};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::llm::LlmAdapter;
use crate::message::Message;
use crate::pipeline::PipelineController;
use crate::realtime::RealtimeBroadcaster;
use crate::registry::AgentRegistry;
use crate::storage::{ConversationStore, MessageRole, StoredMessage};

/// The closed set of routable chat intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    /// Questions about listings, competitors, or catalog state.
    MarketQuery,
    /// Questions about inventory levels or restocking.
    InventoryQuery,
    /// Questions about trends, performance, or forecasting.
    AnalyticsQuery,
    /// Questions about shipping, fulfillment, or carriers.
    LogisticsQuery,
    /// Questions about copy, images, or listing content.
    ContentQuery,
    /// Strategic or approval-level questions.
    ExecutiveQuery,
    /// Anything not confidently matched above.
    GeneralQuery,
}

impl Intent {
    fn as_str(self) -> &'static str {
        match self {
            Self::MarketQuery => "market_query",
            Self::InventoryQuery => "inventory_query",
            Self::AnalyticsQuery => "analytics_query",
            Self::LogisticsQuery => "logistics_query",
            Self::ContentQuery => "content_query",
            Self::ExecutiveQuery => "executive_query",
            Self::GeneralQuery => "general_query",
        }
    }

    /// The agent category that natively handles this intent.
    #[must_use]
    pub fn primary_category(self) -> AgentCategory {
        match self {
            Self::MarketQuery | Self::InventoryQuery => AgentCategory::Market,
            Self::AnalyticsQuery => AgentCategory::Specialist,
            Self::LogisticsQuery => AgentCategory::Logistics,
            Self::ContentQuery => AgentCategory::Content,
            Self::ExecutiveQuery => AgentCategory::Executive,
            Self::GeneralQuery => AgentCategory::Utility,
        }
    }

    /// Compatible categories to try, in order, if the primary one has no
    /// available agent: Market, Specialist (analytics), and Executive form
    /// a compatibility triangle; everything else falls back to Utility
    /// (the general-assistant category) last.
    #[must_use]
    pub fn fallback_categories(self) -> Vec<AgentCategory> {
        let mut chain = match self.primary_category() {
            AgentCategory::Market => vec![AgentCategory::Specialist, AgentCategory::Executive],
            AgentCategory::Specialist => vec![AgentCategory::Market, AgentCategory::Executive],
            AgentCategory::Executive => vec![AgentCategory::Market, AgentCategory::Specialist],
            other => vec![other],
        };
        chain.push(AgentCategory::Utility);
        chain
    }
}

#[derive(Clone, Copy)]
enum Weight {
    High,
    Medium,
    Low,
}

impl Weight {
    fn value(self) -> f64 {
        match self {
            Self::High => 3.0,
            Self::Medium => 1.5,
            Self::Low => 1.0,
        }
    }
}

const INTENT_KEYWORDS: &[(Intent, &[(Weight, &[&str])])] = &[
    (
        Intent::MarketQuery,
        &[
            (Weight::High, &["competitor", "listing", "marketplace", "catalog"]),
            (Weight::Medium, &["price", "pricing", "sell", "buy box"]),
            (Weight::Low, &["product", "item"]),
        ],
    ),
    (
        Intent::InventoryQuery,
        &[
            (Weight::High, &["inventory", "stock", "restock", "out of stock"]),
            (Weight::Medium, &["warehouse", "fulfillment center", "units"]),
            (Weight::Low, &["quantity", "available"]),
        ],
    ),
    (
        Intent::AnalyticsQuery,
        &[
            (Weight::High, &["trend", "forecast", "analytics", "performance"]),
            (Weight::Medium, &["revenue", "conversion", "report"]),
            (Weight::Low, &["data", "numbers"]),
        ],
    ),
    (
        Intent::LogisticsQuery,
        &[
            (Weight::High, &["shipping", "carrier", "fulfillment", "delivery"]),
            (Weight::Medium, &["warehouse", "tracking", "freight"]),
            (Weight::Low, &["package", "ship"]),
        ],
    ),
    (
        Intent::ContentQuery,
        &[
            (Weight::High, &["copy", "description", "image", "content"]),
            (Weight::Medium, &["title", "bullet point", "photo"]),
            (Weight::Low, &["write", "draft"]),
        ],
    ),
    (
        Intent::ExecutiveQuery,
        &[
            (Weight::High, &["approve", "strategy", "budget", "decision"]),
            (Weight::Medium, &["plan", "review", "escalate"]),
            (Weight::Low, &["should we", "recommend"]),
        ],
    ),
];

const CLASSIFICATION_THRESHOLD: f64 = 0.3;

/// The workflow-trigger phrase catalog: substring match on the lowercased
/// message maps directly to a registered pipeline template.
const WORKFLOW_TRIGGERS: &[(&str, &str)] = &[
    ("analyze this product", "pricing_update"),
    ("optimize my listing", "content_generation"),
    ("pricing strategy", "pricing_update"),
    ("market research", "full_marketplace_cycle"),
    ("help me decide", "full_marketplace_cycle"),
    ("sync my inventory", "inventory_sync"),
];

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn rule_score(text: &str, keywords: &[(Weight, &[&str])]) -> (f64, bool) {
    let lowercase = text.to_lowercase();
    let mut raw = 0.0;
    let mut tiers_hit = 0;
    for (weight, terms) in keywords {
        let mut hit_this_tier = false;
        for term in *terms {
            if lowercase.contains(term) {
                raw += weight.value();
                hit_this_tier = true;
            }
        }
        if hit_this_tier {
            tiers_hit += 1;
        }
    }
    (raw, tiers_hit > 1)
}

fn context_score(history: &[StoredMessage], keywords: &[(Weight, &[&str])]) -> f64 {
    let mut score: f64 = 0.0;
    for message in history.iter().rev().take(5) {
        let lowercase = message.content.to_lowercase();
        for (weight, terms) in keywords {
            let hit = terms.iter().any(|term| lowercase.contains(term));
            if hit {
                score += match weight {
                    Weight::High => 0.15,
                    Weight::Medium | Weight::Low => 0.10,
                };
            }
        }
    }
    score.min(0.3)
}

/// Scores `text` (with `history` as recent context) against every intent
/// in the closed set and returns the winner with its blended confidence,
/// or `GeneralQuery` if nothing clears the classification threshold.
#[must_use]
pub fn classify_intent(text: &str, history: &[StoredMessage]) -> (Intent, f64) {
    let length_factor = (word_count(text) as f64 / 10.0).max(0.5);
    let mut best: Option<(Intent, f64)> = None;

    for (intent, keywords) in INTENT_KEYWORDS {
        let (raw, multi_tier) = rule_score(text, keywords);
        let mut rule = raw / length_factor;
        if multi_tier {
            rule *= 1.2;
        }
        rule = rule.clamp(0.0, 1.0);
        let context = context_score(history, keywords);
        let combined = (0.7 * rule + 0.3 * context).clamp(0.0, 1.0);

        if best.is_none_or(|(_, best_score)| combined > best_score) {
            best = Some((*intent, combined));
        }
    }

    match best {
        Some((intent, score)) if score >= CLASSIFICATION_THRESHOLD => (intent, score),
        Some((_, score)) => (Intent::GeneralQuery, score),
        None => (Intent::GeneralQuery, 0.0),
    }
}

/// Matches `text` against the workflow-trigger phrase catalog, returning
/// the template id of the pipeline it should launch.
#[must_use]
pub fn detect_workflow_trigger(text: &str) -> Option<&'static str> {
    let lowercase = text.to_lowercase();
    WORKFLOW_TRIGGERS.iter().find(|(phrase, _)| lowercase.contains(phrase)).map(|(_, template)| *template)
}

/// Context describing an agent handoff within a conversation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HandoffContext {
    /// When the handoff was decided.
    pub timestamp: SystemTime,
    /// Previously assigned agent, if any.
    pub from: Option<AgentId>,
    /// Newly assigned agent.
    pub to: AgentId,
    /// Human-readable reason, derived from the winning intent.
    pub reason: String,
    /// The classifier's confidence in the routing decision.
    pub confidence: f64,
    /// Short summary of the last few turns, for the receiving agent's context.
    pub summary: Vec<String>,
}

/// Ties together conversation storage, agent routing, realtime broadcast,
/// pipeline launches, and the LLM fallback into one chat turn handler.
pub struct ChatOrchestrator {
    conversations: Arc<dyn ConversationStore>,
    registry: Arc<AgentRegistry>,
    communication: Arc<CommunicationManager>,
    broadcaster: Arc<RealtimeBroadcaster>,
    pipelines: Arc<PipelineController>,
    llm: Arc<dyn LlmAdapter>,
    coordinator_id: AgentId,
}

impl ChatOrchestrator {
    /// Builds an orchestrator over its collaborators. `coordinator_id`
    /// identifies the orchestrator itself as a message sender.
    #[must_use]
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        registry: Arc<AgentRegistry>,
        communication: Arc<CommunicationManager>,
        broadcaster: Arc<RealtimeBroadcaster>,
        pipelines: Arc<PipelineController>,
        llm: Arc<dyn LlmAdapter>,
    ) -> Self {
        Self {
            conversations,
            registry,
            communication,
            broadcaster,
            pipelines,
            llm,
            coordinator_id: AgentId::generate(),
        }
    }

    /// Resolves the special conversation-id forms (`main` sentinel,
    /// non-UUID raw titles) into a canonical, persisted conversation id.
    async fn resolve_conversation_id(&self, user_id: &str, conversation_id: &str) -> CoordinatorResult<String> {
        if conversation_id == "main" {
            if let Some(existing) = self.conversations.latest_conversation_for_user(user_id).await? {
                return Ok(existing);
            }
            let fresh = Uuid::new_v4().to_string();
            self.conversations.ensure_conversation(&fresh, user_id, "New conversation").await?;
            return Ok(fresh);
        }

        if Uuid::parse_str(conversation_id).is_ok() {
            self.conversations.ensure_conversation(conversation_id, user_id, conversation_id).await?;
            return Ok(conversation_id.to_string());
        }

        let fresh = Uuid::new_v4().to_string();
        self.conversations.ensure_conversation(&fresh, user_id, conversation_id).await?;
        Ok(fresh)
    }

    fn select_agent(&self, intent: Intent) -> Option<AgentId> {
        for category in intent.fallback_categories() {
            if let Some(agent) = self.registry.select_least_loaded_in_category(category) {
                return Some(agent);
            }
        }
        None
    }

    fn build_handoff(
        &self,
        previous: Option<AgentId>,
        target: AgentId,
        intent: Intent,
        confidence: f64,
        history: &[StoredMessage],
    ) -> Option<HandoffContext> {
        if previous == Some(target) {
            return None;
        }
        Some(HandoffContext {
            timestamp: SystemTime::now(),
            from: previous,
            to: target,
            reason: format!("routed by intent classifier as {}", intent.as_str()),
            confidence,
            summary: history.iter().rev().take(3).map(|m| m.content.clone()).collect(),
        })
    }

    async fn dispatch_to_agent(&self, agent: AgentId, text: &str, handoff: Option<&HandoffContext>) -> CoordinatorResult<String> {
        let mut params: HashMap<String, Value> = HashMap::new();
        params.insert("text".to_string(), Value::String(text.to_string()));
        if let Some(handoff) = handoff {
            params.insert("handoff".to_string(), serde_json::to_value(handoff).unwrap_or(Value::Null));
        }

        let message = Message::command(self.coordinator_id, "chat_message", params, None)
            .to(agent)
            .with_priority(Priority::High);

        match self.communication.send_and_await(message).await {
            Ok(response) => Ok(response
                .get("result")
                .and_then(|r| r.get("content"))
                .and_then(|c| c.as_str())
                .map(std::string::ToString::to_string)
                .unwrap_or_else(|| "I've noted your request.".to_string())),
            Err(_) => self.llm.complete(text).await,
        }
    }

    /// Spawns the pipeline named by `template_id` in the background and
    /// returns the acknowledgement text shown to the user immediately.
    fn launch_workflow(&self, template_id: &'static str, conversation_id: String) -> String {
        let pipelines = Arc::clone(&self.pipelines);
        let instance_id = format!("{template_id}-{}", Uuid::new_v4());
        let broadcaster = Arc::clone(&self.broadcaster);
        let conversations = Arc::clone(&self.conversations);
        tokio::spawn(async move {
            if let Err(error) = pipelines.create_from_template(template_id, instance_id.clone()) {
                tracing::warn!(%error, template_id, "failed to instantiate workflow template");
                return;
            }
            let outcome = match pipelines.execute(&instance_id, serde_json::json!({"conversation_id": conversation_id}), None).await {
                Ok(result) => {
                    tracing::info!(execution_id = %result.execution_id, success = result.success, "workflow run complete");
                    if result.success {
                        format!("The {template_id} workflow finished: {}", result.result_data)
                    } else {
                        format!("The {template_id} workflow stopped early after {} of its stages.", result.stages_completed)
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "workflow execution failed to start");
                    broadcaster.broadcast("system_alert", serde_json::json!({"error": error.to_string()})).await;
                    format!("The {template_id} workflow could not be started: {error}")
                }
            };
            let final_message = StoredMessage {
                message_id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.clone(),
                role: MessageRole::System,
                content: outcome.clone(),
                metadata: serde_json::json!({"workflow_template": template_id}),
                created_at: SystemTime::now(),
            };
            if let Err(error) = conversations.append_message(&final_message).await {
                tracing::warn!(%error, "failed to persist workflow completion message");
            }
            broadcaster.broadcast_chat_message(&conversation_id, None, serde_json::json!({"content": outcome})).await;
        });
        format!("I'll take care of that — launching the {template_id} workflow now; this usually takes 30-60s.")
    }

    /// Handles one inbound chat turn end to end: resolves the conversation,
    /// classifies intent, triggers a workflow or routes to an agent,
    /// persists both sides of the exchange, and returns the reply record.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError` if conversation persistence fails.
    #[instrument(skip(self, text, context))]
    pub async fn handle_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        text: &str,
        context: Value,
    ) -> CoordinatorResult<StoredMessage> {
        let conversation_id = self.resolve_conversation_id(user_id, conversation_id).await?;
        let history = self.conversations.recent_messages(&conversation_id, 5).await?;

        let user_message = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            role: MessageRole::User,
            content: text.to_string(),
            metadata: context,
            created_at: SystemTime::now(),
        };
        self.conversations.append_message(&user_message).await?;

        if let Some(template_id) = detect_workflow_trigger(text) {
            let ack_text = self.launch_workflow(template_id, conversation_id.clone());
            let ack = StoredMessage {
                message_id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.clone(),
                role: MessageRole::System,
                content: ack_text,
                metadata: serde_json::json!({"workflow_template": template_id}),
                created_at: SystemTime::now(),
            };
            self.conversations.append_message(&ack).await?;
            self.broadcaster
                .broadcast_chat_message(&conversation_id, Some(user_id), serde_json::json!({"content": ack.content}))
                .await;
            return Ok(ack);
        }

        let (intent, confidence) = classify_intent(text, &history);
        let conversation = self.conversations.get_conversation(&conversation_id).await?;
        let previous_agent = conversation.and_then(|c| c.assigned_agent_id);

        let Some(target_agent) = self.select_agent(intent) else {
            let fallback = self.llm.complete(text).await?;
            return self.persist_and_broadcast(&conversation_id, user_id, intent, confidence, None, fallback).await;
        };

        let handoff = self.build_handoff(previous_agent, target_agent, intent, confidence, &history);
        if handoff.is_some() {
            self.conversations.set_assigned_agent(&conversation_id, target_agent).await?;
        }

        self.broadcaster.send_typing(&conversation_id, true, Some(intent.as_str())).await;
        let reply_text = self.dispatch_to_agent(target_agent, text, handoff.as_ref()).await?;
        self.broadcaster.send_typing(&conversation_id, false, Some(intent.as_str())).await;

        self.persist_and_broadcast(&conversation_id, user_id, intent, confidence, handoff, reply_text).await
    }

    async fn persist_and_broadcast(
        &self,
        conversation_id: &str,
        user_id: &str,
        intent: Intent,
        confidence: f64,
        handoff: Option<HandoffContext>,
        reply_text: String,
    ) -> CoordinatorResult<StoredMessage> {
        let reply = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: MessageRole::Agent,
            content: reply_text,
            metadata: serde_json::json!({
                "intent": intent.as_str(),
                "confidence": confidence,
                "handoff": handoff.is_some(),
            }),
            created_at: SystemTime::now(),
        };
        self.conversations.append_message(&reply).await?;
        self.broadcaster
            .broadcast_chat_message(conversation_id, Some(user_id), serde_json::json!({"content": reply.content}))
            .await;
        Ok(reply)
    }
}

impl From<crate::database::DatabaseError> for CoordinatorError {
    fn from(error: crate::database::DatabaseError) -> Self {
        Self::Coordination(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::llm::DeterministicLlmAdapter;
    use crate::storage::InMemoryConversationStore;
    use crate::time_provider::test_time_provider;
    use std::time::Duration;

    fn history_with(texts: &[&str]) -> Vec<StoredMessage> {
        texts
            .iter()
            .map(|t| StoredMessage {
                message_id: Uuid::new_v4().to_string(),
                conversation_id: "c1".into(),
                role: MessageRole::User,
                content: (*t).to_string(),
                metadata: serde_json::json!({}),
                created_at: SystemTime::now(),
            })
            .collect()
    }

    #[test]
    fn clear_market_keyword_wins_over_threshold() {
        let (intent, confidence) = classify_intent("what are my competitors charging for this listing?", &[]);
        assert_eq!(intent, Intent::MarketQuery);
        assert!(confidence >= CLASSIFICATION_THRESHOLD);
    }

    #[test]
    fn ambiguous_short_message_falls_back_to_general() {
        let (intent, _) = classify_intent("hi", &[]);
        assert_eq!(intent, Intent::GeneralQuery);
    }

    #[test]
    fn context_history_nudges_a_borderline_message_toward_its_topic() {
        let history = history_with(&["how's our inventory looking", "any stock issues"]);
        let (intent, _) = classify_intent("what about restocking", &history);
        assert_eq!(intent, Intent::InventoryQuery);
    }

    #[test]
    fn workflow_trigger_phrase_is_detected_case_insensitively() {
        assert_eq!(detect_workflow_trigger("Can you Analyze This Product for me?"), Some("pricing_update"));
        assert_eq!(detect_workflow_trigger("what time is it"), None);
    }

    #[test]
    fn fallback_categories_form_the_market_specialist_executive_triangle() {
        let chain = Intent::MarketQuery.fallback_categories();
        assert_eq!(chain, vec![AgentCategory::Specialist, AgentCategory::Executive, AgentCategory::Utility]);
    }

    fn harness() -> ChatOrchestrator {
        let bus = Arc::new(EventBus::new(64, Duration::from_millis(100)));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), test_time_provider(), Duration::from_secs(60), Duration::from_secs(300)));
        let communication = Arc::new(CommunicationManager::new(Arc::clone(&registry), Arc::clone(&bus)).with_response_timeout(Duration::from_millis(100)));
        let broadcaster = Arc::new(RealtimeBroadcaster::new(64));
        let pipelines = Arc::new(PipelineController::new(
            Arc::clone(&communication),
            Arc::clone(&broadcaster),
            test_time_provider(),
            Duration::from_millis(50),
            1.5,
        ));
        let conversations: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let llm: Arc<dyn LlmAdapter> = Arc::new(DeterministicLlmAdapter::with_reply("fallback reply"));
        ChatOrchestrator::new(conversations, registry, communication, broadcaster, pipelines, llm)
    }

    #[tokio::test]
    async fn handle_message_with_no_agents_falls_back_to_llm_reply() {
        let orchestrator = harness();
        let reply = orchestrator.handle_message("user-1", "main", "what are competitor prices doing?", serde_json::json!({})).await.unwrap();
        assert_eq!(reply.content, "fallback reply");
        assert_eq!(reply.role, MessageRole::Agent);
    }

    #[tokio::test]
    async fn workflow_trigger_returns_an_immediate_acknowledgement() {
        let orchestrator = harness();
        let reply = orchestrator.handle_message("user-1", "main", "please analyze this product", serde_json::json!({})).await.unwrap();
        assert!(reply.content.contains("pricing_update"));
        assert_eq!(reply.role, MessageRole::System);
    }

    #[tokio::test]
    async fn main_sentinel_creates_a_conversation_when_user_has_none() {
        let orchestrator = harness();
        let reply = orchestrator.handle_message("user-2", "main", "hello", serde_json::json!({})).await.unwrap();
        assert!(!reply.conversation_id.is_empty());
    }

    #[tokio::test]
    async fn non_uuid_conversation_id_is_titled_from_the_raw_string_not_reused_as_id() {
        let orchestrator = harness();
        let reply = orchestrator.handle_message("user-3", "my-support-thread", "hello", serde_json::json!({})).await.unwrap();
        assert_ne!(reply.conversation_id, "my-support-thread");
    }
}
