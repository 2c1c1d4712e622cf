//! Chat REST handlers and router assembly.
//!
//! One axum router bound to a shared `Coordinator`, matching the reference
//! platform's health-endpoint convention plus the chat surface from the
//! external interfaces contract: conversation CRUD, message append (which
//! synchronously persists the user turn and hands the rest to the intent
//! router as a background task), and CORS preflight.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::coordinator::Coordinator;
use crate::storage::{ConversationStore, MessageRole, StoredMessage};

/// Shared application state for the chat router.
pub type AppState = Arc<Coordinator>;

/// Wires every `/api/v1/chat*` and `/api/v1/health` route.
#[must_use]
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/chat", get(service_description).options(cors_preflight))
        .route("/api/v1/chat/conversations", get(list_conversations).post(create_conversation).options(cors_preflight))
        .route("/api/v1/chat/conversations/{id}", get(get_conversation).options(cors_preflight))
        .route(
            "/api/v1/chat/conversations/{id}/messages",
            get(list_messages).post(post_message).options(cors_preflight),
        )
        .with_state(state)
}

async fn cors_preflight() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn service_description() -> impl IntoResponse {
    Json(json!({
        "service": "agorum-chat",
        "endpoints": [
            "POST /api/v1/chat/conversations",
            "GET /api/v1/chat/conversations",
            "GET /api/v1/chat/conversations/{id}",
            "GET /api/v1/chat/conversations/{id}/messages",
            "POST /api/v1/chat/conversations/{id}/messages",
        ],
    }))
}

#[derive(Debug, Deserialize)]
struct CreateConversationRequest {
    title: Option<String>,
    #[serde(default = "default_user")]
    user_id: String,
}

fn default_user() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Serialize)]
struct ConversationResponse {
    conversation_id: String,
    user_id: String,
    title: String,
}

async fn create_conversation(State(state): State<AppState>, Json(request): Json<CreateConversationRequest>) -> impl IntoResponse {
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let title = request.title.unwrap_or_else(|| "New conversation".to_string());
    match state.conversations.ensure_conversation(&conversation_id, &request.user_id, &title).await {
        Ok(()) => (StatusCode::CREATED, Json(json!(ConversationResponse { conversation_id, user_id: request.user_id, title }))).into_response(),
        Err(error) => error_response(&error.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ListConversationsQuery {
    #[serde(default = "default_user")]
    user_id: String,
}

async fn list_conversations(State(state): State<AppState>, axum::extract::Query(query): axum::extract::Query<ListConversationsQuery>) -> impl IntoResponse {
    match state.conversations.latest_conversation_for_user(&query.user_id).await {
        Ok(Some(conversation_id)) => match state.conversations.get_conversation(&conversation_id).await {
            Ok(Some(record)) => Json(json!({"conversations": [conversation_summary(&record)]})).into_response(),
            Ok(None) => Json(json!({"conversations": []})).into_response(),
            Err(error) => error_response(&error.to_string()),
        },
        Ok(None) => Json(json!({"conversations": []})).into_response(),
        Err(error) => error_response(&error.to_string()),
    }
}

async fn get_conversation(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.conversations.get_conversation(&id).await {
        Ok(Some(record)) => Json(conversation_summary(&record)).into_response(),
        Ok(None) => not_found(&id),
        Err(error) => error_response(&error.to_string()),
    }
}

fn conversation_summary(record: &crate::storage::ConversationRecord) -> serde_json::Value {
    json!({
        "conversation_id": record.conversation_id,
        "user_id": record.user_id,
        "title": record.title,
        "assigned_agent_id": record.assigned_agent_id.map(|id| id.to_string()),
    })
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_messages(State(state): State<AppState>, Path(id): Path<String>, axum::extract::Query(query): axum::extract::Query<ListMessagesQuery>) -> impl IntoResponse {
    match state.conversations.recent_messages(&id, query.limit).await {
        Ok(messages) => Json(json!({"messages": messages.iter().map(message_json).collect::<Vec<_>>()})).into_response(),
        Err(error) => error_response(&error.to_string()),
    }
}

fn message_json(message: &StoredMessage) -> serde_json::Value {
    json!({
        "message_id": message.message_id,
        "conversation_id": message.conversation_id,
        "role": format!("{:?}", message.role).to_lowercase(),
        "content": message.content,
        "metadata": message.metadata,
    })
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    text: String,
    #[serde(default = "default_user")]
    sender: String,
    agent_type: Option<String>,
    #[allow(dead_code)]
    thread_id: Option<String>,
    #[allow(dead_code)]
    parent_id: Option<String>,
}

async fn post_message(State(state): State<AppState>, Path(id): Path<String>, Json(request): Json<PostMessageRequest>) -> impl IntoResponse {
    let user_message = StoredMessage {
        message_id: uuid::Uuid::new_v4().to_string(),
        conversation_id: id.clone(),
        role: MessageRole::User,
        content: request.text.clone(),
        metadata: json!({"agent_type": request.agent_type}),
        created_at: std::time::SystemTime::now(),
    };

    if let Err(error) = state.conversations.ensure_conversation(&id, &request.sender, &id).await {
        return error_response(&error.to_string());
    }
    if let Err(error) = state.conversations.append_message(&user_message).await {
        return error_response(&error.to_string());
    }

    let coordinator = Arc::clone(&state);
    let sender = request.sender.clone();
    let conversation_id = id.clone();
    let text = request.text.clone();
    tokio::spawn(async move {
        if let Err(error) = coordinator.chat.handle_message(&sender, &conversation_id, &text, json!({})).await {
            tracing::warn!(%error, conversation_id, "intent router failed to produce a reply");
        }
    });

    (StatusCode::ACCEPTED, Json(message_json(&user_message))).into_response()
}

fn error_response(message: &str) -> axum::response::Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": message}))).into_response()
}

fn not_found(id: &str) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": format!("conversation {id} not found")}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;

    async fn test_app() -> (tempfile::TempDir, Router) {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let mut config = CoordinatorConfig::development();
        config.storage_path = temp_dir.path().join("test.db");
        let coordinator = Coordinator::build(config).await.expect("coordinator builds");
        (temp_dir, create_app(Arc::new(coordinator)))
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (_temp_dir, app) = test_app().await;
        let response = axum::http::Request::builder().uri("/api/v1/health").body(axum::body::Body::empty()).unwrap();
        let result = tower::ServiceExt::oneshot(app, response).await.unwrap();
        assert_eq!(result.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn creating_a_conversation_returns_its_id() {
        let (_temp_dir, app) = test_app().await;
        let body = serde_json::to_vec(&json!({"title": "test"})).unwrap();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/v1/chat/conversations")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body))
            .unwrap();
        let result = tower::ServiceExt::oneshot(app, request).await.unwrap();
        assert_eq!(result.status(), StatusCode::CREATED);
    }
}
