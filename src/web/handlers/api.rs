use axum::{
    extract::State,
    http::StatusCode,
    Json,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::agent::plan::{ConversationContext, QueryPlan};
use crate::web::state::AppState;

// Question answering

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
    /// Prior exchanges the caller wants carried as context.
    #[serde(default)]
    pub history: Vec<ConversationContext>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub plan: QueryPlan,
}

pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AskRequest>,
) -> Result<Json<AskResponse>, (StatusCode, String)> {
    if payload.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "question must not be empty".to_string()));
    }

    info!("NL question: {}", payload.question);

    // The agent never errors past its boundary; failures arrive as markdown.
    let response = state
        .agent
        .answer_question(&payload.question, &payload.history)
        .await;

    Ok(Json(AskResponse {
        answer: response.answer,
        plan: response.plan,
    }))
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub database_type: String,
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        database_type: state.config.database.database_type.clone(),
    })
}
