//! JSON API over the reward snapshots plus the topic subscription endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use mnr_core::{
    ActionRateLimiter, HistoryPoint, RegionCode, RegionConfig, RegionSnapshot, RewardHistory,
    REWARDS_COLLECTION, REWARDS_HISTORY_COLLECTION,
};
use mnr_storage::{load_document, DocumentStore, StoreError};
use mnr_sync::{
    update_topic_subscription, IidTopicManager, NotifyConfig, RegionRegistry, SubscriptionError,
    SubscriptionRequest, TopicManager, TopicMembershipResult,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mnr-web";

pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub registry: RegionRegistry,
    pub topics: Arc<dyn TopicManager>,
    limiters: Mutex<HashMap<String, ActionRateLimiter>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: RegionRegistry,
        topics: Arc<dyn TopicManager>,
    ) -> Self {
        Self {
            store,
            registry,
            topics,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Per registration token. Limiters with nothing left in their window are
    /// dropped on the way.
    fn allow_subscription_call(&self, token: &str) -> bool {
        let now = Utc::now();
        let mut limiters = match self.limiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        limiters.retain(|key, limiter| key == token || !limiter.is_idle(now));
        limiters
            .entry(token.to_string())
            .or_default()
            .try_acquire(now)
    }
}

/// Used when no topic membership credentials are configured.
#[derive(Debug, Default)]
pub struct UnconfiguredTopics;

#[async_trait]
impl TopicManager for UnconfiguredTopics {
    async fn subscribe(
        &self,
        _tokens: &[String],
        _topic: &str,
    ) -> Result<TopicMembershipResult, SubscriptionError> {
        Err(SubscriptionError::Internal(
            "topic membership is not configured".into(),
        ))
    }

    async fn unsubscribe(
        &self,
        tokens: &[String],
        topic: &str,
    ) -> Result<TopicMembershipResult, SubscriptionError> {
        self.subscribe(tokens, topic).await
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    FailedPrecondition(String),
    ResourceExhausted,
    Internal(String),
}

impl From<SubscriptionError> for ApiError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::FailedPrecondition(message) => ApiError::FailedPrecondition(message),
            SubscriptionError::Internal(message) => ApiError::Internal(message),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::FailedPrecondition(rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message),
            ApiError::FailedPrecondition(message) => {
                (StatusCode::BAD_REQUEST, "FAILED_PRECONDITION", message)
            }
            ApiError::ResourceExhausted => (
                StatusCode::TOO_MANY_REQUESTS,
                "RESOURCE_EXHAUSTED",
                "Too many subscription changes; try again shortly.".to_string(),
            ),
            ApiError::Internal(message) => {
                warn!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error".to_string())
            }
        };
        (
            status,
            Json(json!({ "error": { "status": code, "message": message } })),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSummary {
    pub code: RegionCode,
    pub name: String,
    pub category_name: String,
}

impl From<&RegionConfig> for RegionSummary {
    fn from(region: &RegionConfig) -> Self {
        Self {
            code: region.code.clone(),
            name: region.name.clone(),
            category_name: region.category_name.clone(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/regions", get(regions_handler))
        .route("/rewards/{region}", get(rewards_handler))
        .route("/rewards/{region}/history", get(history_handler))
        .route("/rewards/{region}/history/{id}", get(series_handler))
        .route("/subscriptions", post(subscription_handler))
        .with_state(Arc::new(state))
}

pub fn web_port_from_env() -> u16 {
    std::env::var("MNR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub fn topic_manager_from_config(config: &NotifyConfig) -> anyhow::Result<Arc<dyn TopicManager>> {
    Ok(match &config.fcm_access_token {
        Some(token) => Arc::new(IidTopicManager::new(config.http_client()?, token.clone())),
        None => {
            warn!("no FCM access token; subscription requests will fail");
            Arc::new(UnconfiguredTopics)
        }
    })
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn known_region<'a>(state: &'a AppState, raw: &str) -> Result<&'a RegionConfig, ApiError> {
    state
        .registry
        .get(&RegionCode::new(raw))
        .ok_or_else(|| ApiError::NotFound(format!("unknown region {raw}")))
}

async fn regions_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RegionSummary>> {
    Json(state.registry.enabled().map(RegionSummary::from).collect())
}

async fn rewards_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(region): AxumPath<String>,
) -> Result<Json<RegionSnapshot>, ApiError> {
    let region = known_region(&state, &region)?;
    load_document::<RegionSnapshot>(state.store.as_ref(), REWARDS_COLLECTION, region.code.as_str())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no rewards synced yet for {}", region.code)))
}

async fn load_history(state: &AppState, raw_region: &str) -> Result<RewardHistory, ApiError> {
    let region = known_region(state, raw_region)?;
    Ok(load_document::<RewardHistory>(
        state.store.as_ref(),
        REWARDS_HISTORY_COLLECTION,
        region.code.as_str(),
    )
    .await?
    .unwrap_or_default())
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(region): AxumPath<String>,
) -> Result<Json<RewardHistory>, ApiError> {
    load_history(&state, &region).await.map(Json)
}

async fn series_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((region, id)): AxumPath<(String, String)>,
) -> Result<Json<Vec<HistoryPoint>>, ApiError> {
    let history = load_history(&state, &region).await?;
    history
        .series
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no history for reward {id}")))
}

async fn subscription_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubscriptionRequest>, JsonRejection>,
) -> Result<Json<TopicMembershipResult>, ApiError> {
    let Json(request) = payload?;
    if !state.allow_subscription_call(&request.registration_token) {
        return Err(ApiError::ResourceExhausted);
    }
    let result =
        update_topic_subscription(&request, &state.registry, state.topics.as_ref()).await?;
    Ok(Json(result))
}
