//! New-reward push notifications: backends, parallel fan-out and the store watcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mnr_core::{RegionCode, RegionSnapshot, NEW_REWARDS_TOPIC, REWARDS_COLLECTION};
use mnr_storage::{DocumentChange, DocumentStore};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::history::new_reward_ids;

pub const FCM_ENDPOINT_BASE: &str = "https://fcm.googleapis.com/v1/projects";
pub const SPONTIT_ENDPOINT: &str = "https://api.spontit.com/v3/push";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{backend} rejected the message with status {status}: {body}")]
    Rejected {
        backend: &'static str,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub region: RegionCode,
    pub topic: String,
    pub title: String,
    pub body: String,
    pub link: String,
    pub require_interaction: bool,
}

impl PushMessage {
    pub fn new_rewards(region: &RegionCode, site_url: &str) -> Self {
        Self {
            region: region.clone(),
            topic: region.topic(NEW_REWARDS_TOPIC),
            title: format!("New {region} Rewards"),
            body: "Check My Nintendo for new or restocked rewards".to_string(),
            link: site_url.to_string(),
            require_interaction: true,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, message: &PushMessage) -> Result<(), NotifyError>;
}

/// Credentials for the notification and topic-membership backends.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub fcm_project_id: Option<String>,
    pub fcm_access_token: Option<String>,
    pub spontit_api_key: Option<String>,
    pub spontit_username: Option<String>,
    pub http_timeout: Duration,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            fcm_project_id: var("MNR_FCM_PROJECT_ID"),
            fcm_access_token: var("MNR_FCM_ACCESS_TOKEN"),
            spontit_api_key: var("MNR_SPONTIT_API_KEY"),
            spontit_username: var("MNR_SPONTIT_USERNAME"),
            http_timeout: Duration::from_secs(
                var("MNR_HTTP_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15),
            ),
        }
    }

    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.http_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building notification http client: {e}"))
    }
}

/// Firebase Cloud Messaging HTTP v1 topic push.
#[derive(Debug, Clone)]
pub struct FcmNotifier {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl FcmNotifier {
    pub fn new(client: reqwest::Client, project_id: &str, access_token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: format!("{FCM_ENDPOINT_BASE}/{project_id}/messages:send"),
            access_token: access_token.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn payload(message: &PushMessage) -> serde_json::Value {
        json!({
            "message": {
                "topic": message.topic,
                "notification": {
                    "title": message.title,
                    "body": message.body,
                },
                "webpush": {
                    "notification": { "requireInteraction": message.require_interaction },
                    "fcm_options": { "link": message.link },
                },
            }
        })
    }
}

#[async_trait]
impl Notifier for FcmNotifier {
    fn name(&self) -> &'static str {
        "fcm"
    }

    async fn send(&self, message: &PushMessage) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&Self::payload(message))
            .send()
            .await?;
        check_status(self.name(), resp).await
    }
}

/// Spontit channel push, one channel per region.
#[derive(Debug, Clone)]
pub struct SpontitNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    username: String,
}

impl SpontitNotifier {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: SPONTIT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            username: username.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn channel_name(region: &RegionCode) -> String {
        format!("mynintendorewards{}", region.as_str().to_ascii_lowercase())
    }

    pub fn payload(message: &PushMessage) -> serde_json::Value {
        json!({
            "channelName": Self::channel_name(&message.region),
            "pushTitle": message.title,
            "content": message.body,
            "link": message.link,
            "openLinkInApp": false,
        })
    }
}

#[async_trait]
impl Notifier for SpontitNotifier {
    fn name(&self) -> &'static str {
        "spontit"
    }

    async fn send(&self, message: &PushMessage) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("X-Authorization", &self.api_key)
            .header("X-UserId", &self.username)
            .json(&Self::payload(message))
            .send()
            .await?;
        check_status(self.name(), resp).await
    }
}

async fn check_status(backend: &'static str, resp: reqwest::Response) -> Result<(), NotifyError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        backend,
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

/// Sends a message to every backend concurrently; one backend failing does
/// not affect the others.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    backends: Vec<Arc<dyn Notifier>>,
}

impl NotificationDispatcher {
    pub fn new(backends: Vec<Arc<dyn Notifier>>) -> Self {
        Self { backends }
    }

    /// Register every backend whose credentials are present.
    pub fn from_config(config: &NotifyConfig) -> anyhow::Result<Self> {
        let client = config.http_client()?;
        let mut backends: Vec<Arc<dyn Notifier>> = Vec::new();
        if let (Some(project), Some(token)) = (&config.fcm_project_id, &config.fcm_access_token) {
            backends.push(Arc::new(FcmNotifier::new(client.clone(), project, token.clone())));
        }
        if let (Some(key), Some(user)) = (&config.spontit_api_key, &config.spontit_username) {
            backends.push(Arc::new(SpontitNotifier::new(client, key.clone(), user.clone())));
        }
        if backends.is_empty() {
            warn!("no notification backends configured; new rewards will only be logged");
        }
        Ok(Self::new(backends))
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub async fn notify(&self, message: &PushMessage) -> DispatchReport {
        let sends = self.backends.iter().map(|backend| async move {
            (backend.name(), backend.send(message).await)
        });

        let mut report = DispatchReport::default();
        for (name, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => {
                    debug!(backend = name, topic = %message.topic, "notification sent");
                    report.delivered.push(name);
                }
                Err(err) => {
                    warn!(backend = name, topic = %message.topic, error = %err, "notification failed");
                    report.failed.push((name, err.to_string()));
                }
            }
        }
        report
    }
}

/// Consumes snapshot updates from the store and announces new rewards,
/// independently of the sync run that wrote them.
#[derive(Clone)]
pub struct NewRewardWatcher {
    dispatcher: NotificationDispatcher,
    site_url: String,
}

impl NewRewardWatcher {
    pub fn new(dispatcher: NotificationDispatcher, site_url: impl Into<String>) -> Self {
        Self {
            dispatcher,
            site_url: site_url.into(),
        }
    }

    /// Only updates of an existing snapshot are considered. At most one message
    /// is sent per change, however many rewards are new.
    pub async fn handle_change(&self, change: &DocumentChange) -> Option<PushMessage> {
        if change.collection != REWARDS_COLLECTION {
            return None;
        }
        let before = change.before.as_ref()?;
        let decode = |value: &serde_json::Value| {
            serde_json::from_value::<RegionSnapshot>(value.clone())
                .map_err(|err| warn!(region = %change.id, error = %err, "undecodable rewards snapshot"))
                .ok()
        };
        let before = decode(before)?;
        let after = decode(&change.after)?;

        let new_ids = new_reward_ids(&before, &after);
        if new_ids.is_empty() {
            return None;
        }

        let region = RegionCode::new(&change.id);
        let message = PushMessage::new_rewards(&region, &self.site_url);
        info!(%region, new_ids = ?new_ids, topic = %message.topic, "new rewards detected");
        let report = self.dispatcher.notify(&message).await;
        debug!(delivered = ?report.delivered, failed = report.failed.len(), "dispatch finished");
        Some(message)
    }

    /// Handle every change already buffered on `changes`, then return. Used by
    /// one-shot runs that exit before a background watcher could catch up.
    pub async fn drain(&self, changes: &mut broadcast::Receiver<DocumentChange>) -> Vec<PushMessage> {
        let mut sent = Vec::new();
        loop {
            match changes.try_recv() {
                Ok(change) => sent.extend(self.handle_change(&change).await),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification drain lagged behind store changes");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        sent
    }

    /// Subscribe now and process changes on a background task until the store
    /// drops its feed.
    pub fn spawn(self, store: &dyn DocumentStore) -> JoinHandle<()> {
        let mut changes = store.changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        self.handle_change(&change).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification watcher lagged behind store changes");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
