//! Topic subscription requests from browser clients.

use async_trait::async_trait;
use mnr_core::{RegionCode, NEW_REWARDS_TOPIC};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info;

use crate::RegionRegistry;

pub const IID_ENDPOINT: &str = "https://iid.googleapis.com/iid/v1";

/// Topics a client may join; the region code is appended to form the id.
pub const ALLOWED_TOPICS: &[&str] = &[NEW_REWARDS_TOPIC];

/// Missing or non-string fields decode as empty so validation can name them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub registration_token: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub topic: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub location: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub action: String,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => s,
        _ => String::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicAction {
    Subscribe,
    Unsubscribe,
}

impl TopicAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSubscription {
    pub registration_token: String,
    pub region: RegionCode,
    pub topic_id: String,
    pub action: TopicAction,
}

/// Checks region, topic and action in that order, so the first failing
/// field decides the error message.
pub fn validate_subscription(
    request: &SubscriptionRequest,
    registry: &RegionRegistry,
) -> Result<ValidatedSubscription, SubscriptionError> {
    let region = RegionCode::new(request.location.trim());
    if region.as_str().is_empty() || registry.get(&region).is_none() {
        return Err(SubscriptionError::FailedPrecondition(
            "The location does not exist.".into(),
        ));
    }
    if !ALLOWED_TOPICS.contains(&request.topic.as_str()) {
        return Err(SubscriptionError::FailedPrecondition(
            "The topic does not exist.".into(),
        ));
    }
    let action = TopicAction::parse(&request.action).ok_or_else(|| {
        SubscriptionError::FailedPrecondition("An invalid action was provided.".into())
    })?;
    if request.registration_token.trim().is_empty() {
        return Err(SubscriptionError::FailedPrecondition(
            "A registration token is required.".into(),
        ));
    }

    Ok(ValidatedSubscription {
        registration_token: request.registration_token.clone(),
        topic_id: region.topic(&request.topic),
        region,
        action,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMembershipResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait TopicManager: Send + Sync {
    async fn subscribe(
        &self,
        tokens: &[String],
        topic: &str,
    ) -> Result<TopicMembershipResult, SubscriptionError>;

    async fn unsubscribe(
        &self,
        tokens: &[String],
        topic: &str,
    ) -> Result<TopicMembershipResult, SubscriptionError>;
}

/// Instance ID batch API used by FCM for topic membership.
#[derive(Debug, Clone)]
pub struct IidTopicManager {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl IidTopicManager {
    pub fn new(client: reqwest::Client, access_token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: IID_ENDPOINT.to_string(),
            access_token: access_token.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn batch(
        &self,
        operation: &str,
        tokens: &[String],
        topic: &str,
    ) -> Result<TopicMembershipResult, SubscriptionError> {
        let url = format!("{}:{operation}", self.endpoint);
        let body = json!({
            "to": format!("/topics/{topic}"),
            "registration_tokens": tokens,
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("access_token_auth", "true")
            .json(&body)
            .send()
            .await
            .map_err(|e| SubscriptionError::Internal(format!("topic request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SubscriptionError::Internal(format!(
                "topic service answered {status}"
            )));
        }
        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SubscriptionError::Internal(format!("topic response unreadable: {e}")))?;
        Ok(membership_from_results(&parsed, tokens.len()))
    }
}

/// `results` holds one object per token; an `error` key marks a failure.
fn membership_from_results(body: &serde_json::Value, token_count: usize) -> TopicMembershipResult {
    let Some(results) = body.get("results").and_then(|r| r.as_array()) else {
        return TopicMembershipResult {
            success_count: token_count,
            ..Default::default()
        };
    };
    let errors: Vec<String> = results
        .iter()
        .filter_map(|r| r.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .collect();
    TopicMembershipResult {
        success_count: results.len() - errors.len(),
        failure_count: errors.len(),
        errors,
    }
}

#[async_trait]
impl TopicManager for IidTopicManager {
    async fn subscribe(
        &self,
        tokens: &[String],
        topic: &str,
    ) -> Result<TopicMembershipResult, SubscriptionError> {
        self.batch("batchAdd", tokens, topic).await
    }

    async fn unsubscribe(
        &self,
        tokens: &[String],
        topic: &str,
    ) -> Result<TopicMembershipResult, SubscriptionError> {
        self.batch("batchRemove", tokens, topic).await
    }
}

pub async fn update_topic_subscription(
    request: &SubscriptionRequest,
    registry: &RegionRegistry,
    topics: &dyn TopicManager,
) -> Result<TopicMembershipResult, SubscriptionError> {
    let validated = validate_subscription(request, registry)?;
    let tokens = [validated.registration_token.clone()];
    let result = match validated.action {
        TopicAction::Subscribe => topics.subscribe(&tokens, &validated.topic_id).await?,
        TopicAction::Unsubscribe => topics.unsubscribe(&tokens, &validated.topic_id).await?,
    };
    info!(
        topic = %validated.topic_id,
        action = ?validated.action,
        failures = result.failure_count,
        "topic membership updated"
    );
    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingTopics {
        pub(crate) calls: Mutex<Vec<(TopicAction, String, String)>>,
    }

    #[async_trait]
    impl TopicManager for RecordingTopics {
        async fn subscribe(
            &self,
            tokens: &[String],
            topic: &str,
        ) -> Result<TopicMembershipResult, SubscriptionError> {
            self.calls
                .lock()
                .unwrap()
                .push((TopicAction::Subscribe, tokens[0].clone(), topic.to_string()));
            Ok(TopicMembershipResult {
                success_count: tokens.len(),
                ..Default::default()
            })
        }

        async fn unsubscribe(
            &self,
            tokens: &[String],
            topic: &str,
        ) -> Result<TopicMembershipResult, SubscriptionError> {
            self.calls
                .lock()
                .unwrap()
                .push((TopicAction::Unsubscribe, tokens[0].clone(), topic.to_string()));
            Ok(TopicMembershipResult {
                success_count: tokens.len(),
                ..Default::default()
            })
        }
    }

    fn request(location: &str, topic: &str, action: &str) -> SubscriptionRequest {
        SubscriptionRequest {
            registration_token: "tok-1".into(),
            topic: topic.into(),
            location: location.into(),
            action: action.into(),
        }
    }

    fn precondition(message: &str) -> SubscriptionError {
        SubscriptionError::FailedPrecondition(message.to_string())
    }

    #[test]
    fn validation_reports_the_first_bad_field() {
        let registry = RegionRegistry::builtin();
        assert_eq!(
            validate_subscription(&request("JP", "new-rewards", "subscribe"), &registry),
            Err(precondition("The location does not exist."))
        );
        assert_eq!(
            validate_subscription(&request("US", "restocks", "subscribe"), &registry),
            Err(precondition("The topic does not exist."))
        );
        assert_eq!(
            validate_subscription(&request("US", "new-rewards", "follow"), &registry),
            Err(precondition("An invalid action was provided."))
        );
    }

    #[test]
    fn missing_or_non_string_fields_still_reach_validation() {
        let registry = RegionRegistry::builtin();
        let no_action: SubscriptionRequest = serde_json::from_value(json!({
            "registrationToken": "tok-1",
            "topic": "new-rewards",
            "location": "US"
        }))
        .unwrap();
        assert_eq!(no_action.action, "");
        assert_eq!(
            validate_subscription(&no_action, &registry),
            Err(precondition("An invalid action was provided."))
        );

        let numeric_location: SubscriptionRequest = serde_json::from_value(json!({
            "registrationToken": "tok-1",
            "topic": "new-rewards",
            "location": 5,
            "action": "subscribe"
        }))
        .unwrap();
        assert_eq!(
            validate_subscription(&numeric_location, &registry),
            Err(precondition("The location does not exist."))
        );
    }

    #[test]
    fn valid_request_builds_region_topic_id() {
        let ok = validate_subscription(&request("gb", "new-rewards", "unsubscribe"), &RegionRegistry::builtin())
            .unwrap();
        assert_eq!(ok.topic_id, "new-rewards-GB");
        assert_eq!(ok.action, TopicAction::Unsubscribe);
    }

    #[tokio::test]
    async fn update_calls_the_topic_manager_once() {
        let topics = RecordingTopics::default();
        let result = update_topic_subscription(
            &request("CA", "new-rewards", "subscribe"),
            &RegionRegistry::builtin(),
            &topics,
        )
        .await
        .unwrap();
        assert_eq!(result.success_count, 1);
        assert_eq!(
            *topics.calls.lock().unwrap(),
            vec![(TopicAction::Subscribe, "tok-1".to_string(), "new-rewards-CA".to_string())]
        );
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_the_topic_manager() {
        let topics = RecordingTopics::default();
        let err = update_topic_subscription(
            &request("US", "new-rewards", "toggle"),
            &RegionRegistry::builtin(),
            &topics,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubscriptionError::FailedPrecondition(_)));
        assert!(topics.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn membership_counts_per_token_errors() {
        let body = json!({"results": [{}, {"error": "NOT_FOUND"}, {}]});
        let result = membership_from_results(&body, 3);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.errors, ["NOT_FOUND"]);
    }
}
