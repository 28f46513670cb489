// External identity verification seam. The core only depends on the
// predicate: did this external handle publicly post the verification code?
use crate::config::VerificationConfig;
use crate::services::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const VERIFY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub ok: bool,
    pub external_id: Option<String>,
}

#[async_trait]
pub trait ExternalVerification: Send + Sync {
    async fn verify(&self, handle: &str, code: &str) -> ServiceResult<VerificationOutcome>;
}

/// Dev-mode short-circuit used when no provider token is configured. Every
/// claim verifies; suitable for local development only.
pub struct DevVerification;

#[async_trait]
impl ExternalVerification for DevVerification {
    async fn verify(&self, _handle: &str, _code: &str) -> ServiceResult<VerificationOutcome> {
        Ok(VerificationOutcome {
            ok: true,
            external_id: None,
        })
    }
}

/// Looks for the verification code in the handle's recent posts via the
/// Twitter v2 search API.
pub struct TwitterVerification {
    client: reqwest::Client,
    bearer_token: String,
}

#[derive(Debug, Deserialize)]
struct TweetSearchResponse {
    #[serde(default)]
    data: Vec<TweetItem>,
}

#[derive(Debug, Deserialize)]
struct TweetItem {
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    text: String,
}

impl TwitterVerification {
    pub fn new(bearer_token: String) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(VERIFY_TIMEOUT_SECS))
            .build()
            .map_err(|err| ServiceError::Internal(err.into()))?;
        Ok(Self {
            client,
            bearer_token,
        })
    }
}

#[async_trait]
impl ExternalVerification for TwitterVerification {
    async fn verify(&self, handle: &str, code: &str) -> ServiceResult<VerificationOutcome> {
        let cleaned = handle.trim().trim_start_matches('@');
        let query = format!("from:{cleaned} \"{code}\"");
        let response = self
            .client
            .get("https://api.twitter.com/2/tweets/search/recent")
            .bearer_auth(&self.bearer_token)
            .query(&[("query", query.as_str()), ("tweet.fields", "author_id")])
            .send()
            .await
            .map_err(|err| {
                ServiceError::ExternalUnavailable(format!("verification provider error: {err}"))
            })?;
        if !response.status().is_success() {
            return Err(ServiceError::ExternalUnavailable(format!(
                "verification provider returned status {}",
                response.status()
            )));
        }
        let body: TweetSearchResponse = response.json().await.map_err(|err| {
            ServiceError::ExternalUnavailable(format!("verification provider error: {err}"))
        })?;
        let matched = body.data.iter().find(|item| item.text.contains(code));
        Ok(VerificationOutcome {
            ok: matched.is_some(),
            external_id: matched.and_then(|item| item.author_id.clone()),
        })
    }
}

pub fn build_verification(config: &VerificationConfig) -> ServiceResult<Arc<dyn ExternalVerification>> {
    match config
        .twitter_bearer_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        Some(token) => Ok(Arc::new(TwitterVerification::new(token.to_string())?)),
        None => {
            warn!("TWITTER_BEARER_TOKEN not set, claim verification runs in dev mode (auto-approve)");
            Ok(Arc::new(DevVerification))
        }
    }
}
