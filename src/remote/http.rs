//! reqwest-backed authority client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CallerContext, ReferralResponse, RemoteAuthority, RemoteError};
use crate::models::{AlternativeResult, Feedback, ScoreResult, Tier};

const USER_ID_HEADER: &str = "X-User-Id";
const USER_TIER_HEADER: &str = "X-User-Tier";

/// HTTP client for the scoring / tier authority.
pub struct HttpAuthority {
    client: Client,
    base_url: String,
}

impl HttpAuthority {
    /// Every request made by this client times out after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unavailable(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_context(builder: RequestBuilder, ctx: &CallerContext) -> RequestBuilder {
        builder
            .header(USER_ID_HEADER, &ctx.user_id)
            .header(USER_TIER_HEADER, ctx.tier.as_str())
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        ctx: &CallerContext,
        path: &str,
        body: &B,
    ) -> Result<Response, RemoteError> {
        Self::with_context(self.client.post(self.url(path)), ctx)
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, RemoteError> {
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

fn require_success(response: Response, what: &str) -> Result<Response, RemoteError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RemoteError::Unavailable(format!(
            "{} failed: HTTP {}",
            what,
            response.status()
        )))
    }
}

#[derive(Debug, Serialize)]
struct RarityCheckRequest<'a> {
    url: &'a str,
    rarity_threshold: f64,
}

/// Only the score is strict. The hint and upsell fields are display-only and
/// a malformed one is dropped rather than failing the whole check.
#[derive(Debug, Deserialize)]
struct RarityCheckResponse {
    rarity_score: f64,
    #[serde(default)]
    ai_alternative: serde_json::Value,
    #[serde(default)]
    upsell_tier: serde_json::Value,
    #[serde(default)]
    upsell_price: serde_json::Value,
}

fn lenient_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_price(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|p: &f64| p.is_finite() && *p >= 0.0)
}

#[derive(Debug, Serialize)]
struct AlternativeRequest<'a> {
    url: &'a str,
    query: &'a str,
    rarity_threshold: f64,
}

#[derive(Debug, Deserialize)]
struct AlternativeResponse {
    #[serde(default)]
    ai_url: Option<String>,
    #[serde(default)]
    content_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReferralSubmitRequest<'a> {
    referral_code: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ReferralTrackRequest<'a> {
    referral_code: &'a str,
    action: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TierStateResponse {
    tier: Tier,
}

#[derive(Debug, Serialize)]
struct FeedbackRequest<'a> {
    user_id: &'a str,
    task_id: &'a str,
    rating: Option<u8>,
    rarity_satisfied: Option<bool>,
    comments: &'a str,
}

#[derive(Debug, Serialize)]
struct AnalyticsEvent<'a> {
    event: &'a str,
    data: serde_json::Value,
    timestamp: u64,
    user_tier: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn score_site(
        &self,
        ctx: &CallerContext,
        url: &str,
        threshold: f64,
    ) -> Result<ScoreResult, RemoteError> {
        let response = self
            .post(ctx, "/rarity/check-site", &RarityCheckRequest { url, rarity_threshold: threshold })
            .await?;
        let body: RarityCheckResponse = Self::read_json(require_success(response, "Rarity check")?).await?;

        if !body.rarity_score.is_finite() || !(0.0..=100.0).contains(&body.rarity_score) {
            return Err(RemoteError::InvalidResponse(format!(
                "rarity score out of range: {}",
                body.rarity_score
            )));
        }

        debug!(url, score = body.rarity_score, "Rarity score received");

        Ok(ScoreResult {
            score: body.rarity_score,
            upsell_price: lenient_price(&body.upsell_price),
            alternative_hint: lenient_string(body.ai_alternative),
            upsell_tier: lenient_string(body.upsell_tier),
        })
    }

    async fn fetch_alternative(
        &self,
        ctx: &CallerContext,
        url: &str,
        query: &str,
        threshold: f64,
    ) -> Result<AlternativeResult, RemoteError> {
        let response = self
            .post(
                ctx,
                "/ai/alternative",
                &AlternativeRequest { url, query, rarity_threshold: threshold },
            )
            .await?;
        let body: AlternativeResponse =
            Self::read_json(require_success(response, "Alternative generation")?).await?;

        body.ai_url
            .or(body.content_url)
            .map(|content_url| AlternativeResult { content_url })
            .ok_or_else(|| RemoteError::InvalidResponse("missing alternative URL".to_string()))
    }

    async fn submit_referral(
        &self,
        ctx: &CallerContext,
        code: &str,
    ) -> Result<ReferralResponse, RemoteError> {
        let response = self
            .post(
                ctx,
                "/referral/submit",
                &ReferralSubmitRequest { referral_code: code, user_id: &ctx.user_id },
            )
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.message.or(b.error))
                .unwrap_or_else(|| "Referral submission failed".to_string());
            return Err(RemoteError::Rejected(message));
        }

        Self::read_json(require_success(response, "Referral submission")?).await
    }

    async fn track_referral(
        &self,
        ctx: &CallerContext,
        own_code: &str,
        action: &str,
    ) -> Result<(), RemoteError> {
        let response = self
            .post(
                ctx,
                "/referral/track",
                &ReferralTrackRequest { referral_code: own_code, action, user_id: &ctx.user_id },
            )
            .await?;
        require_success(response, "Referral tracking").map(|_| ())
    }

    async fn fetch_tier(&self, ctx: &CallerContext) -> Result<Tier, RemoteError> {
        let response = Self::with_context(self.client.get(self.url("/user/state")), ctx)
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        let body: TierStateResponse = Self::read_json(require_success(response, "Tier fetch")?).await?;
        Ok(body.tier)
    }

    async fn submit_feedback(
        &self,
        ctx: &CallerContext,
        feedback: &Feedback,
    ) -> Result<(), RemoteError> {
        let request = FeedbackRequest {
            user_id: &ctx.user_id,
            task_id: feedback.task_id.as_deref().unwrap_or("extension_feedback"),
            rating: feedback.rating,
            rarity_satisfied: feedback.rarity_satisfied,
            comments: feedback.comments.as_deref().unwrap_or(""),
        };
        let response = self.post(ctx, "/v3/feedback", &request).await?;
        require_success(response, "Feedback submission").map(|_| ())
    }

    async fn send_analytics(&self, ctx: &CallerContext, event: &str, data: serde_json::Value) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let body = AnalyticsEvent { event, data, timestamp, user_tier: ctx.tier.as_str() };

        match self.post(ctx, "/analytics/track", &body).await {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => debug!(event, status = %r.status(), "Analytics event not accepted"),
            Err(e) => warn!(event, error = %e, "Analytics event dropped"),
        }
    }
}
