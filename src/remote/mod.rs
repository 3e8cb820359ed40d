//! Remote scoring / tier authority
//!
//! The authority scores destinations, generates alternatives, confirms
//! referrals and owns the authoritative tier. Every call is at-most-once;
//! callers decide what a failure means.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AlternativeResult, Feedback, ScoreResult, Tier};

pub use http::HttpAuthority;
pub use mock::MockAuthority;

/// Identity sent along with each call. Context only, not authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerContext {
    pub user_id: String,
    pub tier: Tier,
}

/// Authority answer to a referral redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralResponse {
    #[serde(default)]
    pub reward_granted: bool,
    #[serde(default)]
    pub new_tier: Option<Tier>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// Network failure, timeout or non-success status
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    /// The authority understood the request and refused it
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Score `url`. `threshold` is the caller's effective tier threshold.
    async fn score_site(
        &self,
        ctx: &CallerContext,
        url: &str,
        threshold: f64,
    ) -> Result<ScoreResult, RemoteError>;

    async fn fetch_alternative(
        &self,
        ctx: &CallerContext,
        url: &str,
        query: &str,
        threshold: f64,
    ) -> Result<AlternativeResult, RemoteError>;

    async fn submit_referral(
        &self,
        ctx: &CallerContext,
        code: &str,
    ) -> Result<ReferralResponse, RemoteError>;

    /// Report a conversion for the caller's own referral code.
    async fn track_referral(
        &self,
        ctx: &CallerContext,
        own_code: &str,
        action: &str,
    ) -> Result<(), RemoteError>;

    /// Authoritative tier for the caller.
    async fn fetch_tier(&self, ctx: &CallerContext) -> Result<Tier, RemoteError>;

    async fn submit_feedback(
        &self,
        ctx: &CallerContext,
        feedback: &Feedback,
    ) -> Result<(), RemoteError>;

    /// Fire-and-forget analytics. Implementations swallow failures.
    async fn send_analytics(&self, ctx: &CallerContext, event: &str, data: serde_json::Value);
}
