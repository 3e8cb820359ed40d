//! Mock authority for testing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use super::{CallerContext, ReferralResponse, RemoteAuthority, RemoteError};
use crate::models::{AlternativeResult, Feedback, ScoreResult, Tier};

/// Mock authority for testing.
///
/// Answers with configurable canned responses and counts calls. When
/// unavailable, every call fails with [`RemoteError::Unavailable`].
pub struct MockAuthority {
    available: AtomicBool,
    score: f64,
    alternative_url: String,
    referral: Result<ReferralResponse, RemoteError>,
    tier: Mutex<Tier>,
    tier_gate: Option<Arc<Notify>>,
    referral_gate: Option<Arc<Semaphore>>,
    score_calls: AtomicU32,
    alternative_calls: AtomicU32,
    referral_calls: AtomicU32,
    track_calls: AtomicU32,
    tier_calls: AtomicU32,
    feedback_calls: AtomicU32,
    events: Mutex<Vec<String>>,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            score: 100.0,
            alternative_url: "https://alternatives.test/result".to_string(),
            referral: Ok(ReferralResponse {
                reward_granted: false,
                new_tier: None,
                message: None,
            }),
            tier: Mutex::new(Tier::Free),
            tier_gate: None,
            referral_gate: None,
            score_calls: AtomicU32::new(0),
            alternative_calls: AtomicU32::new(0),
            referral_calls: AtomicU32::new(0),
            track_calls: AtomicU32::new(0),
            tier_calls: AtomicU32::new(0),
            feedback_calls: AtomicU32::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Rarity score returned by `score_site`.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_alternative(mut self, url: impl Into<String>) -> Self {
        self.alternative_url = url.into();
        self
    }

    /// Referral redemptions grant `tier`.
    pub fn granting(mut self, tier: Tier) -> Self {
        self.referral = Ok(ReferralResponse {
            reward_granted: true,
            new_tier: Some(tier),
            message: Some("Referral applied".to_string()),
        });
        self
    }

    /// Referral redemptions are refused with `reason`.
    pub fn rejecting(mut self, reason: impl Into<String>) -> Self {
        self.referral = Err(RemoteError::Rejected(reason.into()));
        self
    }

    /// Authoritative tier returned by `fetch_tier`.
    pub fn with_tier(self, tier: Tier) -> Self {
        self.set_tier(tier);
        self
    }

    /// `fetch_tier` waits for a notification before answering.
    pub fn with_tier_gate(mut self, gate: Arc<Notify>) -> Self {
        self.tier_gate = Some(gate);
        self
    }

    /// Hold each `submit_referral` after it is counted until a permit is available.
    pub fn with_referral_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.referral_gate = Some(gate);
        self
    }

    pub fn with_available(self, available: bool) -> Self {
        self.set_available(available);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_tier(&self, tier: Tier) {
        *self.tier.lock().unwrap_or_else(|e| e.into_inner()) = tier;
    }

    pub fn score_calls(&self) -> u32 {
        self.score_calls.load(Ordering::SeqCst)
    }

    pub fn alternative_calls(&self) -> u32 {
        self.alternative_calls.load(Ordering::SeqCst)
    }

    pub fn referral_calls(&self) -> u32 {
        self.referral_calls.load(Ordering::SeqCst)
    }

    pub fn track_calls(&self) -> u32 {
        self.track_calls.load(Ordering::SeqCst)
    }

    pub fn tier_calls(&self) -> u32 {
        self.tier_calls.load(Ordering::SeqCst)
    }

    pub fn feedback_calls(&self) -> u32 {
        self.feedback_calls.load(Ordering::SeqCst)
    }

    /// Names of analytics events received so far.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("Mock authority disabled".to_string()))
        }
    }
}

impl Default for MockAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteAuthority for MockAuthority {
    async fn score_site(
        &self,
        _ctx: &CallerContext,
        _url: &str,
        _threshold: f64,
    ) -> Result<ScoreResult, RemoteError> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(ScoreResult {
            score: self.score,
            alternative_hint: None,
            upsell_tier: None,
            upsell_price: None,
        })
    }

    async fn fetch_alternative(
        &self,
        _ctx: &CallerContext,
        _url: &str,
        _query: &str,
        _threshold: f64,
    ) -> Result<AlternativeResult, RemoteError> {
        self.alternative_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(AlternativeResult { content_url: self.alternative_url.clone() })
    }

    async fn submit_referral(
        &self,
        _ctx: &CallerContext,
        _code: &str,
    ) -> Result<ReferralResponse, RemoteError> {
        self.referral_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.referral_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.check_available()?;
        self.referral.clone()
    }

    async fn track_referral(
        &self,
        _ctx: &CallerContext,
        _own_code: &str,
        _action: &str,
    ) -> Result<(), RemoteError> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }

    async fn fetch_tier(&self, _ctx: &CallerContext) -> Result<Tier, RemoteError> {
        self.tier_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.tier_gate {
            gate.notified().await;
        }
        self.check_available()?;
        Ok(*self.tier.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn submit_feedback(
        &self,
        _ctx: &CallerContext,
        _feedback: &Feedback,
    ) -> Result<(), RemoteError> {
        self.feedback_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }

    async fn send_analytics(&self, _ctx: &CallerContext, event: &str, _data: serde_json::Value) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CallerContext {
        CallerContext { user_id: "user_1_abc".to_string(), tier: Tier::Free }
    }

    #[tokio::test]
    async fn test_mock_counts_calls() {
        let mock = MockAuthority::new().with_score(42.0);
        let result = mock.score_site(&ctx(), "https://a.test/", 50.0).await.unwrap();
        assert_eq!(result.score, 42.0);
        assert_eq!(mock.score_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let mock = MockAuthority::new().with_available(false);
        assert!(matches!(
            mock.fetch_tier(&ctx()).await,
            Err(RemoteError::Unavailable(_))
        ));
        assert_eq!(mock.tier_calls(), 1);
    }
}
