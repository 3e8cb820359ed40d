//! Message router - inbound control commands
//!
//! Commands arrive as JSON objects tagged by `action` and are answered with a
//! `{success, data?, error?}` envelope. Every mutating command acknowledges
//! only after its write reached the store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::InterceptionEngine;
use crate::models::{Feedback, NavigationRequest, PolicyDecision, TabId, Tier};
use crate::reconciler::{ReconcileError, Reconciler};
use crate::remote::{CallerContext, RemoteAuthority, RemoteError};
use crate::store::{StateStore, StoreError};

/// Query parameters tried, in order, when deriving an alternative query.
const SEARCH_PARAMS: [&str; 5] = ["q", "query", "s", "search", "keywords"];

/// Action names accepted on the wire, aliases included.
const KNOWN_ACTIONS: &[&str] = &[
    "get_user_state",
    "update_tier",
    "toggle_policy",
    "toggle_rarity_mode",
    "get_alternative",
    "get_ai_alternative",
    "submit_referral",
    "get_referral_code",
    "submit_feedback",
    "check_rarity",
    "track_referral",
    "reconcile_now",
    "reset_state",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    GetUserState,
    UpdateTier {
        tier: Tier,
    },
    #[serde(alias = "toggle_rarity_mode")]
    TogglePolicy {
        enabled: bool,
    },
    #[serde(alias = "get_ai_alternative")]
    GetAlternative {
        url: String,
        #[serde(default)]
        query: Option<String>,
    },
    SubmitReferral {
        #[serde(alias = "referral_code")]
        code: String,
    },
    GetReferralCode,
    SubmitFeedback {
        #[serde(default)]
        feedback: Feedback,
    },
    /// Score a URL on demand and return the warning, if any
    CheckRarity {
        url: String,
        #[serde(default)]
        tab_id: Option<TabId>,
    },
    TrackReferral {
        referral_action: String,
    },
    ReconcileNow,
    ResetState,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetUserState => "get_user_state",
            Command::UpdateTier { .. } => "update_tier",
            Command::TogglePolicy { .. } => "toggle_policy",
            Command::GetAlternative { .. } => "get_alternative",
            Command::SubmitReferral { .. } => "submit_referral",
            Command::GetReferralCode => "get_referral_code",
            Command::SubmitFeedback { .. } => "submit_feedback",
            Command::CheckRarity { .. } => "check_rarity",
            Command::TrackReferral { .. } => "track_referral",
            Command::ReconcileNow => "reconcile_now",
            Command::ResetState => "reset_state",
        }
    }

    /// Parse a raw command, telling unknown actions apart from malformed ones.
    pub fn from_json(value: Value) -> Result<Self, RouterError> {
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| RouterError::InvalidCommand("missing action".to_string()))?;

        if !KNOWN_ACTIONS.contains(&action) {
            return Err(RouterError::UnknownAction(action.to_string()));
        }

        serde_json::from_value(value).map_err(|e| RouterError::InvalidCommand(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to persist state: {0}")]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Remote(RemoteError),

    #[error("Remote service unavailable: {0}")]
    Unavailable(String),
}

impl From<RemoteError> for RouterError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unavailable(msg) => RouterError::Unavailable(msg),
            other => RouterError::Remote(other),
        }
    }
}

impl From<ReconcileError> for RouterError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Remote(e) => e.into(),
            ReconcileError::Persistence(e) => RouterError::Persistence(e),
        }
    }
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn err(error: impl ToString) -> Self {
        Self { success: false, data: None, error: Some(error.to_string()) }
    }
}

impl From<Result<Value, RouterError>> for Response {
    fn from(result: Result<Value, RouterError>) -> Self {
        match result {
            Ok(data) => Response::ok(data),
            Err(e) => Response::err(e),
        }
    }
}

pub struct MessageRouter {
    store: Arc<StateStore>,
    engine: Arc<InterceptionEngine>,
    reconciler: Arc<Reconciler>,
    remote: Arc<dyn RemoteAuthority>,
    alternative_threshold: f64,
    timeout: Duration,
}

impl MessageRouter {
    pub fn new(
        store: Arc<StateStore>,
        engine: Arc<InterceptionEngine>,
        reconciler: Arc<Reconciler>,
        remote: Arc<dyn RemoteAuthority>,
        alternative_threshold: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            reconciler,
            remote,
            alternative_threshold,
            timeout,
        }
    }

    /// Parse and dispatch a raw command. Never fails; errors land in the envelope.
    pub async fn dispatch_json(&self, raw: Value) -> Response {
        let result = match Command::from_json(raw) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!(error = %e, "Command failed");
        }
        result.into()
    }

    pub async fn dispatch(&self, command: Command) -> Result<Value, RouterError> {
        debug!(action = command.name(), "Dispatching command");

        match command {
            Command::GetUserState => {
                let record = self.store.snapshot()?;
                let mut data = json!(record.user_state);
                data["policyEnabled"] = json!(record.policy_enabled);
                Ok(data)
            }

            Command::UpdateTier { tier } => {
                self.store.update(|r| r.user_state.tier = tier)?;
                info!(%tier, "Tier set by command");
                Ok(json!(self.store.user_state()?))
            }

            Command::TogglePolicy { enabled } => {
                self.store.update(|r| r.policy_enabled = enabled)?;
                info!(enabled, "Policy mode toggled");
                Ok(json!({ "enabled": enabled }))
            }

            Command::GetAlternative { url, query } => self.get_alternative(url, query).await,

            Command::SubmitReferral { code } => {
                let result = self.reconciler.submit_referral(&code).await?;
                Ok(json!(result))
            }

            Command::GetReferralCode => {
                let state = self.store.user_state()?;
                Ok(json!({
                    "referralCode": state.referral_code,
                    "referralCount": state.referral_count,
                }))
            }

            Command::SubmitFeedback { feedback } => self.submit_feedback(feedback).await,

            Command::CheckRarity { url, tab_id } => {
                let request = NavigationRequest::top_level(url, tab_id);
                let decision = match self.engine.scorer().score(&request).await? {
                    Some(warning) => PolicyDecision::Warn(warning),
                    None => PolicyDecision::Allow,
                };
                Ok(json!({
                    "low_rarity": matches!(decision, PolicyDecision::Warn(_)),
                    "decision": decision,
                }))
            }

            Command::TrackReferral { referral_action } => {
                let count = self.reconciler.track_referral(&referral_action).await?;
                Ok(json!({ "referralCount": count }))
            }

            Command::ReconcileNow => {
                let outcome = self.reconciler.reconcile().await?;
                Ok(json!(outcome))
            }

            Command::ResetState => {
                let state = self.store.reset()?;
                warn!(user_id = %state.user_id, "State reset by command");
                Ok(json!(state))
            }
        }
    }

    async fn get_alternative(&self, url: String, query: Option<String>) -> Result<Value, RouterError> {
        let query = query
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| extract_query(&url));
        let state = self.store.user_state()?;
        let ctx = CallerContext { user_id: state.user_id, tier: state.tier };

        let result = tokio::time::timeout(
            self.timeout,
            self.remote
                .fetch_alternative(&ctx, &url, &query, self.alternative_threshold),
        )
        .await
        .map_err(|_| RemoteError::Unavailable("alternative generation timed out".to_string()))??;

        let used = self.store.update(|r| {
            r.user_state.ai_alternatives_used += 1;
            r.user_state.ai_alternatives_used
        })?;

        Ok(json!({
            "content_url": result.content_url,
            "query": query,
            "aiAlternativesUsed": used,
        }))
    }

    async fn submit_feedback(&self, feedback: Feedback) -> Result<Value, RouterError> {
        let state = self.store.user_state()?;
        let ctx = CallerContext { user_id: state.user_id, tier: state.tier };

        // Feedback is best effort: the caller gets success either way.
        let delivered = match tokio::time::timeout(
            self.timeout,
            self.remote.submit_feedback(&ctx, &feedback),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Feedback not delivered");
                false
            }
            Err(_) => {
                warn!("Feedback submission timed out");
                false
            }
        };

        let remote = self.remote.clone();
        let data = json!({ "rating": feedback.rating, "delivered": delivered });
        tokio::spawn(async move {
            remote.send_analytics(&ctx, "feedback_submitted", data).await;
        });

        Ok(json!({ "delivered": delivered }))
    }
}

/// Derive a search query from a URL: the first non-empty search parameter,
/// then the path words, then the URL itself.
pub fn extract_query(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };

    for key in SEARCH_PARAMS {
        let hit = parsed
            .query_pairs()
            .find(|(k, v)| k == key && !v.trim().is_empty());
        if let Some((_, value)) = hit {
            return value.trim().to_string();
        }
    }

    let words: Vec<String> = parsed
        .path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if words.is_empty() {
        url.to_string()
    } else {
        words.join(" ")
    }
}
