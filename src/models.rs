//! Shared types for navigation gating, tier state and referrals.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Browser tab identifier supplied by the client
pub type TabId = u64;

/// Unique identifier for a navigation request
pub type RequestId = String;

/// Length of a referral code
pub const REFERRAL_CODE_LENGTH: usize = 8;

const REFERRAL_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const USER_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

//=============================================================================
// TIERS
//=============================================================================

/// Entitlement level. Declaration order is the entitlement order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
    Elite,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise, Tier::Elite];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
            Tier::Elite => "elite",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            "elite" => Ok(Tier::Elite),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

//=============================================================================
// USER STATE
//=============================================================================

/// Per-installation user state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub user_id: String,
    pub tier: Tier,
    pub referral_code: String,
    pub referral_count: u64,
    /// Additive offset applied to the tier threshold
    pub rarity_adjustment: f64,
    pub blocked_sites_count: u64,
    pub ai_alternatives_used: u64,
}

impl UserState {
    /// Fresh state with a newly generated identity and referral code.
    pub fn bootstrap() -> Self {
        Self {
            user_id: generate_user_id(),
            tier: Tier::Free,
            referral_code: generate_referral_code(),
            referral_count: 0,
            rarity_adjustment: 0.0,
            blocked_sites_count: 0,
            ai_alternatives_used: 0,
        }
    }
}

/// `user_<unix millis>_<9 base36 chars>`
pub fn generate_user_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| USER_ID_ALPHABET[rng.gen_range(0..USER_ID_ALPHABET.len())] as char)
        .collect();
    format!("user_{}_{}", millis, suffix)
}

pub fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LENGTH)
        .map(|_| REFERRAL_ALPHABET[rng.gen_range(0..REFERRAL_ALPHABET.len())] as char)
        .collect()
}

/// Well-formed referral codes are exactly eight ASCII alphanumerics.
pub fn is_valid_referral_code(code: &str) -> bool {
    code.len() == REFERRAL_CODE_LENGTH && code.chars().all(|c| c.is_ascii_alphanumeric())
}

//=============================================================================
// NAVIGATION
//=============================================================================

/// Where a request originates. Only top-level navigations are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginType {
    #[serde(alias = "main_frame")]
    TopLevel,
    Subresource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationRequest {
    pub url: String,
    pub request_id: RequestId,
    #[serde(default)]
    pub tab_id: Option<TabId>,
    pub origin: OriginType,
}

impl NavigationRequest {
    pub fn top_level(url: impl Into<String>, tab_id: Option<TabId>) -> Self {
        Self {
            url: url.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            tab_id,
            origin: OriginType::TopLevel,
        }
    }

    pub fn subresource(url: impl Into<String>, tab_id: Option<TabId>) -> Self {
        Self {
            origin: OriginType::Subresource,
            ..Self::top_level(url, tab_id)
        }
    }
}

/// Outcome of the interception path for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Block {
        reason: String,
        /// Local block page carrying the original URL and hostname
        redirect_url: String,
        alternative_hint: Option<String>,
    },
    Warn(RarityWarning),
}

impl PolicyDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    pub fn is_block(&self) -> bool {
        matches!(self, PolicyDecision::Block { .. })
    }
}

/// Low-rarity warning shown on an already-loaded page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RarityWarning {
    pub request_id: RequestId,
    pub tab_id: Option<TabId>,
    pub url: String,
    pub score: f64,
    pub required_score: f64,
    pub alternative_hint: Option<String>,
    pub upsell_tier: Option<String>,
    pub upsell_price: Option<f64>,
}

//=============================================================================
// REMOTE RESULTS
//=============================================================================

/// Rarity score for a destination, as reported by the scoring authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// In `[0, 100]`
    pub score: f64,
    pub alternative_hint: Option<String>,
    pub upsell_tier: Option<String>,
    pub upsell_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeResult {
    pub content_url: String,
}

//=============================================================================
// REFERRALS
//=============================================================================

/// Record of a redeemed referral code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralGrant {
    pub source_code: String,
    /// Tier offered by the authority, if any
    pub granted_tier: Option<Tier>,
    /// Unix seconds
    pub granted_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralResult {
    pub accepted: bool,
    /// Tier offered by the authority
    pub new_tier: Option<Tier>,
    /// Local tier after the merge
    pub tier: Tier,
    /// The code had already been redeemed by this installation
    #[serde(default)]
    pub already_applied: bool,
    pub reason: Option<String>,
}

/// User feedback forwarded to the authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub rarity_satisfied: Option<bool>,
    #[serde(default)]
    pub comments: Option<String>,
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Free < Tier::Basic);
        assert!(Tier::Basic < Tier::Pro);
        assert!(Tier::Enterprise < Tier::Elite);
        assert_eq!(Tier::ALL.iter().max(), Some(&Tier::Elite));
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("PRO".parse::<Tier>().unwrap(), Tier::Pro);
        assert_eq!(" enterprise ".parse::<Tier>().unwrap(), Tier::Enterprise);
        assert!("platinum".parse::<Tier>().is_err());
        assert_eq!(serde_json::to_string(&Tier::Elite).unwrap(), "\"elite\"");
    }

    #[test]
    fn test_referral_code_shape() {
        for _ in 0..50 {
            let code = generate_referral_code();
            assert!(is_valid_referral_code(&code), "bad code {}", code);
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
        assert!(!is_valid_referral_code("ABC"));
        assert!(!is_valid_referral_code("ABCD-123"));
    }

    #[test]
    fn test_user_id_shape() {
        let id = generate_user_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "user");
        assert!(parts[1].parse::<u128>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn test_user_state_camel_case() {
        let state = UserState::bootstrap();
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("blockedSitesCount").is_some());
        assert!(json.get("aiAlternativesUsed").is_some());
        assert_eq!(json["tier"], "free");
    }

    #[test]
    fn test_origin_accepts_main_frame() {
        let req: NavigationRequest = serde_json::from_str(
            r#"{"url":"https://a.test/","request_id":"r1","origin":"main_frame"}"#,
        )
        .unwrap();
        assert_eq!(req.origin, OriginType::TopLevel);
        assert_eq!(req.tab_id, None);
    }
}
