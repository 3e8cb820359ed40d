//! Policy evaluator - tier thresholds and the low-rarity test
//!
//! Pure functions only. The interception engine feeds scores in and decides
//! what to do with the resulting warning.

use crate::models::{NavigationRequest, RarityWarning, ScoreResult, Tier};

/// Default margin added to the tier threshold before warning
pub const DEFAULT_GRACE_BUFFER: f64 = 20.0;

/// Minimum rarity score per tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierThresholdTable {
    thresholds: [f64; 5],
}

impl TierThresholdTable {
    pub const fn standard() -> Self {
        // free, basic, pro, enterprise, elite
        Self {
            thresholds: [50.0, 70.0, 85.0, 95.0, 100.0],
        }
    }

    pub fn get(&self, tier: Tier) -> f64 {
        self.thresholds[tier as usize]
    }
}

impl Default for TierThresholdTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PolicyEvaluator {
    table: TierThresholdTable,
    grace_buffer: f64,
}

impl PolicyEvaluator {
    pub fn new(table: TierThresholdTable, grace_buffer: f64) -> Self {
        Self { table, grace_buffer }
    }

    pub fn grace_buffer(&self) -> f64 {
        self.grace_buffer
    }

    /// `table[tier] + adjustment`
    pub fn threshold(&self, tier: Tier, adjustment: f64) -> f64 {
        self.table.get(tier) + adjustment
    }

    /// `threshold + grace_buffer`
    pub fn warn_threshold(&self, tier: Tier, adjustment: f64) -> f64 {
        self.threshold(tier, adjustment) + self.grace_buffer
    }

    pub fn is_low_rarity(&self, score: f64, tier: Tier, adjustment: f64) -> bool {
        score < self.warn_threshold(tier, adjustment)
    }

    /// Build the warning for a scored navigation, or `None` if the score clears
    /// the warn threshold.
    pub fn warning_for(
        &self,
        request: &NavigationRequest,
        result: &ScoreResult,
        tier: Tier,
        adjustment: f64,
    ) -> Option<RarityWarning> {
        if !self.is_low_rarity(result.score, tier, adjustment) {
            return None;
        }

        Some(RarityWarning {
            request_id: request.request_id.clone(),
            tab_id: request.tab_id,
            url: request.url.clone(),
            score: result.score,
            required_score: self.warn_threshold(tier, adjustment),
            alternative_hint: result.alternative_hint.clone(),
            upsell_tier: result.upsell_tier.clone(),
            upsell_price: result.upsell_price,
        })
    }
}

impl Default for PolicyEvaluator {
    fn default() -> Self {
        Self::new(TierThresholdTable::standard(), DEFAULT_GRACE_BUFFER)
    }
}
