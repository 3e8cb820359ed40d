//! Referral and tier reconciliation
//!
//! Two ways the local tier changes:
//! - referral merge: local, upgrade-only, pending confirmation by the authority
//! - reconcile: remote-initiated, authoritative, may move the tier either way
//!
//! Reconciliation runs periodically and never overlaps itself. A tick that
//! finds a reconciliation in flight is skipped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::models::{is_valid_referral_code, now_secs, ReferralGrant, ReferralResult, Tier};
use crate::remote::{CallerContext, RemoteAuthority, RemoteError};
use crate::store::{StateStore, StoreError};

/// Result of one `reconcile()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Another reconciliation was already in flight
    Skipped,
    /// Authority unreachable; local state untouched
    Unreachable,
    Unchanged { tier: Tier },
    Updated { from: Tier, to: Tier },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// Clears the in-flight flag when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler {
    store: Arc<StateStore>,
    remote: Arc<dyn RemoteAuthority>,
    timeout: Duration,
    in_flight: AtomicBool,
}

impl Reconciler {
    pub fn new(store: Arc<StateStore>, remote: Arc<dyn RemoteAuthority>, timeout: Duration) -> Self {
        Self {
            store,
            remote,
            timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    fn caller(&self) -> Result<CallerContext, StoreError> {
        let state = self.store.user_state()?;
        Ok(CallerContext { user_id: state.user_id, tier: state.tier })
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| RemoteError::Unavailable("request timed out".to_string()))?
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Pull the authoritative tier and overwrite the local one if it differs.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, StoreError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("Reconciliation already in flight, skipping");
            return Ok(ReconcileOutcome::Skipped);
        };

        let ctx = self.caller()?;
        let remote_tier = match self.bounded(self.remote.fetch_tier(&ctx)).await {
            Ok(tier) => tier,
            Err(e) => {
                debug!(error = %e, "Tier authority unreachable, retrying next period");
                return Ok(ReconcileOutcome::Unreachable);
            }
        };

        let outcome = self.store.update(|record| {
            let from = record.user_state.tier;
            if from == remote_tier {
                ReconcileOutcome::Unchanged { tier: from }
            } else {
                record.user_state.tier = remote_tier;
                ReconcileOutcome::Updated { from, to: remote_tier }
            }
        })?;

        if let ReconcileOutcome::Updated { from, to } = outcome {
            info!(%from, %to, "Tier updated from authority");
            self.emit(ctx, "tier_reconciled", serde_json::json!({ "from": from, "to": to }));
        }

        Ok(outcome)
    }

    /// Redeem a referral code. Merges the offered tier only if it is strictly
    /// higher than the current one, and each code grants at most once.
    pub async fn submit_referral(&self, code: &str) -> Result<ReferralResult, ReconcileError> {
        let code = code.trim().to_ascii_uppercase();
        let record = self.store.snapshot()?;
        let current = record.user_state.tier;

        if !is_valid_referral_code(&code) {
            return Ok(rejected(current, "Invalid referral code"));
        }
        if code == record.user_state.referral_code {
            return Ok(rejected(current, "Cannot redeem your own referral code"));
        }
        if record.has_grant(&code) {
            debug!(code = %code, "Referral already applied");
            return Ok(ReferralResult {
                accepted: true,
                new_tier: None,
                tier: current,
                already_applied: true,
                reason: None,
            });
        }

        let ctx = CallerContext { user_id: record.user_state.user_id.clone(), tier: current };
        let response = match self.bounded(self.remote.submit_referral(&ctx, &code)).await {
            Ok(response) => response,
            Err(RemoteError::Rejected(reason)) => {
                info!(code = %code, reason = %reason, "Referral rejected");
                return Ok(rejected(current, &reason));
            }
            Err(e) => return Err(e.into()),
        };

        let offered = response.new_tier.filter(|_| response.reward_granted);
        let grant = ReferralGrant {
            source_code: code.clone(),
            granted_tier: offered,
            granted_at: now_secs(),
        };

        // Re-check inside the write: a concurrent redemption of the same code
        // may have landed while the remote call was in flight.
        let (tier, already_applied) = self.store.update(|record| {
            if record.has_grant(&grant.source_code) {
                return (record.user_state.tier, true);
            }
            if let Some(offered) = grant.granted_tier {
                if offered > record.user_state.tier {
                    record.user_state.tier = offered;
                }
            }
            record.referral_grants.push(grant.clone());
            (record.user_state.tier, false)
        })?;

        if !already_applied {
            info!(code = %code, from = %current, to = %tier, "Referral applied");
            self.emit(
                ctx,
                "referral_applied",
                serde_json::json!({ "referral_code": code, "new_tier": offered, "tier": tier }),
            );
        }

        Ok(ReferralResult {
            accepted: true,
            new_tier: response.new_tier,
            tier,
            already_applied,
            reason: response.message,
        })
    }

    /// Report a conversion for this installation's own code and bump the
    /// local referral count. Returns the new count.
    pub async fn track_referral(&self, action: &str) -> Result<u64, ReconcileError> {
        let state = self.store.user_state()?;
        let ctx = CallerContext { user_id: state.user_id.clone(), tier: state.tier };
        self.bounded(self.remote.track_referral(&ctx, &state.referral_code, action))
            .await?;

        let count = self.store.update(|record| {
            record.user_state.referral_count += 1;
            record.user_state.referral_count
        })?;
        Ok(count)
    }

    fn emit(&self, ctx: CallerContext, event: &'static str, data: serde_json::Value) {
        let remote = self.remote.clone();
        tokio::spawn(async move {
            remote.send_analytics(&ctx, event, data).await;
        });
    }

    /// Periodic reconciliation until `shutdown` fires.
    pub async fn run(self: Arc<Self>, period: Duration, run_immediately: bool, mut shutdown: mpsc::Receiver<()>) {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if !run_immediately {
            tick.tick().await;
        }

        info!(period_secs = period.as_secs(), "Tier reconciler started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.is_in_flight() {
                        debug!("Reconcile tick skipped, previous run still in flight");
                        continue;
                    }
                    let this = self.clone();
                    tokio::spawn(async move {
                        match this.reconcile().await {
                            Ok(outcome) => debug!(?outcome, "Reconcile tick finished"),
                            Err(e) => error!(error = %e, "Reconcile could not persist tier"),
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("Tier reconciler shutting down");
                    break;
                }
            }
        }
    }
}

fn rejected(tier: Tier, reason: &str) -> ReferralResult {
    warn!(reason, "Referral not accepted");
    ReferralResult {
        accepted: false,
        new_tier: None,
        tier,
        already_applied: false,
        reason: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockAuthority;
    use crate::store::SqliteBackend;
    use tokio::sync::{Notify, Semaphore};

    fn store() -> Arc<StateStore> {
        Arc::new(
            StateStore::open("test", Box::new(SqliteBackend::in_memory().unwrap()), true).unwrap(),
        )
    }

    fn reconciler(store: &Arc<StateStore>, remote: Arc<MockAuthority>) -> Reconciler {
        Reconciler::new(store.clone(), remote, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_referral_upgrades_basic_to_pro() {
        let store = store();
        store.update(|r| r.user_state.tier = Tier::Basic).unwrap();
        let remote = Arc::new(MockAuthority::new().granting(Tier::Pro));
        let reconciler = reconciler(&store, remote);

        let result = reconciler.submit_referral("abcd1234").await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.tier, Tier::Pro);
        assert_eq!(store.user_state().unwrap().tier, Tier::Pro);
        assert!(store.snapshot().unwrap().has_grant("ABCD1234"));
    }

    #[tokio::test]
    async fn test_referral_never_downgrades() {
        let store = store();
        store.update(|r| r.user_state.tier = Tier::Enterprise).unwrap();
        let remote = Arc::new(MockAuthority::new().granting(Tier::Basic));
        let reconciler = reconciler(&store, remote);

        let result = reconciler.submit_referral("ABCD1234").await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.new_tier, Some(Tier::Basic));
        assert_eq!(result.tier, Tier::Enterprise);
        assert_eq!(store.user_state().unwrap().tier, Tier::Enterprise);
    }

    #[tokio::test]
    async fn test_referral_replay_is_idempotent() {
        let store = store();
        let remote = Arc::new(MockAuthority::new().granting(Tier::Pro));
        let reconciler = reconciler(&store, remote.clone());

        reconciler.submit_referral("ABCD1234").await.unwrap();
        let before = store.snapshot().unwrap();

        let replay = reconciler.submit_referral("ABCD1234").await.unwrap();
        assert!(replay.accepted);
        assert!(replay.already_applied);
        assert_eq!(remote.referral_calls(), 1);
        assert_eq!(store.snapshot().unwrap(), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_duplicate_referral_grants_once() {
        let store = store();
        let gate = Arc::new(Semaphore::new(0));
        let remote = Arc::new(
            MockAuthority::new()
                .granting(Tier::Pro)
                .with_referral_gate(gate.clone()),
        );
        let reconciler = Arc::new(reconciler(&store, remote.clone()));

        let submit = |r: Arc<Reconciler>| tokio::spawn(async move { r.submit_referral("ABCD1234").await });
        let first = submit(reconciler.clone());
        let second = submit(reconciler.clone());

        // Both pass the local replay check before either records a grant
        while remote.referral_calls() < 2 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(2);

        let results = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        assert!(results.iter().all(|r| r.accepted && r.tier == Tier::Pro));
        assert_eq!(results.iter().filter(|r| r.already_applied).count(), 1);

        let record = store.snapshot().unwrap();
        assert_eq!(record.referral_grants.len(), 1);
        assert_eq!(record.user_state.tier, Tier::Pro);
    }

    #[tokio::test]
    async fn test_malformed_and_own_codes_rejected_locally() {
        let store = store();
        let remote = Arc::new(MockAuthority::new().granting(Tier::Elite));
        let reconciler = reconciler(&store, remote.clone());
        let own = store.user_state().unwrap().referral_code;

        assert!(!reconciler.submit_referral("short").await.unwrap().accepted);
        assert!(!reconciler.submit_referral(&own).await.unwrap().accepted);
        assert_eq!(remote.referral_calls(), 0);
        assert_eq!(store.user_state().unwrap().tier, Tier::Free);
    }

    #[tokio::test]
    async fn test_remote_rejection_leaves_state() {
        let store = store();
        let remote = Arc::new(MockAuthority::new().rejecting("Code expired"));
        let reconciler = reconciler(&store, remote);

        let result = reconciler.submit_referral("ABCD1234").await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason.as_deref(), Some("Code expired"));
        assert!(store.snapshot().unwrap().referral_grants.is_empty());
    }

    #[tokio::test]
    async fn test_referral_unreachable_is_error() {
        let store = store();
        let remote = Arc::new(MockAuthority::new().with_available(false));
        let reconciler = reconciler(&store, remote);

        assert!(matches!(
            reconciler.submit_referral("ABCD1234").await,
            Err(ReconcileError::Remote(RemoteError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_remote_wins_and_is_idempotent() {
        let store = store();
        store.update(|r| r.user_state.tier = Tier::Elite).unwrap();
        let remote = Arc::new(MockAuthority::new().with_tier(Tier::Basic));
        let reconciler = reconciler(&store, remote);

        assert_eq!(
            reconciler.reconcile().await.unwrap(),
            ReconcileOutcome::Updated { from: Tier::Elite, to: Tier::Basic }
        );
        let after_first = store.snapshot().unwrap();

        assert_eq!(
            reconciler.reconcile().await.unwrap(),
            ReconcileOutcome::Unchanged { tier: Tier::Basic }
        );
        assert_eq!(store.snapshot().unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_reconcile_unreachable_keeps_tier() {
        let store = store();
        store.update(|r| r.user_state.tier = Tier::Pro).unwrap();
        let remote = Arc::new(MockAuthority::new().with_available(false));
        let reconciler = reconciler(&store, remote);

        assert_eq!(reconciler.reconcile().await.unwrap(), ReconcileOutcome::Unreachable);
        assert_eq!(store.user_state().unwrap().tier, Tier::Pro);
        assert!(!reconciler.is_in_flight());
    }

    #[tokio::test]
    async fn test_at_most_one_reconcile_in_flight() {
        let store = store();
        let gate = Arc::new(Notify::new());
        let remote = Arc::new(
            MockAuthority::new()
                .with_tier(Tier::Pro)
                .with_tier_gate(gate.clone()),
        );
        let reconciler = Arc::new(reconciler(&store, remote.clone()));

        let first = {
            let r = reconciler.clone();
            tokio::spawn(async move { r.reconcile().await })
        };
        while remote.tier_calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(reconciler.is_in_flight());

        assert_eq!(reconciler.reconcile().await.unwrap(), ReconcileOutcome::Skipped);
        assert_eq!(remote.tier_calls(), 1);

        gate.notify_one();
        assert_eq!(
            first.await.unwrap().unwrap(),
            ReconcileOutcome::Updated { from: Tier::Free, to: Tier::Pro }
        );
        assert!(!reconciler.is_in_flight());
    }

    #[tokio::test]
    async fn test_track_referral_counts() {
        let store = store();
        let remote = Arc::new(MockAuthority::new());
        let reconciler = reconciler(&store, remote.clone());

        assert_eq!(reconciler.track_referral("signup").await.unwrap(), 1);
        assert_eq!(reconciler.track_referral("upgrade").await.unwrap(), 2);
        assert_eq!(remote.track_calls(), 2);

        remote.set_available(false);
        assert!(reconciler.track_referral("signup").await.is_err());
        assert_eq!(store.user_state().unwrap().referral_count, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = store();
        let remote = Arc::new(MockAuthority::new().with_tier(Tier::Basic));
        let reconciler = Arc::new(reconciler(&store, remote.clone()));
        let (tx, rx) = mpsc::channel(1);

        let handle = tokio::spawn(reconciler.clone().run(Duration::from_secs(3600), true, rx));
        while store.user_state().unwrap().tier != Tier::Basic {
            tokio::task::yield_now().await;
        }
        tx.send(()).await.unwrap();
        handle.await.unwrap();
        assert_eq!(remote.tier_calls(), 1);
    }
}
