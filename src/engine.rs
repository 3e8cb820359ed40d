//! Interception engine - gates every outbound navigation
//!
//! ```text
//!  NavigationRequest
//!        │
//!        ▼
//!  subresource / internal? ──yes──▶ Allow
//!        │
//!  policy disabled? ────────yes──▶ Allow
//!        │
//!  blocklist hit? ──────────yes──▶ Block (local, counter += 1)
//!        │
//!  allowlist hit? ──────────yes──▶ Allow
//!        │
//!        ├──▶ Allow (returned now)
//!        └──▶ scoring task ──▶ low rarity? ──▶ RarityWarning ──▶ warning channel
//! ```
//!
//! The synchronous path never touches the network. Scoring tasks fail open:
//! any remote failure or timeout just means no warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::hostlist::{host_of, HostList};
use crate::models::{
    NavigationRequest, OriginType, PolicyDecision, RarityWarning, RequestId, TabId,
};
use crate::policy::PolicyEvaluator;
use crate::remote::{CallerContext, RemoteAuthority, RemoteError};
use crate::store::StateStore;

/// Static engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub blocklist: HostList,
    pub allowlist: HostList,
    /// URL prefixes that are never evaluated (client pages, the gateway itself)
    pub internal_prefixes: Vec<String>,
    pub block_page_url: String,
    /// Upper bound on one scoring call
    pub remote_timeout: Duration,
}

impl EngineSettings {
    /// The gateway itself is treated as internal so its own pages are never gated.
    pub fn from_config(config: &Config) -> Self {
        let mut internal_prefixes = config.policy.internal_prefixes.clone();
        if !config.remote.gateway_url.is_empty() {
            internal_prefixes.push(config.remote.gateway_url.clone());
        }

        Self {
            blocklist: HostList::new(&config.policy.blocklist),
            allowlist: HostList::new(&config.policy.allowlist),
            internal_prefixes,
            block_page_url: config.policy.block_page_url.clone(),
            remote_timeout: Duration::from_secs(config.remote.timeout_secs),
        }
    }
}

/// Scores a navigation and turns the result into an optional warning.
#[derive(Clone)]
pub struct Scorer {
    store: Arc<StateStore>,
    evaluator: PolicyEvaluator,
    remote: Arc<dyn RemoteAuthority>,
    timeout: Duration,
}

impl Scorer {
    pub fn new(
        store: Arc<StateStore>,
        evaluator: PolicyEvaluator,
        remote: Arc<dyn RemoteAuthority>,
        timeout: Duration,
    ) -> Self {
        Self { store, evaluator, remote, timeout }
    }

    /// One at-most-once scoring round trip. Timeout counts as unavailable.
    pub async fn score(
        &self,
        request: &NavigationRequest,
    ) -> Result<Option<RarityWarning>, RemoteError> {
        let state = self
            .store
            .user_state()
            .map_err(|e| RemoteError::Unavailable(format!("reading local state: {}", e)))?;
        let ctx = CallerContext { user_id: state.user_id.clone(), tier: state.tier };
        let threshold = self.evaluator.threshold(state.tier, state.rarity_adjustment);

        let result = tokio::time::timeout(
            self.timeout,
            self.remote.score_site(&ctx, &request.url, threshold),
        )
        .await
        .map_err(|_| RemoteError::Unavailable("rarity check timed out".to_string()))??;

        let warning =
            self.evaluator
                .warning_for(request, &result, state.tier, state.rarity_adjustment);

        let remote = self.remote.clone();
        let data = serde_json::json!({
            "url": request.url,
            "rarity_score": result.score,
            "user_tier": state.tier,
            "blocked": warning.is_some(),
        });
        tokio::spawn(async move {
            remote.send_analytics(&ctx, "site_rarity_checked", data).await;
        });

        Ok(warning)
    }
}

struct PendingScore {
    request_id: RequestId,
    handle: AbortHandle,
}

type PendingMap = Arc<Mutex<HashMap<TabId, PendingScore>>>;

pub struct InterceptionEngine {
    store: Arc<StateStore>,
    settings: EngineSettings,
    scorer: Scorer,
    warnings: mpsc::Sender<RarityWarning>,
    pending: PendingMap,
    runtime: Handle,
}

impl InterceptionEngine {
    /// Must be created inside a Tokio runtime; scoring tasks are spawned on it.
    pub fn new(
        store: Arc<StateStore>,
        evaluator: PolicyEvaluator,
        remote: Arc<dyn RemoteAuthority>,
        settings: EngineSettings,
        warnings: mpsc::Sender<RarityWarning>,
    ) -> Self {
        let scorer = Scorer::new(store.clone(), evaluator, remote, settings.remote_timeout);
        Self {
            store,
            settings,
            scorer,
            warnings,
            pending: Arc::new(Mutex::new(HashMap::new())),
            runtime: Handle::current(),
        }
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Decide a navigation. Never waits on the network.
    pub fn evaluate(&self, request: &NavigationRequest) -> PolicyDecision {
        if request.origin != OriginType::TopLevel || self.is_internal(&request.url) {
            return PolicyDecision::Allow;
        }

        let enabled = self.store.policy_enabled().unwrap_or_else(|e| {
            error!(error = %e, "Reading policy flag failed, assuming enabled");
            true
        });
        if !enabled {
            return PolicyDecision::Allow;
        }

        let Some(hostname) = host_of(&request.url) else {
            debug!(url = %request.url, "No hostname, allowing");
            return PolicyDecision::Allow;
        };

        if let Some(entry) = self.settings.blocklist.matches(&hostname) {
            info!(hostname = %hostname, entry, "Blocking listed site");
            // A lost counter increment must not turn a block into an allow.
            if let Err(e) = self.store.update(|r| r.user_state.blocked_sites_count += 1) {
                error!(error = %e, "Failed to persist blocked site count");
            }
            return PolicyDecision::Block {
                reason: format!("{} is on the blocklist", entry),
                redirect_url: self.block_redirect(&request.url, &hostname),
                alternative_hint: None,
            };
        }

        if self.settings.allowlist.matches(&hostname).is_some() {
            debug!(hostname = %hostname, "Allowlisted, skipping rarity check");
            return PolicyDecision::Allow;
        }

        self.enqueue_scoring(request.clone());
        PolicyDecision::Allow
    }

    /// Drop any scoring still pending for a closed tab.
    pub fn tab_closed(&self, tab_id: TabId) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(entry) = pending.remove(&tab_id) {
                entry.handle.abort();
                debug!(tab_id, request_id = %entry.request_id, "Discarded scoring for closed tab");
            }
        }
    }

    /// Number of tabs with a scoring task in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn is_internal(&self, url: &str) -> bool {
        url.starts_with(&self.settings.block_page_url)
            || self
                .settings
                .internal_prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && url.starts_with(prefix.as_str()))
    }

    fn block_redirect(&self, url: &str, hostname: &str) -> String {
        match Url::parse_with_params(
            &self.settings.block_page_url,
            &[("url", url), ("hostname", hostname)],
        ) {
            Ok(u) => u.to_string(),
            Err(e) => {
                warn!(error = %e, "Block page URL is not absolute");
                self.settings.block_page_url.clone()
            }
        }
    }

    fn enqueue_scoring(&self, request: NavigationRequest) {
        let scorer = self.scorer.clone();
        let warnings = self.warnings.clone();
        let pending = self.pending.clone();
        let tab_id = request.tab_id;
        let request_id = request.request_id.clone();

        let task = async move {
            match scorer.score(&request).await {
                Ok(Some(warning)) => {
                    if is_current(&pending, request.tab_id, &request.request_id) {
                        info!(
                            url = %request.url,
                            score = warning.score,
                            required = warning.required_score,
                            "Low rarity, issuing warning"
                        );
                        if warnings.send(warning).await.is_err() {
                            debug!("Warning receiver gone, dropping warning");
                        }
                    } else {
                        debug!(request_id = %request.request_id, "Navigation superseded, dropping warning");
                    }
                }
                Ok(None) => debug!(url = %request.url, "Rarity check passed"),
                Err(e) => warn!(url = %request.url, error = %e, "Rarity check failed, no warning"),
            }
            finish(&pending, request.tab_id, &request.request_id);
        };

        let Some(tab_id) = tab_id else {
            self.runtime.spawn(task);
            return;
        };

        // Registration happens under the lock so the task cannot observe the
        // map before its own entry is in place.
        match self.pending.lock() {
            Ok(mut pending) => {
                let handle = self.runtime.spawn(task).abort_handle();
                if let Some(previous) =
                    pending.insert(tab_id, PendingScore { request_id, handle })
                {
                    previous.handle.abort();
                    debug!(tab_id, request_id = %previous.request_id, "Superseded pending scoring");
                }
            }
            Err(_) => {
                error!("Pending scoring map poisoned, skipping rarity check");
            }
        }
    }
}

fn is_current(pending: &PendingMap, tab_id: Option<TabId>, request_id: &str) -> bool {
    let Some(tab_id) = tab_id else {
        return true;
    };
    pending
        .lock()
        .map(|p| p.get(&tab_id).map(|e| e.request_id == request_id).unwrap_or(false))
        .unwrap_or(false)
}

fn finish(pending: &PendingMap, tab_id: Option<TabId>, request_id: &str) {
    let Some(tab_id) = tab_id else {
        return;
    };
    if let Ok(mut p) = pending.lock() {
        if p.get(&tab_id).map(|e| e.request_id == request_id).unwrap_or(false) {
            p.remove(&tab_id);
        }
    }
}
