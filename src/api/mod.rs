//! API layer - HTTP surface for the client
//!
//! Provides:
//! - Navigation evaluation (`POST /api/navigation`)
//! - Control commands (`POST /api/command`)
//! - Per-tab warning delivery (`GET /api/warnings/:tab_id`)
//! - Tab lifecycle (`POST /api/tabs/:tab_id/closed`)
//! - Local block page and health check

pub mod routes;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::InterceptionEngine;
use crate::models::{RarityWarning, RequestId, TabId};
use crate::router::MessageRouter;

/// Warnings kept per tab until the client collects them
const MAX_WARNINGS_PER_TAB: usize = 16;

/// Tabs tracked at once; the least recently touched tab is evicted beyond this
const MAX_TRACKED_TABS: usize = 512;

/// Handler state shared across requests
pub struct ApiState {
    pub engine: Arc<InterceptionEngine>,
    pub router: Arc<MessageRouter>,
    pub warnings: Arc<WarningBoard>,
}

pub type SharedState = Arc<ApiState>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/navigation", post(routes::api_navigation))
        .route("/api/command", post(routes::api_command))
        .route("/api/warnings/:tab_id", get(routes::api_take_warnings))
        .route("/api/tabs/:tab_id/closed", post(routes::api_tab_closed))
        .route("/blocked", get(routes::blocked_page))
        .route("/health", get(routes::health))
        .with_state(state)
}

struct TabWarnings {
    /// Request id of the tab's latest top-level navigation
    current: RequestId,
    queue: Vec<RarityWarning>,
    touched: Instant,
}

/// Pending rarity warnings, keyed by tab, waiting for the client to poll.
///
/// A warning is only kept if it belongs to the tab's latest navigation.
/// Warnings for superseded navigations, closed tabs or unknown tabs are dropped.
#[derive(Default)]
pub struct WarningBoard {
    tabs: Mutex<HashMap<TabId, TabWarnings>>,
}

impl WarningBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new top-level navigation in `tab_id`, discarding whatever the
    /// previous page had pending.
    pub async fn navigated(&self, tab_id: TabId, request_id: &str) {
        let mut tabs = self.tabs.lock().await;
        if !tabs.contains_key(&tab_id) && tabs.len() >= MAX_TRACKED_TABS {
            evict_oldest(&mut tabs);
        }
        tabs.insert(
            tab_id,
            TabWarnings {
                current: request_id.to_string(),
                queue: Vec::new(),
                touched: Instant::now(),
            },
        );
    }

    /// Returns false when the warning was dropped.
    pub async fn post(&self, warning: RarityWarning) -> bool {
        let Some(tab_id) = warning.tab_id else {
            debug!(url = %warning.url, "Warning without a tab, dropping");
            return false;
        };

        let mut tabs = self.tabs.lock().await;
        let Some(tab) = tabs.get_mut(&tab_id) else {
            debug!(tab_id, request_id = %warning.request_id, "Warning for unknown or closed tab, dropping");
            return false;
        };
        if tab.current != warning.request_id {
            debug!(tab_id, request_id = %warning.request_id, "Warning for superseded navigation, dropping");
            return false;
        }

        if tab.queue.len() >= MAX_WARNINGS_PER_TAB {
            tab.queue.remove(0);
        }
        tab.queue.push(warning);
        tab.touched = Instant::now();
        true
    }

    /// Remove and return every warning for `tab_id`.
    pub async fn take(&self, tab_id: TabId) -> Vec<RarityWarning> {
        let mut tabs = self.tabs.lock().await;
        match tabs.get_mut(&tab_id) {
            Some(tab) => {
                tab.touched = Instant::now();
                std::mem::take(&mut tab.queue)
            }
            None => Vec::new(),
        }
    }

    /// Forget the tab entirely; later warnings for it are dropped.
    pub async fn close(&self, tab_id: TabId) {
        self.tabs.lock().await.remove(&tab_id);
    }

    pub async fn pending(&self, tab_id: TabId) -> usize {
        self.tabs
            .lock()
            .await
            .get(&tab_id)
            .map(|t| t.queue.len())
            .unwrap_or(0)
    }

    pub async fn tracked_tabs(&self) -> usize {
        self.tabs.lock().await.len()
    }
}

fn evict_oldest(tabs: &mut HashMap<TabId, TabWarnings>) {
    let oldest = tabs
        .iter()
        .min_by_key(|(_, t)| t.touched)
        .map(|(id, _)| *id);
    if let Some(tab_id) = oldest {
        tabs.remove(&tab_id);
        debug!(tab_id, "Evicted least recently used tab");
    }
}

/// Move warnings from the engine channel onto the board until the channel closes.
pub fn spawn_warning_pump(
    board: Arc<WarningBoard>,
    mut rx: mpsc::Receiver<RarityWarning>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(warning) = rx.recv().await {
            board.post(warning).await;
        }
        debug!("Warning channel closed");
    })
}
