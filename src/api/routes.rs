//! API HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::SharedState;
use crate::models::{NavigationRequest, OriginType, PolicyDecision, TabId};
use crate::router::Response;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// POST /api/navigation
pub async fn api_navigation(
    State(state): State<SharedState>,
    Json(request): Json<NavigationRequest>,
) -> Json<PolicyDecision> {
    // The tab is registered before scoring starts so the new page's own
    // warning is accepted and the previous page's are not.
    if let (OriginType::TopLevel, Some(tab_id)) = (request.origin, request.tab_id) {
        state.warnings.navigated(tab_id, &request.request_id).await;
    }
    Json(state.engine.evaluate(&request))
}

/// POST /api/command
pub async fn api_command(
    State(state): State<SharedState>,
    Json(command): Json<Value>,
) -> Json<Response> {
    Json(state.router.dispatch_json(command).await)
}

/// GET /api/warnings/:tab_id
pub async fn api_take_warnings(
    State(state): State<SharedState>,
    Path(tab_id): Path<TabId>,
) -> Json<Vec<PolicyDecision>> {
    let warnings = state.warnings.take(tab_id).await;
    Json(warnings.into_iter().map(PolicyDecision::Warn).collect())
}

/// POST /api/tabs/:tab_id/closed
pub async fn api_tab_closed(
    State(state): State<SharedState>,
    Path(tab_id): Path<TabId>,
) -> StatusCode {
    state.engine.tab_closed(tab_id);
    state.warnings.close(tab_id).await;
    debug!(tab_id, "Tab closed");
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct BlockedParams {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub hostname: String,
}

/// GET /blocked - local block page, served without any network dependency
pub async fn blocked_page(Query(params): Query<BlockedParams>) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Blocked</title></head>\
         <body><h1>{} is blocked</h1><p>Rarity mode blocked <code>{}</code>.</p></body></html>\n",
        escape_html(&params.hostname),
        escape_html(&params.url),
    ))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
