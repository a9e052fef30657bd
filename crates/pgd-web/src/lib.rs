//! JSON API over the sheet cache, analytics and access gate.
//!
//! Stateless: every request carries HTTP Basic credentials.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use pgd_access::{has_access, IdentityStore, InMemoryIdentityStore, Section, UserIdentity};
use pgd_core::{CleanedTable, SheetId};
use pgd_storage::RetryDisposition;
use pgd_sync::{analytics, DashboardConfig, SheetCache, SheetLookup};
use serde::Serialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "pgd-web";

#[derive(Clone)]
pub struct AppState {
    pub cache: SheetCache,
    pub identities: Arc<dyn IdentityStore>,
}

impl AppState {
    pub fn new(cache: SheetCache, identities: Arc<dyn IdentityStore>) -> Self {
        Self { cache, identities }
    }
}

#[derive(Debug, Serialize)]
pub struct TableBody {
    pub columns: Vec<String>,
    pub rows: Vec<JsonMap<String, JsonValue>>,
}

#[derive(Debug, Serialize)]
pub struct SheetView {
    pub sheet: SheetId,
    pub status: &'static str,
    pub fetched_at: Option<DateTime<Utc>>,
    pub warning: Option<String>,
    pub retryable: Option<bool>,
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableBody>,
}

impl SheetView {
    fn from_lookup(sheet: SheetId, lookup: &SheetLookup, with_table: bool) -> Self {
        let cached = lookup.table();
        let warning = match lookup {
            SheetLookup::Stale { cached, error } => Some(format!(
                "refresh failed, showing data fetched at {}: {error}",
                cached.fetched_at
            )),
            SheetLookup::Unavailable(error) => Some(format!("no data available: {error}")),
            _ => None,
        };
        Self {
            sheet,
            status: lookup.status(),
            fetched_at: cached.map(|c| c.fetched_at),
            warning,
            retryable: lookup
                .error()
                .map(|e| e.disposition() == RetryDisposition::Retryable),
            rows: cached.map(|c| c.table.len()),
            table: cached.filter(|_| with_table).map(|c| TableBody {
                columns: c.table.columns.clone(),
                rows: c.table.to_records(),
            }),
        }
    }
}

fn lookup_status_code(lookup: &SheetLookup) -> StatusCode {
    match lookup {
        SheetLookup::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SheetLookup::Fresh(_) | SheetLookup::Refreshed(_) | SheetLookup::Stale { .. } => StatusCode::OK,
    }
}

#[derive(Debug, Serialize)]
pub struct AnalyticsView<T> {
    pub status: &'static str,
    pub fetched_at: Option<DateTime<Utc>>,
    pub warning: Option<String>,
    pub report: T,
}

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    Forbidden(Section),
    UnknownSheet(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"pgd\", charset=\"UTF-8\"")],
                Json(json!({ "error": "invalid credentials" })),
            )
                .into_response(),
            ApiError::Forbidden(section) => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": format!("no access to section `{section}`") })),
            )
                .into_response(),
            ApiError::UnknownSheet(name) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("unknown sheet `{name}`") })),
            )
                .into_response(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/me", get(me_handler))
        .route("/sheets/reload", post(reload_all_handler))
        .route("/sheets/{sheet}", get(sheet_handler))
        .route("/sheets/{sheet}/reload", post(reload_sheet_handler))
        .route("/analytics/hiring", get(hiring_handler))
        .route("/analytics/units", get(units_handler))
        .route("/analytics/sourcing", get(sourcing_handler))
        .route("/analytics/churn", get(churn_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &DashboardConfig) -> anyhow::Result<()> {
    let cache = SheetCache::from_config(config)?;
    let identities = InMemoryIdentityStore::from_yaml_file(&config.users_file)
        .with_context(|| format!("loading users from {}", config.users_file.display()))?;
    let state = AppState::new(cache, Arc::new(identities));
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "dashboard api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    section: Option<Section>,
) -> Result<UserIdentity, ApiError> {
    let (username, password) = basic_credentials(headers).ok_or(ApiError::Unauthorized)?;
    let store = Arc::clone(&state.identities);
    // PBKDF2 is CPU-bound.
    let identity = tokio::task::spawn_blocking(move || store.authenticate(&username, &password))
        .await
        .ok()
        .flatten()
        .ok_or(ApiError::Unauthorized)?;
    if let Some(section) = section {
        if !has_access(&identity, section) {
            debug!(username = %identity.username, %section, "section denied");
            return Err(ApiError::Forbidden(section));
        }
    }
    Ok(identity)
}

fn parse_sheet(name: &str) -> Result<SheetId, ApiError> {
    name.parse().map_err(|_| ApiError::UnknownSheet(name.to_string()))
}

fn sheet_response(sheet: SheetId, lookup: &SheetLookup) -> Response {
    let view = SheetView::from_lookup(sheet, lookup, true);
    (lookup_status_code(lookup), Json(view)).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let mut sheets = JsonMap::new();
    for sheet in SheetId::ALL {
        sheets.insert(sheet.to_string(), json!(state.cache.last_updated(sheet).await));
    }
    Json(json!({ "status": "ok", "sheets": sheets }))
}

async fn me_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    match authorize(&state, &headers, None).await {
        Ok(identity) => Json(identity).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn sheet_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(sheet): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = authorize(&state, &headers, Some(Section::Hr)).await {
        return err.into_response();
    }
    let sheet = match parse_sheet(&sheet) {
        Ok(sheet) => sheet,
        Err(err) => return err.into_response(),
    };
    let lookup = state.cache.get_or_refresh(sheet).await;
    sheet_response(sheet, &lookup)
}

async fn reload_sheet_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(sheet): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authorize(&state, &headers, Some(Section::Hr)).await {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };
    let sheet = match parse_sheet(&sheet) {
        Ok(sheet) => sheet,
        Err(err) => return err.into_response(),
    };
    info!(username = %identity.username, sheet = %sheet, "manual reload requested");
    let lookup = state.cache.reload(sheet).await;
    sheet_response(sheet, &lookup)
}

async fn reload_all_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = match authorize(&state, &headers, Some(Section::Hr)).await {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };
    info!(username = %identity.username, "manual reload of all sheets requested");
    let mut views = Vec::with_capacity(SheetId::ALL.len());
    for sheet in SheetId::ALL {
        let lookup = state.cache.reload(sheet).await;
        views.push(SheetView::from_lookup(sheet, &lookup, false));
    }
    Json(views).into_response()
}

async fn employment_report<T, F>(state: &AppState, headers: &HeaderMap, build: F) -> Response
where
    T: Serialize,
    F: Fn(&CleanedTable) -> T,
{
    if let Err(err) = authorize(state, headers, Some(Section::Hr)).await {
        return err.into_response();
    }
    let lookup = state.cache.get_or_refresh(SheetId::Employment).await;
    let view = SheetView::from_lookup(SheetId::Employment, &lookup, false);
    match lookup.table() {
        Some(cached) => Json(AnalyticsView {
            status: view.status,
            fetched_at: view.fetched_at,
            warning: view.warning,
            report: build(&cached.table),
        })
        .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, Json(view)).into_response(),
    }
}

async fn hiring_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    employment_report(&state, &headers, analytics::hiring_funnel).await
}

async fn units_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    employment_report(&state, &headers, analytics::unit_conversion).await
}

async fn sourcing_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    employment_report(&state, &headers, analytics::sourcing_channels).await
}

async fn churn_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    employment_report(&state, &headers, analytics::churn_breakdown).await
}
