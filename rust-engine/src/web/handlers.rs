//! Tracking and landing endpoint handlers.
//!
//! Handlers only extract request data and map outcomes to responses. All
//! decisions are made by the [`Correlator`] and the [`Gatekeeper`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Form, FromRequest, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::landing::{Gatekeeper, LandingError};
use crate::store::Store;
use crate::tracking::{Correlator, TrackError, TrackOutcome, TrackRequest};
use crate::Config;

/// Transparent 1x1 GIF.
pub const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

const REPORT_ACK: &str = "Thank you for reporting this message.";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub correlator: Arc<Correlator>,
    pub gatekeeper: Arc<Gatekeeper>,
}

impl AppState {
    pub fn new(config: Config, store: Store) -> Self {
        Self {
            correlator: Arc::new(Correlator::new(store.clone(), &config)),
            gatekeeper: Arc::new(Gatekeeper::new(store, &config)),
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Tracking
// =============================================================================

/// `GET /track/:kind`
pub async fn track_get(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let request = track_request(&state, kind, query, Vec::new(), connect_info, &headers);
    respond(state.correlator.track(&request).await)
}

/// `POST /track/:kind`, typically a landing page form submission.
///
/// The body is optional. Urlencoded and multipart forms are read; any other
/// body is ignored.
pub async fn track_post(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Request,
) -> Response {
    let form = read_form(&state, &headers, body).await;
    let request = track_request(&state, kind, query, form, connect_info, &headers);
    respond(state.correlator.track(&request).await)
}

/// Form fields from a POST body. File parts of multipart bodies are skipped.
async fn read_form(state: &AppState, headers: &HeaderMap, body: Request) -> Vec<(String, String)> {
    let content_type = header_str(headers, header::CONTENT_TYPE)
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        match Form::<Vec<(String, String)>>::from_request(body, state).await {
            Ok(Form(form)) => form,
            Err(e) => {
                debug!(error = %e, "track_form_unreadable");
                Vec::new()
            }
        }
    } else if content_type.starts_with("multipart/form-data") {
        let mut multipart = match Multipart::from_request(body, state).await {
            Ok(multipart) => multipart,
            Err(e) => {
                debug!(error = %e, "track_multipart_unreadable");
                return Vec::new();
            }
        };

        let mut form = Vec::new();
        loop {
            match multipart.next_field().await {
                Ok(Some(field)) => {
                    if field.file_name().is_some() {
                        continue;
                    }
                    let Some(name) = field.name().map(str::to_string) else {
                        continue;
                    };
                    match field.text().await {
                        Ok(value) => form.push((name, value)),
                        Err(e) => {
                            debug!(error = %e, "track_multipart_unreadable");
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "track_multipart_unreadable");
                    break;
                }
            }
        }
        form
    } else {
        Vec::new()
    }
}

fn track_request(
    state: &AppState,
    kind: String,
    query: Vec<(String, String)>,
    form: Vec<(String, String)>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> TrackRequest {
    let (token, query): (Vec<_>, Vec<_>) = query.into_iter().partition(|(k, _)| k == "rid");

    TrackRequest {
        kind,
        token: token.into_iter().next().map(|(_, v)| v),
        query,
        form,
        ip: client_ip(state.config.trust_proxy_headers, connect_info, headers),
        user_agent: header_str(headers, header::USER_AGENT).unwrap_or_default(),
        referrer: header_str(headers, header::REFERER),
    }
}

fn respond(result: Result<TrackOutcome, TrackError>) -> Response {
    match result {
        Ok(TrackOutcome::Pixel) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/gif"),
                (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
                (header::PRAGMA, "no-cache"),
                (header::EXPIRES, "0"),
            ],
            PIXEL_GIF,
        )
            .into_response(),
        Ok(TrackOutcome::Redirect(location)) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Ok(TrackOutcome::Reported) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            REPORT_ACK,
        )
            .into_response(),
        Ok(TrackOutcome::NoContent) => StatusCode::NO_CONTENT.into_response(),
        Ok(TrackOutcome::Ignored) => StatusCode::OK.into_response(),
        Err(TrackError::MissingToken) => StatusCode::BAD_REQUEST.into_response(),
        Err(TrackError::UnknownToken) => StatusCode::NOT_FOUND.into_response(),
        Err(TrackError::InvalidRedirect(target)) => {
            warn!(target = %target, "track_invalid_redirect");
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(TrackError::Store(e)) => {
            error!(error = %e, "track_store_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// =============================================================================
// Landing Pages
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LandingQuery {
    pub rid: Option<String>,
    pub campaign: Option<String>,
}

/// `GET /landing/:page_id`
pub async fn landing(
    State(state): State<AppState>,
    Path(page_id): Path<i64>,
    Query(query): Query<LandingQuery>,
) -> Response {
    let result = state
        .gatekeeper
        .serve(page_id, query.rid.as_deref(), query.campaign.as_deref())
        .await;

    match result {
        Ok(html) => Html(html).into_response(),
        Err(LandingError::MissingToken) => StatusCode::BAD_REQUEST.into_response(),
        Err(LandingError::UnknownToken) => StatusCode::NOT_FOUND.into_response(),
        Err(LandingError::Forbidden(_)) => StatusCode::FORBIDDEN.into_response(),
        Err(e) => {
            error!(page_id = page_id, error = %e, "landing_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// =============================================================================
// Request Helpers
// =============================================================================

/// Client address: first `X-Forwarded-For` hop when trusted, else the peer.
fn client_ip(
    trust_proxy_headers: bool,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> String {
    if trust_proxy_headers {
        let forwarded = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty());
        if let Some(ip) = forwarded {
            return ip;
        }
    }

    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<K: header::AsHeaderName>(headers: &HeaderMap, key: K) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
