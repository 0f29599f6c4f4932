//! MCP over HTTP.
//!
//! Two transports share one endpoint. Legacy clients open `GET /mcp`, receive an
//! `endpoint` event naming `/mcp?sessionId=...`, and POST there; while their stream is
//! open, replies travel over it and the POST itself is answered with `202`. Stateless
//! clients just POST and read the reply from the body, echoing `Mcp-Session-Id` to keep
//! their session binding.

pub mod dispatch;
pub mod rpc;
pub mod tools;

use std::{convert::Infallible, time::Duration};

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Query, State},
    http::{
        header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, HOST},
        request::Parts,
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{auth::sessions, notify::Hub, AppResult, AppState, Config};

use self::rpc::{Reply, RequestContext};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const API_KEY_HEADER: &str = "x-mcp-api-key";

const KEEP_ALIVE: Duration = Duration::from_secs(30);

pub fn router() -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            ACCEPT,
            CACHE_CONTROL,
            HeaderName::from_static(API_KEY_HEADER),
            HeaderName::from_static(SESSION_HEADER),
        ])
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);

    Router::new()
        .route("/mcp", get(open_stream).post(post_message).delete(close_session))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Session and credentials carried by a request.
#[derive(Debug, Clone)]
pub struct McpSession {
    pub id: String,
    /// The request addressed a legacy stream endpoint (`?sessionId=`).
    pub legacy: bool,
    pub api_key: Option<String>,
}

impl<S> FromRequestParts<S> for McpSession
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts.headers.get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| sessions::is_valid_session_id(id))
            .map(str::to_owned);
        let from_query = Query::<SessionQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.session_id)
            .filter(|id| sessions::is_valid_session_id(id));
        let legacy = from_query.is_some();

        let id = match from_header.or(from_query) {
            Some(id) => id,
            None => {
                let id = sessions::new_session_id();
                tracing::debug!(session = %id, "new session");
                id
            }
        };

        Ok(McpSession { id, legacy, api_key: api_key(&parts.headers) })
    }
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    let explicit = headers.get(API_KEY_HEADER).and_then(|value| value.to_str().ok());
    let bearer = headers.get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim_start().split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token);
    explicit.or(bearer)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
}

fn with_session(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn base_url(config: &Config, headers: &HeaderMap) -> String {
    if let Some(public_url) = &config.public_url {
        return public_url.clone();
    }
    let Some(host) = headers.get(HOST).and_then(|value| value.to_str().ok()) else {
        return String::new();
    };
    let scheme = headers.get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    format!("{scheme}://{host}")
}

async fn open_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    session: McpSession,
) -> Response {
    let endpoint = format!("{}/mcp?sessionId={}", base_url(&state.config, &headers), session.id);
    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });

    if !state.config.streams {
        return with_session(Sse::new(first).into_response(), &session.id);
    }

    let (guard, rx) = state.hub.attach(&session.id);
    tracing::info!(session = %session.id, streams = state.hub.len(), "stream opened");

    // the guard rides along with the stream and detaches the sink when the client goes away
    let frames = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame = rx.recv().await?;
        let event = Event::default().event("message").data(frame.to_string());
        Some((Ok::<_, Infallible>(event), (rx, guard)))
    });

    let sse = Sse::new(first.chain(frames).boxed())
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE));
    with_session(sse.into_response(), &session.id)
}

/// Pushes a reply over the session's live stream if the request came in on the legacy
/// transport. Hands the reply back when it has to go in the response body instead.
fn deliver(hub: &Hub, session: &McpSession, reply: Value) -> Option<Value> {
    if session.legacy && hub.is_attached(&session.id) && hub.push(&session.id, reply.clone()) {
        return None;
    }
    Some(reply)
}

async fn post_message(
    State(state): State<AppState>,
    session: McpSession,
    body: Bytes,
) -> Response {
    let ctx = RequestContext {
        session_id: &session.id,
        api_key: session.api_key.as_deref(),
    };

    let response = match rpc::handle_body(&state, ctx, &body).await {
        Reply::ParseError(error) => (StatusCode::BAD_REQUEST, Json(error)).into_response(),
        Reply::Nothing => StatusCode::ACCEPTED.into_response(),
        Reply::Message(reply) => match deliver(&state.hub, &session, reply) {
            Some(reply) => Json(reply).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
    };
    with_session(response, &session.id)
}

async fn close_session(
    State(state): State<AppState>,
    session: McpSession,
) -> AppResult<Response> {
    let detached = state.hub.detach(&session.id);
    let unbound = sessions::unbind(&state.db_pool, &session.id).await?;
    tracing::info!(session = %session.id, detached, unbound, "session closed");
    Ok(with_session(StatusCode::NO_CONTENT.into_response(), &session.id))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server": rpc::SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "streams": state.hub.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_comes_from_either_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(api_key(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer smcp_abc"));
        assert_eq!(api_key(&headers).as_deref(), Some("smcp_abc"));

        // the auth scheme is case-insensitive
        for value in ["bearer smcp_abc", "BEARER   smcp_abc"] {
            headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
            assert_eq!(api_key(&headers).as_deref(), Some("smcp_abc"), "{value}");
        }
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic smcp_abc"));
        assert_eq!(api_key(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert_eq!(api_key(&headers), None);

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("smcp_explicit"));
        assert_eq!(api_key(&headers).as_deref(), Some("smcp_explicit"));
    }

    #[test]
    fn endpoint_base_prefers_configured_url() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("localhost:8080"));
        assert_eq!(base_url(&Config::default(), &headers), "http://localhost:8080");

        let config = Config { public_url: Some("https://social.example".into()), ..Config::default() };
        assert_eq!(base_url(&config, &headers), "https://social.example");
    }

    #[test]
    fn replies_only_ride_live_legacy_streams() {
        let hub = Hub::default();
        let legacy = McpSession { id: "s1".into(), legacy: true, api_key: None };
        let stateless = McpSession { legacy: false, ..legacy.clone() };

        assert_eq!(deliver(&hub, &legacy, json!(1)), Some(json!(1)));
        let (_guard, _rx) = hub.attach("s1");
        assert_eq!(deliver(&hub, &stateless, json!(2)), Some(json!(2)));
        assert_eq!(deliver(&hub, &legacy, json!(3)), None);
    }
}
