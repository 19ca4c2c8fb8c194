//! HTTP/SSE Surface
//!
//! Thin axum layer over the relay core:
//! - `POST /submit?userId=`: start one upstream call, answer 202 at once
//! - `GET /stream?userId=`: server-sent events for that user's channel
//! - `DELETE /stream?userId=`: tear the channel down
//! - `GET /health`, `GET /stats`, `GET /` (demo page)
//!
//! ```text
//!   browser ──POST /submit──▶ submit() ──relay()──▶ UpstreamRelay (task)
//!                                                        │ emit
//!                                                        ▼
//!   browser ◀──SSE events─── stream() ◀──subscribe── OutputChannel
//!                          (fixed delivery delay)
//! ```
//!
//! The legacy paths `/openai-gpt4-sse-submit` and `/openai-gpt4-sse-stream`
//! are kept as aliases.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use relay_core::{
    config::ServerSettings, PromptTemplate, SinkRegistry, UpstreamRelay, UserId,
};

use crate::display::DisplayEscaper;

const INDEX_HTML: &str = include_str!("../static/index.html");

// =============================================================================
// State
// =============================================================================

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    relay: UpstreamRelay,
    prompt: Arc<PromptTemplate>,
    delivery_interval: Duration,
    keep_alive: Duration,
    escaper: DisplayEscaper,
}

impl AppState {
    /// Bundle the relay with its HTTP settings
    #[must_use]
    pub fn new(relay: UpstreamRelay, prompt: PromptTemplate, settings: &ServerSettings) -> Self {
        Self {
            relay,
            prompt: Arc::new(prompt),
            delivery_interval: settings.delivery_interval,
            keep_alive: settings.keep_alive,
            escaper: DisplayEscaper::new(&settings.display),
        }
    }

    fn registry(&self) -> &SinkRegistry {
        self.relay.registry()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Request-level failures
///
/// Everything after 202 is handled inside the relay; these only cover
/// what can be rejected up front.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing userId query parameter")]
    MissingUser,

    #[error("invalid userId {0:?}")]
    InvalidUser(String),

    #[error("input must not be empty")]
    EmptyInput,

    #[error("no output channel for user {0}")]
    UnknownUser(UserId),

    #[error("relay is shutting down")]
    ShuttingDown,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingUser | Self::InvalidUser(_) | Self::EmptyInput => StatusCode::BAD_REQUEST,
            Self::UnknownUser(_) => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(status = status.as_u16(), error = %self, "Request rejected");
        let body = Json(json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/submit", post(submit))
        .route("/openai-gpt4-sse-submit", post(submit))
        .route("/stream", get(stream).delete(close_stream))
        .route("/openai-gpt4-sse-stream", get(stream))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    #[serde(rename = "userId", alias = "user_id")]
    user_id: Option<String>,
}

impl UserQuery {
    fn resolve(&self) -> Result<UserId, ApiError> {
        let raw = self.user_id.as_deref().ok_or(ApiError::MissingUser)?;
        raw.parse()
            .map_err(|_| ApiError::InvalidUser(raw.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct SubmitAccepted {
    call_id: String,
    user_id: UserId,
}

// =============================================================================
// Handlers
// =============================================================================

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Start one upstream call; the answer arrives on the user's stream
async fn submit(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitAccepted>), ApiError> {
    let user_id = query.resolve()?;
    let input = String::from_utf8_lossy(&body);
    if input.trim().is_empty() {
        return Err(ApiError::EmptyInput);
    }
    if state.relay.is_shut_down() {
        return Err(ApiError::ShuttingDown);
    }

    let handle = state.relay.relay(user_id, state.prompt.build(&input));
    info!(
        user_id = %user_id,
        call_id = %handle.call_id(),
        input_len = input.len(),
        "Submit accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitAccepted {
            call_id: handle.call_id().to_string(),
            user_id,
        }),
    ))
}

/// Attach to the user's channel, creating it on first access
async fn stream(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = query.resolve()?;
    let (channel, fragments) = state.registry().subscribe(user_id);
    info!(
        user_id = %user_id,
        subscribers = channel.subscriber_count(),
        "Stream subscribed"
    );

    let interval = state.delivery_interval;
    let escaper = state.escaper.clone();
    let events = fragments.then(move |fragment| {
        let data = escaper.apply(&fragment);
        async move {
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            Ok(Event::default().data(data))
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

/// Terminate the user's channel and end every open stream on it
async fn close_stream(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<StatusCode, ApiError> {
    let user_id = query.resolve()?;
    match state.registry().remove(&user_id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::UnknownUser(user_id)),
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.relay.is_shut_down() { "shutting_down" } else { "ok" },
        "channels": state.registry().len(),
    }))
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "metrics": state.relay.metrics().snapshot(),
        "registry": state.registry().summary(),
        "pacing": state.relay.config().pacing.as_str(),
    }))
}

// =============================================================================
// Idle Sweeper
// =============================================================================

/// Periodically evict channels nobody has listened to for `idle_after`
pub fn spawn_idle_sweeper(
    registry: SinkRegistry,
    idle_after: Duration,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        info!(
            idle_after_secs = idle_after.as_secs(),
            every_secs = every.as_secs(),
            "Idle sweeper started"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.evict_idle(idle_after);
                    for user_id in evicted {
                        debug!(user_id = %user_id, "Evicted idle channel");
                    }
                }
            }
        }
        debug!("Idle sweeper stopped");
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use pretty_assertions::assert_eq;
    use relay_core::{
        config::DisplaySettings, CompletionBackend, CompletionRequest, FrameStream, PacingPolicy,
        RelayConfig, RelayError,
    };
    use tower::ServiceExt;

    struct ScriptBackend {
        frames: Vec<String>,
    }

    #[async_trait]
    impl CompletionBackend for ScriptBackend {
        fn name(&self) -> &str {
            "script"
        }

        async fn open_stream(
            &self,
            _request: &CompletionRequest,
        ) -> Result<FrameStream, RelayError> {
            Ok(futures::stream::iter(self.frames.clone().into_iter().map(Ok)).boxed())
        }
    }

    fn content(text: &str) -> String {
        json!({"choices": [{"delta": {"content": text}}]}).to_string()
    }

    fn test_state(escape: bool) -> AppState {
        let backend = ScriptBackend {
            frames: vec![
                content("Hi"),
                content(" there"),
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#.to_string(),
                "[DONE]".to_string(),
            ],
        };
        let relay = UpstreamRelay::new(
            Arc::new(backend),
            SinkRegistry::new(),
            RelayConfig {
                pacing: PacingPolicy::Unpaced,
                ..RelayConfig::default()
            },
        );
        let settings = ServerSettings {
            delivery_interval: Duration::ZERO,
            display: DisplaySettings {
                escape_whitespace: escape,
                ..DisplaySettings::default()
            },
            ..ServerSettings::default()
        };
        AppState::new(relay, PromptTemplate::default(), &settings)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: &'static str) -> Request<Body> {
        Request::post(uri).body(Body::from(body)).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(test_state(false))
            .oneshot(get_req("/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["channels"], 0);
    }

    #[tokio::test]
    async fn test_index_page() {
        let response = router(test_state(false))
            .oneshot(get_req("/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("<html"));
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_user() {
        let response = router(test_state(false))
            .oneshot(post("/submit", "Hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], 400);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_user() {
        let response = router(test_state(false))
            .oneshot(post("/submit?userId=not-a-uuid", "Hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_input() {
        let user = UserId::new();
        let response = router(test_state(false))
            .oneshot(post(&format!("/submit?userId={user}"), "  \n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_accepted_on_both_paths() {
        let state = test_state(false);
        let user = UserId::new();

        for path in ["/submit", "/openai-gpt4-sse-submit"] {
            let response = router(state.clone())
                .oneshot(post(&format!("{path}?userId={user}"), "Hello"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            let body = body_json(response).await;
            assert!(body["call_id"].as_str().unwrap().starts_with("call-"));
            assert_eq!(body["user_id"], user.to_string());
        }
    }

    #[tokio::test]
    async fn test_submit_rejected_after_shutdown() {
        let state = test_state(false);
        state.relay.shutdown();
        let user = UserId::new();
        let response = router(state)
            .oneshot(post(&format!("/submit?userId={user}"), "Hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stream_creates_channel() {
        let state = test_state(false);
        let user = UserId::new();

        let response = router(state.clone())
            .oneshot(get_req(&format!("/openai-gpt4-sse-stream?userId={user}")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
        assert!(state.registry().contains(&user));
    }

    #[tokio::test]
    async fn test_submit_then_stream_delivers_fragments() {
        let state = test_state(true);
        let app = router(state.clone());
        let user = UserId::new();

        let response = app
            .clone()
            .oneshot(get_req(&format!("/stream?userId={user}")))
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();

        let submit = app
            .oneshot(post(&format!("/submit?userId={user}"), "Hello"))
            .await
            .unwrap();
        assert_eq!(submit.status(), StatusCode::ACCEPTED);

        let mut text = String::new();
        while !text.contains("&nbsp;there") {
            let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
                .await
                .expect("stream stalled")
                .expect("stream ended")
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }

        let hi = text.find("Hi").unwrap();
        let there = text.find("&nbsp;there").unwrap();
        assert!(hi < there);
        assert!(!text.contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_delete_stream() {
        let state = test_state(false);
        let user = UserId::new();
        state.registry().get_or_create(user);

        let delete = |state: AppState| {
            router(state).oneshot(
                Request::delete(format!("/stream?userId={user}"))
                    .body(Body::empty())
                    .unwrap(),
            )
        };

        assert_eq!(
            delete(state.clone()).await.unwrap().status(),
            StatusCode::NO_CONTENT
        );
        assert!(!state.registry().contains(&user));
        assert_eq!(
            delete(state).await.unwrap().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_stats_reports_metrics_and_registry() {
        let state = test_state(false);
        let user = UserId::new();
        state.registry().get_or_create(user);
        state
            .relay
            .relay(user, PromptTemplate::default().build("Hello"))
            .join()
            .await
            .unwrap();

        let response = router(state).oneshot(get_req("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["metrics"]["calls_completed"], 1);
        assert_eq!(body["metrics"]["errors"]["emission_zero_subscriber"], 2);
        assert_eq!(body["registry"]["channels"], 1);
        assert_eq!(body["pacing"], "none");
        assert!(body["metrics"]["call_latency_ms"]["p99"].is_u64());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_opened_during_sweeps_stays_attached() {
        let state = test_state(false);
        let shutdown = CancellationToken::new();
        let sweeper = spawn_idle_sweeper(
            state.registry().clone(),
            Duration::ZERO,
            Duration::from_millis(1),
            shutdown.clone(),
        );

        let mut bodies = Vec::new();
        for _ in 0..20 {
            let user = UserId::new();
            let response = router(state.clone())
                .oneshot(get_req(&format!("/stream?userId={user}")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            bodies.push((user, response.into_body()));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        for (user, _body) in &bodies {
            let channel = state.registry().get(user).expect("channel evicted");
            assert!(!channel.is_terminated());
            assert_eq!(channel.subscriber_count(), 1);
        }

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_sweeper_evicts_and_stops() {
        let registry = SinkRegistry::new();
        registry.get_or_create(UserId::new());
        let kept = registry.get_or_create(UserId::new());
        let _listener = kept.subscribe();

        let shutdown = CancellationToken::new();
        let sweeper = spawn_idle_sweeper(
            registry.clone(),
            Duration::ZERO,
            Duration::from_millis(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&kept.user_id()));

        shutdown.cancel();
        sweeper.await.unwrap();
    }
}
