//! HTTP and WebSocket surface.
//!
//! Tenant routes authenticate with `Authorization: Bearer <api-token>`;
//! every storage access then runs inside that tenant's scope, so handlers
//! cannot read or write another tenant's rows. Webhook routes authenticate
//! with the shared secret instead and run privileged.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::config::WebhookSettings;
use crate::errors::{DispatchError, ReconcileError};
use crate::events::EventHub;
use crate::generate::Dispatcher;
use crate::reconcile::poll::Poller;
use crate::reconcile::webhook::{self, WebhookPayload};
use crate::reconcile::Reconciler;
use crate::store::{DbHandle, DocumentKind, IdeaDetail, Tenant};

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub db: DbHandle,
    pub hub: Arc<EventHub>,
    pub dispatcher: Arc<Dispatcher>,
    pub poller: Arc<Poller>,
    pub reconciler: Arc<Reconciler>,
    pub webhook: WebhookSettings,
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ideas", post(create_idea))
        .route("/api/ideas/{id}", get(get_idea))
        .route("/api/ideas/{id}/generate", post(generate_document))
        .route("/api/ideas/{id}/documents/{kind}", get(get_document))
        .route("/api/jobs/{id}", get(get_job))
        .route("/webhooks/generation", post(ingest_webhook))
        .route("/webhooks/generation/{kind}", post(ingest_webhook_for_kind))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ── Errors ───────────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Internal(e) => {
                tracing::error!(error = %format!("{e:#}"), "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::IdeaNotFound { id } => Self::NotFound(format!("Idea {id} not found")),
            DispatchError::Other(e) => Self::Internal(e),
        }
    }
}

// ── Authentication ───────────────────────────────────────────────────

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Tenant, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?
        .to_string();
    let tenant = state
        .db
        .call(move |db| db.tenant_by_token(&token))
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok(tenant)
}

fn parse_kind(kind: &str) -> Result<DocumentKind, ApiError> {
    kind.parse()
        .map_err(|_| ApiError::BadRequest(format!("Unknown document kind: {kind}")))
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct CreateIdeaRequest {
    title: String,
    #[serde(default)]
    description: String,
}

async fn create_idea(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateIdeaRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    if body.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Title must not be empty".to_string()));
    }
    let idea = state
        .db
        .call(move |db| {
            db.with_tenant_scope(tenant.id, |scope| {
                scope.create_idea(body.title.trim(), &body.description)
            })
        })
        .await?;
    Ok((StatusCode::CREATED, Json(idea)))
}

async fn get_idea(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<IdeaDetail>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let detail = state
        .db
        .call(move |db| {
            db.with_tenant_scope(tenant.id, |scope| {
                let idea = match scope.idea(id)? {
                    Some(idea) => idea,
                    None => return Ok(None),
                };
                let documents = scope.documents(id)?;
                let latest_job = scope.latest_job(id, None)?;
                Ok(Some(IdeaDetail {
                    idea,
                    documents,
                    latest_job,
                }))
            })
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Idea {id} not found")))?;
    Ok(Json(detail))
}

#[derive(Deserialize)]
struct GenerateRequest {
    kind: String,
    #[serde(default)]
    instructions: String,
}

async fn generate_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let kind = parse_kind(&body.kind)?;
    let job = state
        .dispatcher
        .dispatch(tenant.id, id, kind, body.instructions)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Reads of a generating document double as the pull-side reconciliation
/// trigger: the poller consults the external record store before answering.
async fn get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, kind)): Path<(i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let kind = parse_kind(&kind)?;
    let document = state
        .poller
        .refresh(tenant.id, id, kind)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No {} document for idea {id}", kind.as_str())))?;
    Ok(Json(document))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let lookup_id = id.clone();
    let job = state
        .db
        .call(move |db| db.with_tenant_scope(tenant.id, |scope| scope.job(&lookup_id)))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {id} not found")))?;
    Ok(Json(job))
}

// ── Webhooks ─────────────────────────────────────────────────────────

async fn ingest_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> Result<Response, ApiError> {
    ingest(state, headers, payload, None).await
}

async fn ingest_webhook_for_kind(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    Json(payload): Json<WebhookPayload>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    ingest(state, headers, payload, Some(kind)).await
}

async fn ingest(
    state: AppState,
    headers: HeaderMap,
    payload: WebhookPayload,
    kind_hint: Option<DocumentKind>,
) -> Result<Response, ApiError> {
    if !webhook::authorize(&state.webhook, &headers) {
        return Err(ApiError::Unauthorized);
    }
    let outcome = match webhook::outcome_from_payload(payload, kind_hint) {
        Ok(outcome) => outcome,
        Err(e @ (ReconcileError::MissingSubject | ReconcileError::MissingKind)) => {
            return Err(ApiError::BadRequest(e.to_string()));
        }
        Err(e) => return Err(ApiError::Internal(e.into())),
    };

    match state.reconciler.apply(outcome).await {
        Ok(_) => Ok(Json(json!({ "status": "ok" })).into_response()),
        // An unmatched result is acknowledged so the generator stops
        // retrying; there is nothing to reconcile it against.
        Err(ReconcileError::NoMatchingDocument { idea_id, kind }) => {
            tracing::warn!(idea_id, kind = %kind, "Webhook result matched no document");
            Ok(Json(json!({ "status": "ignored" })).into_response())
        }
        Err(e) => Err(ApiError::Internal(e.into())),
    }
}

// ── WebSocket ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubscribeFrame {
    action: String,
    channel: String,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, tenant)))
}

/// Waits for a subscribe frame, checks the tenant owns the job, then
/// forwards the job's events until the client goes away.
async fn handle_socket(mut socket: WebSocket, state: AppState, tenant: Tenant) {
    let job_id = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let frame: SubscribeFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        let _ = socket
                            .send(Message::Text(
                                json!({ "error": "Malformed subscribe frame" }).to_string().into(),
                            ))
                            .await;
                        continue;
                    }
                };
                if frame.action != "subscribe" {
                    continue;
                }
                let Some(job_id) = frame.channel.strip_prefix("job:").map(String::from) else {
                    let _ = socket
                        .send(Message::Text(
                            json!({ "error": "Unknown channel" }).to_string().into(),
                        ))
                        .await;
                    continue;
                };
                break job_id;
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = socket.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(_)) => return,
        }
    };

    // Ownership check runs in the tenant's scope: a foreign job id looks
    // exactly like a missing one.
    let lookup_id = job_id.clone();
    let owned = state
        .db
        .call(move |db| db.with_tenant_scope(tenant.id, |scope| scope.job(&lookup_id)))
        .await;
    match owned {
        Ok(Some(_)) => {}
        _ => {
            let _ = socket
                .send(Message::Text(
                    json!({ "error": "Unknown job" }).to_string().into(),
                ))
                .await;
            return;
        }
    }

    let rx = state.hub.subscribe(&job_id);
    let ack = json!({ "type": "subscribed", "channel": format!("job:{job_id}") });
    if socket.send(Message::Text(ack.to_string().into())).await.is_err() {
        return;
    }
    run_socket_loop(socket, rx).await;
}

/// Forward broadcast frames to the client with a ping/pong keepalive. A
/// lagged receiver skips ahead rather than closing: missed events are
/// recoverable through the REST polling path.
async fn run_socket_loop(socket: WebSocket, mut rx: tokio::sync::broadcast::Receiver<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(frame) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "WebSocket subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Pong(_))) => last_pong = tokio::time::Instant::now(),
                Some(Ok(Message::Ping(payload))) => {
                    if sender.send(Message::Pong(payload)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            },
            _ = ping.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!("WebSocket client missed pong deadline");
                    return;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileSettings;
    use crate::generate::{GenerationRequest, GeneratorAck, GeneratorTransport};
    use crate::reconcile::poll::{ExternalRecord, RecordFetcher};
    use crate::store::StudioDb;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NullTransport;

    #[async_trait]
    impl GeneratorTransport for NullTransport {
        async fn invoke(&self, _request: &GenerationRequest) -> anyhow::Result<GeneratorAck> {
            Ok(GeneratorAck {
                body: r#"{"id": "ext-1"}"#.to_string(),
            })
        }
    }

    struct NullFetcher;

    #[async_trait]
    impl RecordFetcher for NullFetcher {
        async fn fetch(&self, _external_id: &str) -> anyhow::Result<Option<ExternalRecord>> {
            Ok(None)
        }
    }

    async fn test_state() -> (AppState, Tenant) {
        let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
        let tenant = db
            .call(|db| db.create_tenant("acme", "tok-1"))
            .await
            .unwrap();
        let hub = Arc::new(EventHub::new());
        let reconcile = ReconcileSettings::default();
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            hub.clone(),
            Arc::new(NullTransport),
        ));
        let reconciler = Arc::new(Reconciler::new(db.clone(), hub.clone()));
        let poller = Arc::new(Poller::new(
            db.clone(),
            Arc::new(NullFetcher),
            Reconciler::new(db.clone(), hub.clone()),
            reconcile.poll_dwell_secs,
        ));
        let state = AppState {
            db,
            hub,
            dispatcher,
            poller,
            reconciler,
            webhook: WebhookSettings {
                secret: Some("shh".to_string()),
                basic_user: None,
                basic_pass: None,
            },
        };
        (state, tenant)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = test_state().await;
        let response = api_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_unauthorized() {
        let (state, _) = test_state().await;
        let response = api_router(state)
            .oneshot(
                Request::post("/api/ideas")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title": "Meal kit"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_and_fetch_idea() {
        let (state, _) = test_state().await;
        let router = api_router(state);

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/ideas")
                    .header("authorization", "Bearer tok-1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title": "Meal kit", "description": "boxes"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let idea = body_json(response).await;
        let id = idea["id"].as_i64().unwrap();

        let response = router
            .oneshot(
                Request::get(format!("/api/ideas/{id}"))
                    .header("authorization", "Bearer tok-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail = body_json(response).await;
        assert_eq!(detail["idea"]["title"], "Meal kit");
        assert!(detail["documents"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_title_rejected() {
        let (state, _) = test_state().await;
        let response = api_router(state)
            .oneshot(
                Request::post("/api/ideas")
                    .header("authorization", "Bearer tok-1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let (state, tenant) = test_state().await;
        let idea = state
            .db
            .call({
                let tenant_id = tenant.id;
                move |db| db.with_tenant_scope(tenant_id, |s| s.create_idea("Meal kit", ""))
            })
            .await
            .unwrap();
        let response = api_router(state)
            .oneshot(
                Request::post(format!("/api/ideas/{}/generate", idea.id))
                    .header("authorization", "Bearer tok-1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"kind": "haiku"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generate_returns_accepted_job() {
        let (state, tenant) = test_state().await;
        let idea = state
            .db
            .call({
                let tenant_id = tenant.id;
                move |db| db.with_tenant_scope(tenant_id, |s| s.create_idea("Meal kit", ""))
            })
            .await
            .unwrap();
        let response = api_router(state)
            .oneshot(
                Request::post(format!("/api/ideas/{}/generate", idea.id))
                    .header("authorization", "Bearer tok-1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"kind": "lean_canvas"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job = body_json(response).await;
        assert_eq!(job["status"], "processing");
        assert_eq!(job["kind"], "lean_canvas");
    }

    #[tokio::test]
    async fn test_generate_unknown_idea_is_404() {
        let (state, _) = test_state().await;
        let response = api_router(state)
            .oneshot(
                Request::post("/api/ideas/9999/generate")
                    .header("authorization", "Bearer tok-1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"kind": "lean_canvas"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_requires_secret() {
        let (state, _) = test_state().await;
        let response = api_router(state)
            .oneshot(
                Request::post("/webhooks/generation")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"idea_id": 1, "kind": "lean_canvas"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_missing_idea_id_is_400() {
        let (state, _) = test_state().await;
        let response = api_router(state)
            .oneshot(
                Request::post("/webhooks/generation")
                    .header("x-webhook-secret", "shh")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"kind": "lean_canvas"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_unmatched_result_is_acknowledged() {
        let (state, _) = test_state().await;
        let response = api_router(state)
            .oneshot(
                Request::post("/webhooks/generation")
                    .header("x-webhook-secret", "shh")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"idea_id": 404, "kind": "lean_canvas"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ignored");
    }

    #[tokio::test]
    async fn test_job_lookup_is_tenant_scoped() {
        let (state, tenant) = test_state().await;
        state
            .db
            .call(|db| db.create_tenant("rival", "tok-2"))
            .await
            .unwrap();
        let job = state
            .db
            .call({
                let tenant_id = tenant.id;
                move |db| {
                    db.with_tenant_scope(tenant_id, |s| {
                        let idea = s.create_idea("Meal kit", "")?;
                        s.create_job(idea.id, DocumentKind::LeanCanvas)
                    })
                }
            })
            .await
            .unwrap();

        let router = api_router(state);
        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/api/jobs/{}", job.id))
                    .header("authorization", "Bearer tok-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Same id through the rival tenant's token: indistinguishable from
        // a job that does not exist.
        let response = router
            .oneshot(
                Request::get(format!("/api/jobs/{}", job.id))
                    .header("authorization", "Bearer tok-2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
