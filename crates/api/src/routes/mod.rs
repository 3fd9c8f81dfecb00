use std::time::Duration;

use axum::extract::ws::{self, CloseFrame, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Extension, Path, Query, State};
use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use validator::Validate;

use parley_domain::conversations::ConversationSummary;
use parley_domain::error::DomainError;
use parley_domain::identity::ActorIdentity;
use parley_domain::messages::{Message, build_thread_page};
use parley_domain::util::uuid_v7_without_dashes;

use crate::middleware::AuthContext;
use crate::realtime::{ClientEvent, EventSender, ServerEvent, error_kind};
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/conversations", get(list_conversations))
        .route(
            "/v1/conversations/:other_user_id/messages",
            get(fetch_thread),
        )
        .route("/v1/messages", post(send_message))
        .route("/v1/messages/:message_id/read", post(mark_message_read))
        .route("/v1/presence/online", get(list_online_users))
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/v1/chat/ws", get(chat_websocket))
        .merge(protected)
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ))
        .layer(middleware::from_fn(app_middleware::metrics_layer));

    if !state.config.app_env.eq_ignore_ascii_case("test") {
        app = app.layer(app_middleware::rate_limit_layer());
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
    })
}

async fn render_metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => ApiError::Internal.into_response(),
    }
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let actor = actor_identity(&auth)?;
    let summaries = state
        .conversations
        .list(&actor.user_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(summaries))
}

#[derive(Debug, Deserialize)]
struct ThreadQuery {
    limit: Option<usize>,
    before_ms: Option<i64>,
}

async fn fetch_thread(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(other_user_id): Path<String>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let actor = actor_identity(&auth)?;
    let page = build_thread_page(query.limit, query.before_ms);
    let thread = state
        .messages
        .fetch_thread(&actor, &other_user_id, page)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(thread))
}

#[derive(Debug, Deserialize, Validate)]
struct SendMessageRequest {
    #[validate(length(min = 1, max = 128))]
    receiver_id: String,
    #[validate(length(min = 1, max = 2_000))]
    content: String,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let message = state
        .realtime
        .send_message(&actor, &payload.receiver_id, &payload.content)
        .await
        .map_err(map_domain_error)?;
    Ok((StatusCode::CREATED, Json(message)).into_response())
}

async fn mark_message_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(message_id): Path<String>,
) -> Result<Json<Message>, ApiError> {
    let actor = actor_identity(&auth)?;
    let message = state
        .messages
        .mark_read(&actor, &message_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(message))
}

#[derive(Serialize)]
struct OnlineUsersResponse {
    users: Vec<String>,
}

async fn list_online_users(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<OnlineUsersResponse>, ApiError> {
    let actor = actor_identity(&auth)?;
    let users = state.presence.list_online(Some(&actor.user_id)).await;
    Ok(Json(OnlineUsersResponse { users }))
}

async fn chat_websocket(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let preauth = actor_identity(&auth).ok();
    upgrade.on_upgrade(move |socket| handle_chat_socket(socket, state, preauth))
}

/// Per-connection loop: Connecting until authenticated (either on the
/// upgrade request or by an in-band `authenticate` event within the
/// handshake timeout), then registered with the gateway until the transport
/// closes. A connection that never authenticates is closed without touching
/// the presence registry.
async fn handle_chat_socket(socket: WebSocket, state: AppState, preauth: Option<ActorIdentity>) {
    let (mut sink, mut incoming) = socket.split();

    let actor = match preauth {
        Some(actor) => actor,
        None => {
            let handshake_timeout = Duration::from_millis(state.config.auth_handshake_timeout_ms);
            match timeout(handshake_timeout, await_handshake(&state, &mut incoming)).await {
                Ok(Some(actor)) => actor,
                Ok(None) | Err(_) => {
                    reject_unauthenticated(&mut sink).await;
                    return;
                }
            }
        }
    };

    let connection_id = uuid_v7_without_dashes();
    let (tx, mut outbound) = mpsc::unbounded_channel();
    state
        .realtime
        .register(&actor.user_id, &connection_id, tx.clone())
        .await;
    tracing::info!(
        user_id = %actor.user_id,
        connection_id = %connection_id,
        "chat connection authenticated"
    );

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            event = outbound.recv() => {
                match event {
                    Some(event) => {
                        if sink.send(ws::Message::Text(event_payload(&event))).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = incoming.next() => {
                match frame {
                    Some(Ok(ws::Message::Text(text))) => {
                        handle_client_event(&state, &actor, &tx, &text).await;
                    }
                    Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(ws::Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state
        .realtime
        .deregister(&actor.user_id, &connection_id)
        .await;
    tracing::debug!(
        user_id = %actor.user_id,
        connection_id = %connection_id,
        "chat connection closed"
    );
}

async fn await_handshake(
    state: &AppState,
    incoming: &mut SplitStream<WebSocket>,
) -> Option<ActorIdentity> {
    while let Some(frame) = incoming.next().await {
        let text = match frame {
            Ok(ws::Message::Text(text)) => text,
            Ok(ws::Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        return match serde_json::from_str::<ClientEvent>(&text) {
            Ok(ClientEvent::Authenticate { token }) => {
                let claims = app_middleware::decode_claims(&state.config.jwt_secret, &token)?;
                let user_ref = app_middleware::user_ref_from_claims(&claims);
                if let Err(err) = state.directory.record(&user_ref).await {
                    tracing::warn!(error = %err, "failed to record user snapshot");
                }
                Some(ActorIdentity {
                    user_id: user_ref.user_id,
                    username: user_ref.username,
                })
            }
            _ => None,
        };
    }
    None
}

async fn reject_unauthenticated(sink: &mut SplitSink<WebSocket, ws::Message>) {
    let event = ServerEvent::ChatError {
        kind: "unauthorized".to_string(),
        message: "authentication required".to_string(),
    };
    let _ = sink.send(ws::Message::Text(event_payload(&event))).await;
    let _ = sink
        .send(ws::Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication required".into(),
        })))
        .await;
}

async fn handle_client_event(
    state: &AppState,
    actor: &ActorIdentity,
    tx: &EventSender,
    text: &str,
) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::SendMessage {
            receiver_id,
            content,
        }) => {
            if let Err(err) = state
                .realtime
                .send_message(actor, &receiver_id, &content)
                .await
            {
                let _ = tx.send(ServerEvent::ChatError {
                    kind: error_kind(&err).to_string(),
                    message: err.to_string(),
                });
            }
        }
        Ok(ClientEvent::Authenticate { .. }) => {
            tracing::debug!("ignoring authenticate on an established connection");
        }
        Err(err) => {
            let _ = tx.send(ServerEvent::ChatError {
                kind: "protocol_error".to_string(),
                message: format!("unrecognized client event: {err}"),
            });
        }
    }
}

fn event_payload(event: &ServerEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| {
        "{\"event_type\":\"chatError\",\"kind\":\"internal_error\",\"message\":\"failed to serialize event\"}"
            .to_string()
    })
}

fn actor_identity(auth: &AuthContext) -> Result<ActorIdentity, ApiError> {
    let user_id = auth
        .user_id
        .as_ref()
        .filter(|user_id| !user_id.trim().is_empty())
        .ok_or(ApiError::Unauthorized)?;
    Ok(ActorIdentity {
        user_id: user_id.to_string(),
        username: auth
            .username
            .clone()
            .unwrap_or_else(|| user_id.to_string()),
    })
}

fn map_domain_error(err: DomainError) -> ApiError {
    match err {
        DomainError::Validation(message) => ApiError::Validation(message),
        DomainError::NotFound => ApiError::NotFound,
        DomainError::Storage(message) => ApiError::Storage(message),
    }
}
