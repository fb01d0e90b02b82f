use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use feed_api::{ApiContext, FeedError, Session};
use realtime::{user_channel, SignalHub, FEED_CHANNEL};
use shared::{
    domain::{FeedFilter, MessageId, MessageRecord},
    error::{ApiError, ErrorCode},
    protocol::{
        EditMessageRequest, FollowRequest, FollowResponse, LikeRequest, LikeResponse,
        MessageListResponse, NotificationsResponse, PostMessageRequest, ReconcileRequest,
        ReconcileResponse, SeenRequest, SessionRequest, SessionResponse,
    },
};
use storage::Storage;

mod config;

use config::{load_settings, prepare_database_url};

struct AppState {
    api: ApiContext,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    session_id: Uuid,
    filter: Option<String>,
    limit: Option<u32>,
}

type Rejection = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let api = ApiContext {
        storage,
        signals: SignalHub::new(settings.signal_capacity),
        queue_cap: settings.queue_cap,
    };
    let state = AppState {
        api,
        sessions: Mutex::new(HashMap::new()),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/session", post(open_session))
        .route("/follow", post(follow))
        .route("/reconcile", post(reconcile))
        .route("/messages", post(post_message).get(list_messages))
        .route(
            "/messages/:message_id",
            put(edit_message).delete(delete_message),
        )
        .route("/messages/:message_id/like", post(like_message))
        .route("/notifications", get(notifications))
        .route("/notifications/seen", post(mark_seen))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Single top-level mapping from operation failures to responses. Every
/// handler funnels errors here so nothing fails silently.
fn reject(err: FeedError) -> Rejection {
    let status = match err.code() {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!(error = %err, "operation failed");
    (status, Json(ApiError::from(err)))
}

fn unknown_session() -> Rejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new(ErrorCode::Unauthorized, "unknown session")),
    )
}

/// Clones the session snapshot out of the registry so the operation runs
/// without holding the lock: operations sharing a record stay concurrent,
/// and the record-level last-write-wins semantics apply unchanged.
async fn session_snapshot(state: &AppState, session_id: Uuid) -> Result<Session, Rejection> {
    state
        .sessions
        .lock()
        .await
        .get(&session_id)
        .cloned()
        .ok_or_else(unknown_session)
}

async fn store_session(state: &AppState, session_id: Uuid, session: Session) {
    state.sessions.lock().await.insert(session_id, session);
}

fn parse_filter(raw: Option<&str>, session: &Session) -> Result<FeedFilter, Rejection> {
    match raw {
        None | Some("all") => Ok(FeedFilter::All),
        Some("mine") => Ok(FeedFilter::Mine(session.email.clone())),
        Some(_) => Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                ErrorCode::Validation,
                "filter must be 'all' or 'mine'",
            )),
        )),
    }
}

async fn open_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, Rejection> {
    let session = feed_api::bootstrap_session(&state.api, &req.email)
        .await
        .map_err(reject)?;
    let session_id = Uuid::new_v4();
    let user = session.user.clone();
    store_session(&state, session_id, session).await;
    Ok(Json(SessionResponse { session_id, user }))
}

async fn follow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FollowRequest>,
) -> Result<Json<FollowResponse>, Rejection> {
    let mut session = session_snapshot(&state, req.session_id).await?;
    let outcome = feed_api::follow_toggle(&state.api, &mut session, &req.target)
        .await
        .map_err(reject)?;
    let following = session.user.following.clone();
    store_session(&state, req.session_id, session).await;
    Ok(Json(FollowResponse { outcome, following }))
}

async fn reconcile(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<ReconcileResponse>, Rejection> {
    let repaired = feed_api::reconcile_follow_links(&state.api, &req.email)
        .await
        .map_err(reject)?;
    Ok(Json(ReconcileResponse { repaired }))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Json<MessageRecord>, Rejection> {
    let session = session_snapshot(&state, req.session_id).await?;
    let record = feed_api::post_message(&state.api, &session, &req.content)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<MessageListResponse>, Rejection> {
    let session = session_snapshot(&state, q.session_id).await?;
    let filter = parse_filter(q.filter.as_deref(), &session)?;
    let limit = q.limit.unwrap_or(100).clamp(1, 100);
    let messages = feed_api::list_feed(&state.api, &filter, limit)
        .await
        .map_err(reject)?;
    Ok(Json(MessageListResponse { messages }))
}

async fn edit_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessageRecord>, Rejection> {
    let session = session_snapshot(&state, req.session_id).await?;
    let record = feed_api::edit_message(&state.api, &session, MessageId(message_id), &req.content)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
    Query(q): Query<SessionQuery>,
) -> Result<StatusCode, Rejection> {
    let session = session_snapshot(&state, q.session_id).await?;
    feed_api::delete_message(&state.api, &session, MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn like_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<LikeRequest>,
) -> Result<Json<LikeResponse>, Rejection> {
    let session = session_snapshot(&state, req.session_id).await?;
    let (outcome, record) = feed_api::like_toggle(&state.api, &session, MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(Json(LikeResponse {
        outcome,
        likes: record.likes,
    }))
}

async fn notifications(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionQuery>,
) -> Result<Json<NotificationsResponse>, Rejection> {
    let mut session = session_snapshot(&state, q.session_id).await?;
    feed_api::refresh_notifications(&state.api, &mut session)
        .await
        .map_err(reject)?;
    let response = NotificationsResponse {
        queue: session.notifications.queue.clone(),
        unseen: session.unseen_count(),
    };
    store_session(&state, q.session_id, session).await;
    Ok(Json(response))
}

async fn mark_seen(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SeenRequest>,
) -> Result<StatusCode, Rejection> {
    let mut session = session_snapshot(&state, req.session_id).await?;
    feed_api::mark_all_seen(&state.api, &mut session)
        .await
        .map_err(reject)?;
    store_session(&state, req.session_id, session).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionQuery>,
) -> Result<impl IntoResponse, Rejection> {
    let session = session_snapshot(&state, q.session_id).await?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, session.email)))
}

/// Forwards payload-free signals for the shared feed channel and the
/// session identity's own channel. Clients re-fetch state on each frame.
async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket, email: String) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::broadcast::error::RecvError;

    let (mut sender, mut receiver) = socket.split();
    let mut signals = state.api.signals.subscribe();
    let personal = user_channel(&email);

    let send_task = tokio::spawn(async move {
        loop {
            match signals.recv().await {
                Ok(signal) => {
                    if signal.channel != FEED_CHANNEL && signal.channel != personal {
                        continue;
                    }
                    if sender.send(Message::Text(signal.channel)).await.is_err() {
                        break;
                    }
                }
                // Missed signals are recovered by the next re-fetch.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}
