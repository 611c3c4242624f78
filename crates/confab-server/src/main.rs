use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use confab_api::middleware::{require_auth, validate_token};
use confab_api::state::{AppState, AppStateInner};
use confab_api::{conversations, friends, messages, settings};
use confab_gateway::connection;
use confab_gateway::dispatcher::Dispatcher;
use confab_gateway::presence::PresenceRegistry;
use confab_retention::{EXPIRY_SWEEP_SECS, ORPHAN_SWEEP_SECS};
use confab_storage::BlobStore;
use confab_types::models::MAX_MEDIA_BYTES;

/// Multipart framing overhead on top of the media cap.
const BODY_LIMIT: usize = MAX_MEDIA_BYTES + 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("CONFAB_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("CONFAB_DB_PATH").unwrap_or_else(|_| "confab.db".into());
    let media_dir = std::env::var("CONFAB_MEDIA_DIR").unwrap_or_else(|_| "media".into());
    let host = std::env::var("CONFAB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CONFAB_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database and blob store
    let db = Arc::new(confab_db::Database::open(&PathBuf::from(&db_path))?);
    let store = Arc::new(BlobStore::new(PathBuf::from(&media_dir)).await?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let presence = PresenceRegistry::new(db.clone());
    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        store: store.clone(),
        dispatcher: dispatcher.clone(),
        presence,
        jwt_secret,
    });

    // Background sweeps
    tokio::spawn(confab_retention::run_expiry_loop(
        db.clone(),
        store.clone(),
        EXPIRY_SWEEP_SECS,
    ));
    tokio::spawn(confab_retention::run_orphan_loop(db, ORPHAN_SWEEP_SECS));

    // Routes
    let api_routes = Router::new()
        .route("/friends", get(friends::list_friends))
        .route("/friends/requests", post(friends::send_request))
        .route("/friends/requests", get(friends::list_pending))
        .route(
            "/friends/requests/{request_id}/respond",
            post(friends::respond_request),
        )
        .route(
            "/friends/requests/{user_id}",
            delete(friends::cancel_request),
        )
        .route("/friends/{user_id}", delete(friends::unfriend))
        .route("/conversations", post(conversations::start_conversation))
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}/read",
            post(conversations::mark_read),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(messages::send_message),
        )
        .route("/messages/{message_id}/edit", post(messages::edit_message))
        .route(
            "/messages/{message_id}/unsend",
            post(messages::unsend_message),
        )
        .route("/settings/retention", put(settings::update_retention))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    // WebSockets authenticate via query token: browsers cannot set headers
    // on upgrade requests.
    let ws_routes = Router::new()
        .route("/conversations/{conversation_id}/ws", get(room_ws_upgrade))
        .route("/notifications/ws", get(notification_ws_upgrade))
        .with_state(state.clone());

    let app = Router::new()
        .merge(api_routes)
        .merge(ws_routes)
        .nest_service("/media", ServeDir::new(store.dir()))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Confab server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

async fn room_ws_upgrade(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let claims =
        validate_token(&state.jwt_secret, &query.token).ok_or(StatusCode::UNAUTHORIZED)?;

    // Rooms admit participants only.
    let db = state.db.clone();
    let user_id = claims.sub;
    let is_participant =
        tokio::task::spawn_blocking(move || db.is_participant(conversation_id, user_id))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .map_err(|e| {
                error!("Participant check failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
    if !is_participant {
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_room_connection(
            socket,
            state.dispatcher.clone(),
            state.presence.clone(),
            state.db.clone(),
            claims.sub,
            claims.username,
            conversation_id,
        )
    }))
}

async fn notification_ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let claims =
        validate_token(&state.jwt_secret, &query.token).ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_notification_connection(
            socket,
            state.dispatcher.clone(),
            claims.sub,
            claims.username,
        )
    }))
}
