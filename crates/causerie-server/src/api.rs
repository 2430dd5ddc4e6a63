use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::Method,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use causerie_net::ClientFrame;
use causerie_shared::constants::WS_PATH;
use causerie_shared::UserId;

use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::error::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            broker: Arc::new(Broker::new(config.instance_name.clone())),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/test", get(health_check))
        .route("/api/users", get(list_users))
        .route("/api/users/:name", get(user_status))
        .route(WS_PATH, get(websocket_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "Server is running!"
}

#[derive(Serialize)]
struct UsersResponse {
    users: Vec<UserId>,
}

async fn list_users(State(state): State<AppState>) -> Json<UsersResponse> {
    Json(UsersResponse {
        users: state.broker.active_users().await,
    })
}

#[derive(Serialize)]
struct UserStatusResponse {
    name: UserId,
    online: bool,
}

async fn user_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<UserStatusResponse>, ServerError> {
    let user = UserId::parse(&name).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    if !state.broker.is_active(&user).await {
        return Err(ServerError::UserNotFound(user.to_string()));
    }
    Ok(Json(UserStatusResponse {
        name: user,
        online: true,
    }))
}

async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.broker))
}

async fn handle_socket(socket: WebSocket, broker: Arc<Broker>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (conn, mut outbox) = broker.register().await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match ClientFrame::decode(&text) {
                Ok(frame) => {
                    if !broker.handle_frame(conn, frame).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!(conn = %conn, error = %e, "Undecodable frame");
                    broker.report_error(conn, format!("Malformed frame: {e}")).await;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // Dropping the outbox sender ends the writer
    broker.disconnect(conn).await;
    let _ = writer.await;
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Starting chat broker");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Bind `config.http_addr` and serve in the background. Returns the bound
/// address, which differs from the configured one when port 0 was asked for.
pub async fn spawn(
    config: ServerConfig,
) -> anyhow::Result<(SocketAddr, JoinHandle<anyhow::Result<()>>)> {
    let listener = TcpListener::bind(config.http_addr).await?;
    let addr = listener.local_addr()?;
    let app = build_router(AppState::new(config));
    info!(addr = %addr, "Starting chat broker");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await?;
        Ok(())
    });
    Ok((addr, handle))
}
