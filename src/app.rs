//! HTTP application: wires the dynamic GraphQL schema and the Bifrost chunk transport onto one
//! axum `Router`, shared as [AppState] across every handler.
//!
//! Used by [main] and by [HttpServerService](crate::services::http_server::HttpServerService) to
//! build the app once the database and schema services have started.

use std::sync::Arc;

use async_graphql::dynamic::Schema;
use async_graphql::http::GraphiQLSource;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::DbPool;
use crate::error::CoreError;
use crate::services::auth::{self, AuthContext};
use crate::services::ServicesManager;
use crate::transport::{self, BifrostMessage, ChunkSender, MessageKind};

/// Shared state for every HTTP/WS handler in the app.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: DbPool,
    pub schema: Schema,
    pub services: Arc<ServicesManager>,
}

/// Assembles the full router: GraphiQL + POST at `/graphql`, standard GraphQL-over-WebSocket at
/// `/graphql/ws`, the binary chunked transport at `/graphql/stream`, and `/healthz`.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/graphql", get(graphiql).post(graphql_handler))
        .route("/graphql/ws", get(graphql_ws_handler))
        .route("/graphql/stream", get(graphql_stream_handler))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    let health = state.services.health_all().await;
    axum::Json(serde_json::json!(health))
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()).and_then(|h| h.strip_prefix("Bearer ")).map(str::to_string)
}

/// Builds the per-request [AuthContext] from a bearer token, if present. A missing or invalid
/// token never fails the request outright — resolvers that actually require auth call
/// `require_auth` themselves and surface [CoreError::AuthRequired] there.
fn auth_context(config: &Config, headers: &HeaderMap) -> AuthContext {
    let Some(secret) = config.jwt_secret.as_deref() else {
        return AuthContext { user: None, required: false };
    };
    let user = extract_token(headers).and_then(|token| auth::verify_token(&token, secret).ok());
    AuthContext { user, required: true }
}

async fn graphql_handler(State(state): State<AppState>, headers: HeaderMap, req: GraphQLRequest) -> GraphQLResponse {
    let request = req.into_inner().data(auth_context(&state.config, &headers));
    state.schema.execute(request).await.into()
}

async fn graphiql(headers: HeaderMap) -> impl IntoResponse {
    let accepts_html =
        headers.get(axum::http::header::ACCEPT).and_then(|v| v.to_str().ok()).map(|v| v.contains("text/html")).unwrap_or(false);

    if accepts_html {
        axum::response::Html(GraphiQLSource::build().endpoint("/graphql").subscription_endpoint("/graphql/ws").finish()).into_response()
    } else {
        (
            axum::http::StatusCode::METHOD_NOT_ALLOWED,
            axum::Json(serde_json::json!({
                "error": "GET requests are not supported for GraphQL queries. Use POST with Content-Type: application/json"
            })),
        )
            .into_response()
    }
}

async fn graphql_ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    protocol: async_graphql_axum::GraphQLProtocol,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let initial_auth = auth_context(&state.config, &headers);
    let config = state.config.clone();

    ws.protocols(["graphql-transport-ws", "graphql-ws"]).on_upgrade(move |socket| {
        let mut data = async_graphql::Data::default();
        data.insert(initial_auth);

        async_graphql_axum::GraphQLWebSocket::new(socket, state.schema.clone(), protocol)
            .with_data(data)
            .on_connection_init(move |params| {
                let config = config.clone();
                async move {
                    let token = params
                        .get("Authorization")
                        .or_else(|| params.get("authorization"))
                        .and_then(|v| v.as_str())
                        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).to_string());

                    let mut data = async_graphql::Data::default();
                    data.insert(match (&config.jwt_secret, token) {
                        (Some(secret), Some(token)) => {
                            AuthContext { user: auth::verify_token(&token, secret).ok(), required: true }
                        }
                        (Some(_), None) => AuthContext { user: None, required: true },
                        (None, _) => AuthContext { user: None, required: false },
                    });
                    Ok(data)
                }
            })
            .serve()
    })
}

/// Upgrades to the Bifrost binary chunk transport and drives one connection's worth of
/// request/response traffic until the client disconnects.
async fn graphql_stream_handler(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> impl IntoResponse {
    let auth = auth_context(&state.config, &headers);
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = drive_bifrost_connection(socket, state, auth).await {
            tracing::warn!(error = %e, "bifrost connection ended with an error");
        }
    })
}

/// Reads frames off the socket on a dedicated task and forwards them over a channel, so the
/// main loop below can hold the write half exclusively while a chunked send is in flight and
/// still observe ACK/NACK/Resume frames as they arrive.
async fn drive_bifrost_connection(socket: WebSocket, state: AppState, auth: AuthContext) -> Result<(), CoreError> {
    let (mut sink, stream) = socket.split();
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel::<BifrostMessage>();

    let reader = tokio::spawn(async move {
        let mut stream = stream;
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Binary(bytes) => {
                    if let Ok(parsed) = BifrostMessage::decode(&bytes) {
                        if frame_tx.send(parsed).is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    while let Some(parsed) = frame_rx.recv().await {
        if let Ok(MessageKind::Query) = parsed.kind() {
            if let Err(e) = handle_query(&mut sink, &mut frame_rx, &state, &auth, parsed).await {
                send_error(&mut sink, 0, &e).await;
            }
        }
        // A ChunkAck/ChunkNack/Resume with no in-flight send to apply to is simply stale.
    }

    reader.abort();
    Ok(())
}

async fn handle_query(
    sink: &mut SplitSink<WebSocket, Message>,
    frame_rx: &mut UnboundedReceiver<BifrostMessage>,
    state: &AppState,
    auth: &AuthContext,
    parsed: BifrostMessage,
) -> Result<(), CoreError> {
    let request_id = parsed.request_id;
    let variables = if parsed.variables_json.is_empty() {
        async_graphql::Variables::default()
    } else {
        async_graphql::Variables::from_json(serde_json::from_str(&parsed.variables_json).map_err(|e| CoreError::validation(e.to_string()))?)
    };
    let request = async_graphql::Request::new(parsed.query).variables(variables).data(auth.clone());
    let response = state.schema.execute(request).await;
    let payload = serde_json::to_vec(&response).map_err(|e| CoreError::Internal(e.into()))?;

    if !transport::requires_chunking(payload.len(), state.config.chunk_threshold) {
        let msg = BifrostMessage {
            kind: MessageKind::Result as u8,
            request_id,
            chunk_total: 1,
            total_bytes: payload.len() as u64,
            chunk_checksum: crc32fast::hash(&payload),
            payload,
            ..Default::default()
        };
        return sink.send(Message::Binary(msg.encode().into())).await.map_err(|e| CoreError::Internal(e.into()));
    }

    send_chunked(sink, frame_rx, state, request_id, &payload).await
}

/// Splits `payload` into Bifrost chunks and drives the windowed send, reading ACK frames off
/// `frame_rx` concurrently to keep the window moving. NACKs and Resume requests observed during
/// the send are queued and replayed once the bulk send completes and the sink is free again.
async fn send_chunked(
    sink: &mut SplitSink<WebSocket, Message>,
    frame_rx: &mut UnboundedReceiver<BifrostMessage>,
    state: &AppState,
    request_id: u32,
    payload: &[u8],
) -> Result<(), CoreError> {
    let chunks = transport::split(request_id, payload, state.config.chunk_threshold);
    let sender = ChunkSender::new(state.config.chunk_window, state.config.chunk_ttl);

    let mut pending_nacks = Vec::new();
    let mut pending_resumes = Vec::new();

    let result = {
        let send_fut = sender.send_all(sink, chunks);
        tokio::pin!(send_fut);
        loop {
            tokio::select! {
                res = &mut send_fut => break res,
                frame = frame_rx.recv() => {
                    match frame {
                        Some(m) => match m.kind() {
                            Ok(MessageKind::ChunkAck) => sender.ack(m.chunk_sequence),
                            Ok(MessageKind::ChunkNack) => pending_nacks.push(m.chunk_sequence),
                            Ok(MessageKind::Resume) => pending_resumes.push(m.last_sequence),
                            _ => {}
                        },
                        None => break Err(CoreError::Internal(anyhow::anyhow!("connection closed mid chunked send"))),
                    }
                }
            }
        }
    };

    for seq in pending_nacks {
        let _ = sender.retransmit(sink, seq).await;
    }
    for last_sequence in pending_resumes {
        let _ = sender.resume_from(sink, request_id, last_sequence).await;
    }

    result.map(|_| ())
}

async fn send_error(sink: &mut SplitSink<WebSocket, Message>, request_id: u32, err: &CoreError) {
    let msg = BifrostMessage { kind: MessageKind::Error as u8, request_id, payload: err.to_string().into_bytes(), ..Default::default() };
    let _ = sink.send(Message::Binary(msg.encode().into())).await;
}
