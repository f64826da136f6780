use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderName, Method, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use poll_core::{IdentityProvider, Poll, PollId, VoteError};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::poll_logic::config::Config;
use crate::poll_logic::error::ApiError;
use crate::poll_logic::identity::{HeaderIdentity, VOTER_HEADER};
use crate::poll_logic::model::{
    CreatePollRequest, ExistingVoteResponse, PollView, ServerMessage, VoteRequest,
};
use crate::poll_logic::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(VOTER_HEADER)])
        .allow_origin(Any);

    Router::new()
        .route("/polls", post(create_poll))
        .route("/polls/{id}", get(get_poll))
        .route("/polls/{id}/vote", get(existing_vote).post(submit_vote))
        .route("/polls/{id}/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run(
    config: Config,
    state: AppState,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Downstream server listening on {}", addr);
    serve(listener, state, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            tracing::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "store": state.coordinator.store().backend(),
    }))
}

async fn create_poll(
    State(state): State<AppState>,
    Json(request): Json<CreatePollRequest>,
) -> Result<(StatusCode, Json<PollView>), ApiError> {
    let poll = state.coordinator.create_poll(request.into()).await?;
    Ok((StatusCode::CREATED, Json(PollView::new(&poll, None))))
}

async fn get_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<PollId>,
    identity: HeaderIdentity,
) -> Result<Json<PollView>, ApiError> {
    let poll = state.coordinator.poll(&poll_id).await?;
    let your_vote = match identity.voter() {
        Some(voter_id) => state
            .coordinator
            .existing_vote(&poll_id, voter_id)
            .await?
            .map(|vote| vote.option_id),
        None => None,
    };
    Ok(Json(PollView::new(&poll, your_vote)))
}

async fn existing_vote(
    State(state): State<AppState>,
    Path(poll_id): Path<PollId>,
    identity: HeaderIdentity,
) -> Result<Json<ExistingVoteResponse>, ApiError> {
    let voter_id = identity.current_identity().map_err(VoteError::from)?;
    state.coordinator.poll(&poll_id).await?;
    let vote = state.coordinator.existing_vote(&poll_id, &voter_id).await?;
    Ok(Json(ExistingVoteResponse {
        option_id: vote.map(|vote| vote.option_id),
    }))
}

async fn submit_vote(
    State(state): State<AppState>,
    Path(poll_id): Path<PollId>,
    identity: HeaderIdentity,
    Json(request): Json<VoteRequest>,
) -> Result<Json<PollView>, ApiError> {
    let snapshot = state
        .coordinator
        .vote_as(&identity, &poll_id, &request.option_id)
        .await?;
    Ok(Json(PollView::new(&snapshot, Some(request.option_id))))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(poll_id): Path<PollId>,
) -> Result<Response, ApiError> {
    // Unknown polls get a plain 404 instead of an upgrade.
    state.coordinator.poll(&poll_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, poll_id)))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, poll_id: PollId) {
    let mut shutdown = state.shutdown_signal();

    let mut subscription = match state.broker().subscribe(&poll_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(%poll_id, error = %e, "Subscribe failed");
            let message = ServerMessage::Error { message: e.to_string() };
            let _ = send_message(&mut socket, &message).await;
            return;
        }
    };
    let client_id = subscription.id();
    tracing::info!(%poll_id, client_id, "Viewer connected");

    if send_snapshot(&mut socket, subscription.initial()).await.is_ok() {
        loop {
            tokio::select! {
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Viewers only listen; anything they send is ignored.
                    Some(Ok(_)) => {}
                },
                update = subscription.next() => match update {
                    Some(snapshot) => {
                        if send_snapshot(&mut socket, &snapshot).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    None => break,
                },
                _ = shutdown.recv() => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    state.broker().unsubscribe(&poll_id, client_id);
    tracing::info!(%poll_id, client_id, "Viewer disconnected");
}

async fn send_snapshot(socket: &mut WebSocket, poll: &Poll) -> Result<(), axum::Error> {
    let message = ServerMessage::Snapshot {
        poll: PollView::new(poll, None),
    };
    send_message(socket, &message).await
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}
