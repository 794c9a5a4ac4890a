use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::errors::{NodeError, NodeResult};
use crate::node::{NodeHandle, NodeStatus};
use crate::types::{CheckQuery, Item, ItemId, ItemResult, NodeId};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    address: String,
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(with = "hex")]
    payload: Vec<u8>,
}

#[derive(Serialize)]
struct RegisterResponse {
    item_id: String,
    result: ItemResult,
}

#[derive(Deserialize)]
struct PeerCheckRequest {
    caller: NodeId,
    query: CheckQuery,
}

#[derive(Serialize)]
struct NetworkResponse {
    size: usize,
    active: usize,
}

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> NodeResult<()> {
    let state = AppState { node };
    let router = Router::new()
        .route("/health", get(health))
        .route("/status/node", get(node_status))
        .route("/network", get(network_info))
        .route("/items", post(register_item))
        .route("/items/:id", get(item_body))
        .route("/items/:id/state", get(item_state))
        .route("/peer/check", post(peer_check))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "RPC server listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| NodeError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        address: state.node.address().to_string(),
    })
}

async fn node_status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.node.status())
}

async fn network_info(State(state): State<AppState>) -> Json<NetworkResponse> {
    let network = state.node.network();
    Json(NetworkResponse {
        size: network.size(),
        active: network.check_state(state.node.address()),
    })
}

async fn register_item(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, (StatusCode, Json<ErrorResponse>)> {
    let item = Item::new(request.payload);
    item.verify().map_err(to_http_error)?;
    let item_id = item.id().to_hex();
    state
        .node
        .register_item(item, None)
        .map(|info| {
            Json(RegisterResponse {
                item_id,
                result: info.result,
            })
        })
        .map_err(to_http_error)
}

async fn item_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<ItemResult>>, (StatusCode, Json<ErrorResponse>)> {
    let item_id = ItemId::from_hex(&id).map_err(to_http_error)?;
    state
        .node
        .check_item_id(&item_id)
        .map(Json)
        .map_err(to_http_error)
}

async fn item_body(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<Item>>, (StatusCode, Json<ErrorResponse>)> {
    let item_id = ItemId::from_hex(&id).map_err(to_http_error)?;
    Ok(Json(state.node.get_item(&item_id)))
}

async fn peer_check(
    State(state): State<AppState>,
    Json(request): Json<PeerCheckRequest>,
) -> Result<Json<ItemResult>, (StatusCode, Json<ErrorResponse>)> {
    let PeerCheckRequest { caller, query } = request;
    state
        .node
        .check_item(Some(caller), query.item_id, query.state, query.have_copy)
        .map(Json)
        .map_err(to_http_error)
}

fn to_http_error(err: NodeError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        NodeError::Election(_) | NodeError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
