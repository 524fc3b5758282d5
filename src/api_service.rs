use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, Method, StatusCode},
    response::sse::{Event, KeepAlive},
    response::{IntoResponse, Json, Response, Sse},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt as _};
use tower_http::cors::{Any, CorsLayer};

use crate::blockchain::dag_index::{DagIndex, DagViewRow, IndexError};
use crate::blockchain::orphan_manager::{AcceptError, AddOutcome, OrphanManager};
use crate::chainparams::ChainParams;
use crate::p2p::messages::{Block, Decodable, Digest};
use crate::p2p::sync_manager::SyncManager;
use crate::storage::BlockStore;
use crate::util::{parse_digest, short_hash};

pub const DEFAULT_VIEW_DEPTH: u64 = 10;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct ApiAppState {
    pub store: Arc<dyn BlockStore>,
    pub dag: Arc<DagIndex>,
    pub sync: Arc<SyncManager>,
    pub orphans: Arc<OrphanManager>,
    pub params: &'static ChainParams,
    pub started_at: DateTime<Utc>,
}

// --- API Error Handling ---
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

// --- Response Structs ---
#[derive(Serialize)]
struct PingResponse {
    message: String,
    status: String,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    version: String,
    protocol_version: i32,
    network: String,
    blocks_available: u64,
    dag_height: u64,
    tip_count: usize,
    finalized_height: Option<u64>,
    orphan_count: usize,
    peer_count: usize,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DagViewEntry {
    pub hash: String,
    pub height: u64,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub hash: String,
    pub height: u64,
    pub timestamp: u64,
    pub parent_count: usize,
    pub sender: String,
    pub finalized: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiBlockDetail {
    hash: String,
    height: u64,
    timestamp: u64,
    parents: Vec<String>,
    justifications: Vec<String>,
    children: Vec<String>,
    sender: String,
    signature: String,
    body_size: u32,
    body: String,
    finalized: bool,
}

#[derive(Serialize)]
struct SubmitResponse {
    hash: String,
    status: String,
    missing_parents: Vec<String>,
}

#[derive(Serialize)]
struct FinalizeResponse {
    hash: String,
    newly_finalized: usize,
}

#[derive(Serialize)]
struct FinalizedChainResponse {
    finalized_height: Option<u64>,
    chain: Vec<String>,
}

#[derive(Serialize)]
struct StreamEvent {
    dag_height: u64,
    tip_count: usize,
    blocks_available: u64,
}

#[derive(Deserialize)]
pub struct DepthQuery {
    depth: Option<u64>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

const DEFAULT_WALK_LIMIT: usize = 100;

// --- Query layer ---
//
// Pure reads over the DAG index. Everything here is ordered by height
// descending then hash ascending, so two nodes holding the same blocks
// render byte-identical views, before and after a restart.

fn row_entry(row: &DagViewRow) -> DagViewEntry {
    DagViewEntry {
        hash: hex::encode(row.meta.hash),
        height: row.meta.height,
        parents: row.meta.parent_hashes.iter().map(hex::encode).collect(),
        children: row.children.iter().map(hex::encode).collect(),
        finalized: row.finalized,
    }
}

pub fn dag_view(dag: &DagIndex, depth: u64) -> Vec<DagViewEntry> {
    dag.view_slice(depth).iter().map(row_entry).collect()
}

/// Graphviz DOT rendering of the DAG slice, the format the operator
/// tooling diffs across restarts.
pub fn render_vdag(dag: &DagIndex, depth: u64) -> String {
    let rows = dag.view_slice(depth);
    let mut out = String::from("digraph dag {\n  rankdir=BT;\n  node [shape=box];\n");
    for row in &rows {
        let flags = if row.finalized { " style=bold" } else { "" };
        out.push_str(&format!(
            "  \"{}\" [label=\"{} h={}\"{}];\n",
            hex::encode(row.meta.hash),
            short_hash(&row.meta.hash),
            row.meta.height,
            flags,
        ));
    }
    for row in &rows {
        for parent in &row.meta.parent_hashes {
            out.push_str(&format!(
                "  \"{}\" -> \"{}\";\n",
                hex::encode(row.meta.hash),
                hex::encode(parent),
            ));
        }
    }
    out.push_str("}\n");
    out
}

pub fn block_summaries(dag: &DagIndex, depth: u64) -> Vec<BlockSummary> {
    dag.view_slice(depth)
        .iter()
        .map(|row| BlockSummary {
            hash: hex::encode(row.meta.hash),
            height: row.meta.height,
            timestamp: row.meta.timestamp,
            parent_count: row.meta.parent_hashes.len(),
            sender: hex::encode(row.meta.sender),
            finalized: row.finalized,
        })
        .collect()
}

// --- Handlers ---

async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse { message: "pong".to_string(), status: "ok".to_string() })
}

async fn status_handler(State(state): State<ApiAppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: format!("meridian-node/{}", env!("CARGO_PKG_VERSION")),
        protocol_version: state.params.protocol_version,
        network: state.params.network_id_string.to_string(),
        blocks_available: state.store.blocks_count(),
        dag_height: state.dag.max_height(),
        tip_count: state.dag.get_tips().len(),
        finalized_height: state.dag.finalized_height(),
        orphan_count: state.orphans.orphan_count().await,
        peer_count: state.sync.peer_count().await,
        started_at: state.started_at,
    })
}

async fn dag_handler(
    State(state): State<ApiAppState>,
    Query(query): Query<DepthQuery>,
) -> Json<Vec<DagViewEntry>> {
    let depth = query.depth.unwrap_or(DEFAULT_VIEW_DEPTH);
    Json(dag_view(&state.dag, depth))
}

async fn dag_dot_handler(
    State(state): State<ApiAppState>,
    Query(query): Query<DepthQuery>,
) -> impl IntoResponse {
    let depth = query.depth.unwrap_or(DEFAULT_VIEW_DEPTH);
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/vnd.graphviz")],
        render_vdag(&state.dag, depth),
    )
}

async fn blocks_handler(
    State(state): State<ApiAppState>,
    Query(query): Query<DepthQuery>,
) -> Json<Vec<BlockSummary>> {
    let depth = query.depth.unwrap_or(DEFAULT_VIEW_DEPTH);
    Json(block_summaries(&state.dag, depth))
}

async fn get_block_handler(
    State(state): State<ApiAppState>,
    Path(block_hash): Path<String>,
) -> Result<Json<ApiBlockDetail>, ApiError> {
    let digest: Digest = parse_digest(&block_hash)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid block hash: {}", block_hash)))?;
    let meta = state
        .dag
        .get(&digest)
        .ok_or_else(|| ApiError::NotFound(format!("block {} not found", block_hash)))?;
    let block = state
        .store
        .get(&digest)
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?
        .ok_or_else(|| {
            ApiError::InternalServerError(format!("block {} indexed but not stored", block_hash))
        })?;
    Ok(Json(ApiBlockDetail {
        hash: hex::encode(digest),
        height: meta.height,
        timestamp: meta.timestamp,
        parents: meta.parent_hashes.iter().map(hex::encode).collect(),
        justifications: meta.justification_hashes.iter().map(hex::encode).collect(),
        children: state.dag.children_of(&digest).iter().map(hex::encode).collect(),
        sender: hex::encode(meta.sender),
        signature: hex::encode(block.signature),
        body_size: meta.body_len,
        body: hex::encode(&block.body),
        finalized: state.dag.is_finalized(&digest),
    }))
}

/// Block ingress for the local proposer: the consensus collaborator POSTs
/// a canonically encoded block.
async fn submit_block_handler(
    State(state): State<ApiAppState>,
    body: Bytes,
) -> Result<Json<SubmitResponse>, ApiError> {
    let mut cursor = Cursor::new(&body[..]);
    let block = Block::consensus_decode(&mut cursor)
        .map_err(|e| ApiError::BadRequest(format!("undecodable block: {}", e)))?;
    if cursor.position() as usize != body.len() {
        return Err(ApiError::BadRequest("trailing bytes after block".to_string()));
    }
    let hash = block.get_hash();
    let outcome = state.orphans.add_block(block).await.map_err(|e| match e {
        AcceptError::BadSignature { .. } | AcceptError::Index(_) => {
            ApiError::BadRequest(e.to_string())
        }
        other => ApiError::InternalServerError(other.to_string()),
    })?;
    let (status, missing_parents) = match outcome {
        AddOutcome::Accepted { .. } => {
            state.sync.announce_tips().await;
            ("accepted", Vec::new())
        }
        AddOutcome::AlreadyKnown => ("already_known", Vec::new()),
        AddOutcome::Parked { missing } => {
            ("parked", missing.iter().map(hex::encode).collect())
        }
    };
    Ok(Json(SubmitResponse {
        hash: hex::encode(hash),
        status: status.to_string(),
        missing_parents,
    }))
}

async fn ancestors_handler(
    State(state): State<ApiAppState>,
    Path(block_hash): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let digest: Digest = parse_digest(&block_hash)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid block hash: {}", block_hash)))?;
    let limit = query.limit.unwrap_or(DEFAULT_WALK_LIMIT);
    let ancestors = state.dag.ancestors_of(&digest, limit).map_err(|e| match e {
        IndexError::UnknownBlock { .. } => ApiError::NotFound(e.to_string()),
        other => ApiError::InternalServerError(other.to_string()),
    })?;
    Ok(Json(ancestors.iter().map(hex::encode).collect()))
}

async fn descendants_handler(
    State(state): State<ApiAppState>,
    Path(block_hash): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let digest: Digest = parse_digest(&block_hash)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid block hash: {}", block_hash)))?;
    let limit = query.limit.unwrap_or(DEFAULT_WALK_LIMIT);
    let descendants = state.dag.descendants_of(&digest, limit).map_err(|e| match e {
        IndexError::UnknownBlock { .. } => ApiError::NotFound(e.to_string()),
        other => ApiError::InternalServerError(other.to_string()),
    })?;
    Ok(Json(descendants.iter().map(hex::encode).collect()))
}

async fn finalized_chain_handler(
    State(state): State<ApiAppState>,
) -> Json<FinalizedChainResponse> {
    Json(FinalizedChainResponse {
        finalized_height: state.dag.finalized_height(),
        chain: state.dag.get_finalized_chain().iter().map(hex::encode).collect(),
    })
}

/// Finality signal from the consensus collaborator. Idempotent.
async fn finalize_handler(
    State(state): State<ApiAppState>,
    Path(block_hash): Path<String>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let digest: Digest = parse_digest(&block_hash)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid block hash: {}", block_hash)))?;
    let newly_finalized = state.dag.mark_finalized(&digest).map_err(|e| match e {
        IndexError::UnknownBlock { .. } => ApiError::NotFound(e.to_string()),
        other => ApiError::InternalServerError(other.to_string()),
    })?;
    Ok(Json(FinalizeResponse { hash: block_hash, newly_finalized }))
}

async fn status_stream_handler(
    State(state): State<ApiAppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let stream = IntervalStream::new(tokio::time::interval(Duration::from_secs(2))).map(move |_| {
        let event = StreamEvent {
            dag_height: state.dag.max_height(),
            tip_count: state.dag.get_tips().len(),
            blocks_available: state.store.blocks_count(),
        };
        match serde_json::to_string(&event) {
            Ok(json_data) => Ok(Event::default().data(json_data)),
            Err(e) => {
                log::error!("failed to serialize stream event: {}", e);
                Ok(Event::default().data("{\"error\":\"serialization_failed\"}"))
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn create_router(app_state: ApiAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/api/v1/ping", get(ping_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/dag", get(dag_handler))
        .route("/api/v1/dag.dot", get(dag_dot_handler))
        .route("/api/v1/blocks", get(blocks_handler).post(submit_block_handler))
        .route("/api/v1/block/:block_hash", get(get_block_handler))
        .route("/api/v1/block/:block_hash/ancestors", get(ancestors_handler))
        .route("/api/v1/block/:block_hash/descendants", get(descendants_handler))
        .route("/api/v1/finalized", get(finalized_chain_handler))
        .route("/api/v1/finalize/:block_hash", post(finalize_handler))
        .route("/api/v1/status/stream", get(status_stream_handler))
        .layer(cors)
        .with_state(app_state)
}

pub async fn run_api_service(
    app_state: ApiAppState,
    listen_addr: &str,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("API service listening on {}", listen_addr);
    axum::serve(listener, create_router(app_state)).await
}
