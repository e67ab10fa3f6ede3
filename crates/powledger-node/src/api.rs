//! Read-only inspection API over the live chain. Handlers only take the read lock,
//! so they keep answering while the producer mines.
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use powledger_core::{Block, Chain, ChainState};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub chain: Chain,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Head {
    height: Option<u64>,
    hash: Option<String>,
    state: ChainState,
    difficulty: u32,
    pow_width: usize,
}

#[derive(Debug, Serialize)]
pub struct BlockView {
    hash: String,
    block: Block,
}

impl From<&Block> for BlockView {
    fn from(block: &Block) -> Self {
        Self {
            hash: hex::encode(block.chain_hash()),
            block: block.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Validation {
    valid: bool,
    length: usize,
    error: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/chain/head", get(head))
        .route("/chain/blocks", get(blocks))
        .route("/chain/blocks/{id}", get(block))
        .route("/chain/validate", get(validate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn head(State(state): State<AppState>) -> Json<Head> {
    let tail = state.chain.tail().ok();
    Json(Head {
        height: tail.as_ref().map(|b| b.id()),
        hash: tail.map(|b| hex::encode(b.chain_hash())),
        state: state.chain.state(),
        difficulty: state.chain.miner().difficulty(),
        pow_width: state.chain.miner().pow_width(),
    })
}

async fn blocks(State(state): State<AppState>) -> Json<Vec<BlockView>> {
    Json(
        state
            .chain
            .blocks()
            .iter()
            .map(|b| BlockView::from(b.as_ref()))
            .collect(),
    )
}

async fn block(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<BlockView>, StatusCode> {
    state
        .chain
        .get(id)
        .map(|b| Json(BlockView::from(b.as_ref())))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn validate(State(state): State<AppState>) -> Json<Validation> {
    let result = state.chain.validate();
    Json(Validation {
        valid: result.is_ok(),
        length: state.chain.len(),
        error: result.err().map(|e| e.to_string()),
    })
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("powledger-node listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}
