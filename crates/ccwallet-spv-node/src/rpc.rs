//! HTTP RPC server exposing verified headers and transactions.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use ccwallet_spv_chain::{ChainError, ChainTip, NetworkError, VerifiedBlockchain};
use ccwallet_spv_verify::{Hash256, HeaderRecord};

/// Configuration for the RPC server
#[derive(Clone)]
pub struct RpcConfig {
    /// Host and port binding for the RPC server (e.g., "127.0.0.1:5000")
    pub rpc_host: String,
}

/// Verified header with its position in the chain
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockHeaderResponse {
    pub height: i64,
    pub hash: Hash256,
    pub header: HeaderRecord,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub txid: Txid,
    /// Consensus-serialized transaction
    pub hex: String,
}

#[derive(Clone)]
pub struct AppState {
    chain: Arc<VerifiedBlockchain>,
}

/// HTTP RPC server answering from the verified blockchain
pub struct RpcServer {
    config: RpcConfig,
    chain: Arc<VerifiedBlockchain>,
    rx_shutdown: broadcast::Receiver<()>,
}

pub fn router(chain: Arc<VerifiedBlockchain>) -> Router {
    Router::new()
        .route("/head", get(get_head))
        .route("/block-header/:block_height", get(get_block_header))
        .route("/block-time/:block_height", get(get_block_time))
        .route("/tx/:tx_id", get(get_transaction))
        .with_state(AppState { chain })
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

impl RpcServer {
    pub fn new(
        config: RpcConfig,
        chain: Arc<VerifiedBlockchain>,
        rx_shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            chain,
            rx_shutdown,
        }
    }

    async fn run_inner(&self) -> Result<(), std::io::Error> {
        info!("Starting RPC server on {}", self.config.rpc_host);

        let app = router(Arc::clone(&self.chain));
        let listener = TcpListener::bind(&self.config.rpc_host).await?;
        let mut rx_shutdown = self.rx_shutdown.resubscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { rx_shutdown.recv().await.unwrap_or_default() })
            .await
    }

    pub async fn run(&self) -> Result<(), ()> {
        match self.run_inner().await {
            Err(err) => {
                error!("RPC server exited: {}", err);
                Err(())
            }
            Ok(()) => {
                info!("RPC server terminated");
                Ok(())
            }
        }
    }
}

/// HTTP status for a failed chain query
fn status_code(err: &ChainError) -> StatusCode {
    match err {
        ChainError::NotFound(_) => StatusCode::NOT_FOUND,
        ChainError::Network(err) if matches!(**err, NetworkError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        // The remote served data that does not match the verified chain
        ChainError::Verify(_)
        | ChainError::VerifyChunk(_)
        | ChainError::VerifyTx(_)
        | ChainError::InvalidHeader(_)
        | ChainError::Network(_) => StatusCode::BAD_GATEWAY,
        ChainError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        ChainError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Get the best verified height and block hash
pub async fn get_head(State(state): State<AppState>) -> Json<ChainTip> {
    Json(state.chain.tip())
}

/// Get the verified header at a block height
///
/// # Returns
/// * `StatusCode::NOT_FOUND` - If neither the local nor the remote chain reaches the height
/// * `StatusCode::BAD_GATEWAY` - If the remote served data that failed verification
pub async fn get_block_header(
    State(state): State<AppState>,
    Path(block_height): Path<i64>,
) -> Result<Json<BlockHeaderResponse>, StatusCode> {
    let header = state.chain.get_header(block_height).await.map_err(|e| {
        error!("Failed to get block header for height {}: {}", block_height, e);
        status_code(&e)
    })?;
    Ok(Json(BlockHeaderResponse {
        height: block_height,
        hash: header.id(),
        header: HeaderRecord::from(&header),
    }))
}

/// Get the timestamp of the verified header at a block height
pub async fn get_block_time(
    State(state): State<AppState>,
    Path(block_height): Path<i64>,
) -> Result<Json<u32>, StatusCode> {
    let time = state.chain.get_block_time(block_height).await.map_err(|e| {
        error!("Failed to get block time for height {}: {}", block_height, e);
        status_code(&e)
    })?;
    Ok(Json(time))
}

/// Get a transaction, verified against its Merkle proof if confirmed
///
/// # Returns
/// * `StatusCode::BAD_REQUEST` - If the transaction ID is invalid
/// * `StatusCode::BAD_GATEWAY` - If the transaction failed verification
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> Result<Json<TransactionResponse>, StatusCode> {
    let txid = Txid::from_str(&tx_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let tx = state.chain.get_tx(&txid).await.map_err(|e| {
        error!("Failed to get transaction {}: {}", tx_id, e);
        status_code(&e)
    })?;
    Ok(Json(TransactionResponse {
        txid,
        hex: bitcoin::consensus::encode::serialize_hex(tx.as_ref()),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ccwallet_bitcoin_client::BitcoinClient;
    use ccwallet_spv_chain::{BlockchainConfig, MemoryChunkStore};
    use serde_json::{json, Value};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;
    use crate::network::BitcoindNetwork;

    const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
    const GENESIS_HASH: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

    async fn mock_rpc(server: &MockServer, body: Value, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(body))
            .respond_with(move |req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": result,
                }))
            })
            .mount(server)
            .await;
    }

    /// Node whose Bitcoin Core backend only knows the mainnet genesis block
    async fn genesis_node() -> (MockServer, String) {
        let server = MockServer::start().await;
        mock_rpc(&server, json!({ "method": "getbestblockhash" }), json!(GENESIS_HASH)).await;
        mock_rpc(
            &server,
            json!({ "method": "getblockheader", "params": [GENESIS_HASH, true] }),
            json!({
                "hash": GENESIS_HASH,
                "confirmations": 1,
                "height": 0,
                "version": 1,
                "versionHex": "00000001",
                "merkleroot": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                "time": 1231006505,
                "mediantime": 1231006505,
                "nonce": 2083236893,
                "bits": "1d00ffff",
                "difficulty": 1,
                "chainwork": "0000000000000000000000000000000000000000000000000000000100010001",
                "nTx": 1,
            }),
        )
        .await;
        mock_rpc(&server, json!({ "method": "getblockhash", "params": [0] }), json!(GENESIS_HASH)).await;
        mock_rpc(
            &server,
            json!({ "method": "getblockheader", "params": [GENESIS_HASH, false] }),
            json!(GENESIS_HEADER),
        )
        .await;

        let client = BitcoinClient::new(server.uri(), None).unwrap().with_backoff(
            backoff::ExponentialBackoff {
                max_elapsed_time: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );
        let network = Arc::new(BitcoindNetwork::new(client));
        network.poll().await.unwrap();

        let chain = VerifiedBlockchain::new(
            network,
            Arc::new(MemoryChunkStore::new()),
            BlockchainConfig::default(),
        )
        .await
        .unwrap();
        chain.sync().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(Arc::new(chain))).await.unwrap();
        });
        (server, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn test_queries_against_verified_chain() {
        let (_server, base) = genesis_node().await;
        let http = reqwest::Client::new();

        let head: Value = http.get(format!("{base}/head")).send().await.unwrap().json().await.unwrap();
        assert_eq!(head, json!({ "height": 0, "hash": GENESIS_HASH }));

        let header: BlockHeaderResponse = http
            .get(format!("{base}/block-header/0"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(header.hash.to_string(), GENESIS_HASH);
        assert_eq!(header.header.bits, 0x1d00ffff);
        assert_eq!(header.header.prev_block_hash, None);

        let time: u32 = http
            .get(format!("{base}/block-time/0"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(time, 1231006505);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (_server, base) = genesis_node().await;
        let http = reqwest::Client::new();

        let missing = http.get(format!("{base}/block-header/5")).send().await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let invalid = http.get(format!("{base}/tx/not-a-txid")).send().await.unwrap();
        assert_eq!(invalid.status().as_u16(), 400);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_code(&ChainError::NotFound(5)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_code(&ChainError::from(NetworkError::NotFound("tx".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_code(&ChainError::from(NetworkError::BlockNotFound)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_code(&ChainError::VerifyChunk(3)), StatusCode::BAD_GATEWAY);
        assert_eq!(status_code(&ChainError::Closed), StatusCode::SERVICE_UNAVAILABLE);
    }
}
