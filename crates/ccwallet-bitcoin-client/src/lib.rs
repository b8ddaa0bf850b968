//! Bitcoin RPC client for fetching headers, blocks and transactions with retry logic.

use base64::{engine::general_purpose, Engine as _};
use bitcoin::consensus::Decodable;
use bitcoin::{BlockHash, Transaction, Txid};
use bitcoincore_rpc_json::GetBlockHeaderResult;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Bitcoin Core error code for unknown transactions and blocks
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

/// Error types for Bitcoin RPC client operations
#[derive(Error, Debug)]
pub enum BitcoinClientError {
    /// RPC client errors
    #[error("RPC client error: {0}")]
    RpcClient(#[from] jsonrpsee::core::client::Error),
    /// Invalid HTTP header value
    #[error("Invalid HTTP header value")]
    InvalidHeader,
    /// Failed to decode hex response
    #[error("Failed to decode hex response: {0}")]
    HexDecode(#[from] hex::FromHexError),
    /// Failed to deserialize Bitcoin consensus data
    #[error("Failed to deserialize Bitcoin data: {0}")]
    BitcoinDeserialization(#[from] bitcoin::consensus::encode::Error),
}

impl BitcoinClientError {
    /// Whether the node reported the requested transaction or block as unknown
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BitcoinClientError::RpcClient(jsonrpsee::core::client::Error::Call(err))
                if err.code() == RPC_INVALID_ADDRESS_OR_KEY
        )
    }
}

/// Default HTTP request timeout
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Verbose `getrawtransaction` result, reduced to the confirmation data
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawTransactionInfo {
    pub txid: Txid,
    /// Absent while the transaction is in the mempool
    #[serde(default)]
    pub blockhash: Option<BlockHash>,
    #[serde(default)]
    pub confirmations: Option<u32>,
}

/// `getblock` result at verbosity 1, reduced to the transaction list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockTxids {
    pub hash: BlockHash,
    pub height: u32,
    /// Transaction ids in block order
    pub tx: Vec<Txid>,
}

/// Bitcoin RPC client
pub struct BitcoinClient {
    client: HttpClient,
    backoff: backoff::ExponentialBackoff,
}

impl BitcoinClient {
    /// Create a new Bitcoin RPC client with default retry settings (exponential backoff)
    pub fn new(url: String, userpwd: Option<String>) -> Result<Self, BitcoinClientError> {
        let mut headers = HeaderMap::new();
        if let Some(userpwd) = userpwd {
            let creds = general_purpose::STANDARD.encode(userpwd);
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Basic {creds}"))
                    .map_err(|_| BitcoinClientError::InvalidHeader)?,
            );
        };

        let client = HttpClient::builder()
            .set_headers(headers)
            .request_timeout(HTTP_REQUEST_TIMEOUT)
            .build(url)?;

        Ok(Self {
            client,
            backoff: backoff::ExponentialBackoff::default(),
        })
    }

    /// Replace the retry policy
    pub fn with_backoff(mut self, backoff: backoff::ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn request_hex(
        &self,
        method: &str,
        params: ArrayParams,
    ) -> Result<Vec<u8>, BitcoinClientError> {
        request_with_retry(self.backoff.clone(), || async {
            let res_hex: String = self.client.request(method, params.clone()).await?;
            hex::decode(&res_hex).map_err(Into::into)
        })
        .await
    }

    async fn request_decode<T: Decodable>(
        &self,
        method: &str,
        params: ArrayParams,
    ) -> Result<T, BitcoinClientError> {
        let res_bytes = self.request_hex(method, params).await?;
        bitcoin::consensus::deserialize(&res_bytes).map_err(Into::into)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: ArrayParams,
    ) -> Result<T, BitcoinClientError> {
        request_with_retry(self.backoff.clone(), || async {
            self.client
                .request(method, params.clone())
                .await
                .map_err(Into::into)
        })
        .await
    }

    /// Get current chain height
    pub async fn get_block_count(&self) -> Result<u32, BitcoinClientError> {
        let result: u64 = self.request("getblockcount", rpc_params![]).await?;
        Ok(result as u32)
    }

    /// Get hash of the chain tip
    pub async fn get_best_block_hash(&self) -> Result<BlockHash, BitcoinClientError> {
        self.request("getbestblockhash", rpc_params![]).await
    }

    /// Get block hash by height
    pub async fn get_block_hash(&self, height: u32) -> Result<BlockHash, BitcoinClientError> {
        self.request("getblockhash", rpc_params![height]).await
    }

    /// Get the serialized 80-byte block header by hash
    pub async fn get_block_header_hex(
        &self,
        hash: &BlockHash,
    ) -> Result<Vec<u8>, BitcoinClientError> {
        self.request_hex("getblockheader", rpc_params![hash.to_string(), false])
            .await
    }

    /// Get block header by hash with extended data
    pub async fn get_block_header_ex(
        &self,
        hash: &BlockHash,
    ) -> Result<GetBlockHeaderResult, BitcoinClientError> {
        self.request("getblockheader", rpc_params![hash.to_string(), true])
            .await
    }

    /// Get a transaction from the mempool or, with `-txindex`, from the chain
    pub async fn get_raw_transaction(&self, txid: &Txid) -> Result<Transaction, BitcoinClientError> {
        self.request_decode("getrawtransaction", rpc_params![txid.to_string(), false])
            .await
    }

    /// Get confirmation data of a transaction
    pub async fn get_raw_transaction_info(
        &self,
        txid: &Txid,
    ) -> Result<RawTransactionInfo, BitcoinClientError> {
        self.request("getrawtransaction", rpc_params![txid.to_string(), true])
            .await
    }

    /// Get height and transaction ids of a block
    pub async fn get_block_txids(&self, hash: &BlockHash) -> Result<BlockTxids, BitcoinClientError> {
        self.request("getblock", rpc_params![hash.to_string(), 1]).await
    }

    /// Submit a transaction to the node's mempool
    pub async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, BitcoinClientError> {
        let tx_hex = bitcoin::consensus::encode::serialize_hex(tx);
        self.request("sendrawtransaction", rpc_params![tx_hex]).await
    }
}

/// Execute a request with retry logic using exponential backoff
/// Only retries on unexpected HTTP errors (not 200 OK or 400 Bad Request)
async fn request_with_retry<F, Fut, T>(
    backoff: backoff::ExponentialBackoff,
    operation: F,
) -> Result<T, BitcoinClientError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, BitcoinClientError>>,
{
    use backoff::{future::retry_notify, Error};

    retry_notify(
        backoff,
        || async {
            operation().await.map_err(|err| {
                if is_retryable_error(&err) {
                    Error::transient(err)
                } else {
                    Error::permanent(err)
                }
            })
        },
        |err, duration| {
            info!("Request failed, retrying in {:?}: {}", duration, err);
        },
    )
    .await
}

/// Determines if an error should be retried - only transport-level failures are
fn is_retryable_error(err: &BitcoinClientError) -> bool {
    use jsonrpsee::core::client::Error as RpcError;
    match err {
        BitcoinClientError::RpcClient(rpc_err) => matches!(
            rpc_err,
            RpcError::Transport(_)
                | RpcError::RequestTimeout
                | RpcError::RestartNeeded(_)
                | RpcError::ServiceDisconnect
        ),
        // JSON-RPC errors, hex and consensus decoding failures are permanent
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::{json, Value};
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;

    const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
    const GENESIS_HASH: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

    /// JSON-RPC responder echoing the request id
    fn reply(result: Value) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
        move |req: &Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": result,
            }))
        }
    }

    fn reply_error(code: i32, message: &'static str) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
        move |req: &Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "error": { "code": code, "message": message },
            }))
        }
    }

    async fn mock_rpc(server: &MockServer, rpc_method: &str, responder: impl wiremock::Respond + 'static) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(responder)
            .mount(server)
            .await;
    }

    fn fast_backoff() -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(10),
            max_elapsed_time: Some(Duration::from_secs(2)),
            ..Default::default()
        }
    }

    fn client(server: &MockServer) -> BitcoinClient {
        BitcoinClient::new(server.uri(), Some("user:pass".into()))
            .unwrap()
            .with_backoff(fast_backoff())
    }

    #[tokio::test]
    async fn test_block_count_and_hashes() {
        let server = MockServer::start().await;
        mock_rpc(&server, "getblockcount", reply(json!(850000))).await;
        mock_rpc(&server, "getbestblockhash", reply(json!(GENESIS_HASH))).await;
        mock_rpc(&server, "getblockhash", reply(json!(GENESIS_HASH))).await;

        let client = client(&server);
        assert_eq!(client.get_block_count().await.unwrap(), 850000);
        let genesis = BlockHash::from_str(GENESIS_HASH).unwrap();
        assert_eq!(client.get_best_block_hash().await.unwrap(), genesis);
        assert_eq!(client.get_block_hash(0).await.unwrap(), genesis);
    }

    #[tokio::test]
    async fn test_block_header_hex() {
        let server = MockServer::start().await;
        mock_rpc(&server, "getblockheader", reply(json!(GENESIS_HEADER))).await;

        let client = client(&server);
        let raw = client
            .get_block_header_hex(&BlockHash::from_str(GENESIS_HASH).unwrap())
            .await
            .unwrap();
        assert_eq!(raw.len(), 80);
        assert_eq!(hex::encode(raw), GENESIS_HEADER);
    }

    #[tokio::test]
    async fn test_transaction_info_and_block_txids() {
        let server = MockServer::start().await;
        let txid = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
        mock_rpc(
            &server,
            "getrawtransaction",
            reply(json!({ "txid": txid, "hash": txid, "size": 204 })),
        )
        .await;
        mock_rpc(
            &server,
            "getblock",
            reply(json!({ "hash": GENESIS_HASH, "height": 0, "tx": [txid], "confirmations": 1 })),
        )
        .await;

        let client = client(&server);
        let txid = Txid::from_str(txid).unwrap();
        let info = client.get_raw_transaction_info(&txid).await.unwrap();
        assert_eq!(info.txid, txid);
        assert_eq!(info.blockhash, None);

        let block = client
            .get_block_txids(&BlockHash::from_str(GENESIS_HASH).unwrap())
            .await
            .unwrap();
        assert_eq!(block.height, 0);
        assert_eq!(block.tx, vec![txid]);
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let server = MockServer::start().await;
        mock_rpc(
            &server,
            "getrawtransaction",
            reply_error(-5, "No such mempool or blockchain transaction"),
        )
        .await;

        let client = client(&server);
        let txid = Txid::from_str("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
            .unwrap();
        let err = client.get_raw_transaction(&txid).await.unwrap_err();
        assert!(err.is_not_found());
        // JSON-RPC errors are not retried
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        mock_rpc(&server, "getblockcount", reply(json!(7))).await;

        let client = client(&server);
        assert_eq!(client.get_block_count().await.unwrap(), 7);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_basic_auth_header() {
        let server = MockServer::start().await;
        let expected = format!("Basic {}", general_purpose::STANDARD.encode("user:pass"));
        Mock::given(method("POST"))
            .and(header("authorization", expected.as_str()))
            .respond_with(reply(json!(1)))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(client(&server).get_block_count().await.unwrap(), 1);
    }
}
