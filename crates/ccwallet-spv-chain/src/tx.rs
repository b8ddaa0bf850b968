//! Transaction verification against the local header chain.

use std::sync::Arc;

use bitcoin::{Transaction, Txid};
use ccwallet_spv_verify::{Hash256, Header, MerkleProof};
use tracing::debug;

use crate::blockchain::ChainInner;
use crate::cache::CachedTx;
use crate::error::ChainError;
use crate::network::NetworkError;

impl ChainInner {
    /// Transaction `txid`, checked against its id and, when confirmed, against the
    /// Merkle root of the verified header it claims to be in.
    pub(crate) async fn get_verified_tx(
        self: &Arc<Self>,
        txid: Txid,
    ) -> Result<Arc<Transaction>, ChainError> {
        if let Some(entry) = self.tx_cache.get(&txid) {
            return Ok(entry.tx);
        }

        let inner = Arc::clone(self);
        self.txs
            .run(txid, move || async move { inner.fetch_verified_tx(txid).await })
            .await
    }

    async fn fetch_verified_tx(self: &Arc<Self>, txid: Txid) -> Result<Arc<Transaction>, ChainError> {
        let tx = Arc::new(self.network.get_tx(&txid).await?);
        if tx.compute_txid() != txid {
            return Err(ChainError::VerifyTx(txid));
        }

        let info = match self.network.get_merkle(&txid).await {
            Ok(info) => info,
            Err(NetworkError::BlockNotFound) => {
                debug!("Transaction {txid} is unconfirmed");
                self.tx_cache.put(
                    txid,
                    CachedTx {
                        confirmation_height: 0,
                        tx: Arc::clone(&tx),
                    },
                );
                return Ok(tx);
            }
            Err(err) => return Err(err.into()),
        };

        let proof = MerkleProof {
            branch: info.merkle,
            index: info.index,
        };
        let root = proof.root(&Hash256::from(txid));

        let raw = self.get_verified_header(info.height.into()).await?;
        let header = Header::decode(&raw)?;
        if header.merkle_root != root {
            return Err(ChainError::VerifyTx(txid));
        }

        debug!("Transaction {txid} verified at height {}", info.height);
        self.tx_cache.put(
            txid,
            CachedTx {
                confirmation_height: info.height,
                tx: Arc::clone(&tx),
            },
        );
        Ok(tx)
    }
}
