pub mod chain_client;
pub mod http_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
	errors::IndexerError,
	types::{BlockHash, Pubkey},
};

/// One decoded extrinsic as delivered by the node-side decoder. The argument
/// tree is carried verbatim; account identifiers inside it are normalised to
/// `0x…` pubkey hex at the client boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExtrinsic {
	pub index: u32,
	pub signer: Option<Pubkey>,
	pub module: String,
	pub function: String,
	pub args: serde_json::Value,
	#[serde(default, with = "crate::types::amount_string")]
	pub tip: u128,
	pub success: bool,
}

/// One runtime event, grouped under the extrinsic that emitted it.
/// `extrinsic_index` is `None` for block-level (initialization/finalization)
/// events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
	pub extrinsic_index: Option<u32>,
	pub event_index: u32,
	pub module: String,
	pub event_id: String,
	pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
	pub height: u64,
	pub hash: BlockHash,
	pub parent_hash: BlockHash,
	pub extrinsics: Vec<RawExtrinsic>,
}

/// The node contract the indexer is written against. Every call is
/// independently retryable; errors carry the retry class in their variant.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpcApi: Send + Sync {
	/// Height of the current best block.
	async fn head_height(&self) -> Result<u64, IndexerError>;

	async fn hash_at(&self, height: u64) -> Result<BlockHash, IndexerError>;

	/// Header plus ordered extrinsics at the given height.
	async fn block(&self, height: u64) -> Result<RawBlock, IndexerError>;

	/// Events of the block at the given height, grouped by extrinsic index.
	async fn events(&self, height: u64) -> Result<Vec<RawEvent>, IndexerError>;

	/// Best-effort discovery of the block an account first appeared in.
	async fn account_creation_height(
		&self,
		pubkey: &Pubkey,
	) -> Result<Option<u64>, IndexerError>;
}
