use serde::Deserialize;
use serde_json::Value;

use crate::{
	constants::RPC_REQUEST_TIMEOUT,
	errors::IndexerError,
	rpc::{ChainRpcApi, RawBlock, RawEvent},
	ss58,
	types::{BlockHash, Pubkey},
};

/// Client for the decoded-blocks HTTP endpoint of a node-side decoder
/// (sidecar). The endpoint serves JSON with SCALE decoding already applied;
/// this client only validates shape and normalises account strings.
#[derive(Clone)]
pub struct HttpRpcClient {
	client: reqwest::Client,
	base_url: String,
}

#[derive(Deserialize)]
struct Head {
	height: u64,
}

#[derive(Deserialize)]
struct Header {
	hash: BlockHash,
}

#[derive(Deserialize)]
struct CreationHeight {
	height: Option<u64>,
}

impl HttpRpcClient {
	pub fn new(base_url: &str) -> Result<Self, IndexerError> {
		let client = reqwest::Client::builder()
			.timeout(RPC_REQUEST_TIMEOUT)
			.build()
			.map_err(|e| IndexerError::Fatal(format!("failed to build http client: {e}")))?;
		Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
	}

	async fn get_json<T: serde::de::DeserializeOwned>(
		&self,
		path: &str,
	) -> Result<T, IndexerError> {
		let url = format!("{}/{}", self.base_url, path);
		let response = self.client.get(&url).send().await.map_err(|e| {
			if e.is_timeout() || e.is_connect() {
				IndexerError::Transient(format!("request to {url} failed: {e}"))
			} else {
				IndexerError::Protocol(format!("request to {url} failed: {e}"))
			}
		})?;

		let status = response.status();
		if status == reqwest::StatusCode::NOT_FOUND {
			return Err(IndexerError::NotFound(format!("{url} returned 404")))
		}
		if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
			return Err(IndexerError::Transient(format!("{url} returned {status}")))
		}
		if !status.is_success() {
			return Err(IndexerError::Protocol(format!("{url} returned {status}")))
		}

		response
			.json::<T>()
			.await
			.map_err(|e| IndexerError::Protocol(format!("unexpected response from {url}: {e}")))
	}

	/// Fails hard when the endpoint serves a different chain than configured.
	pub async fn validate_genesis(&self, expected_genesis_hash: &str) -> Result<(), IndexerError> {
		let genesis: Header = self.get_json("blocks/0/header").await?;
		let expected = BlockHash::from_hex(expected_genesis_hash)?;
		if genesis.hash != expected {
			return Err(IndexerError::Fatal(format!(
				"node endpoint serves genesis {} but {} was expected",
				genesis.hash, expected
			)))
		}
		Ok(())
	}
}

/// Rewrite every SS58-encoded account string in a decoded tree to pubkey hex
/// so that all downstream comparisons happen in canonical form. Non-account
/// strings never pass the checksum and are left untouched.
pub fn normalize_accounts(value: &mut Value) {
	match value {
		Value::String(s) => {
			if !s.starts_with("0x") {
				if let Ok(pubkey) = ss58::decode(s, None) {
					*s = pubkey.to_hex();
				}
			}
		},
		Value::Array(items) => items.iter_mut().for_each(normalize_accounts),
		Value::Object(map) => map.values_mut().for_each(normalize_accounts),
		_ => {},
	}
}

#[async_trait::async_trait]
impl ChainRpcApi for HttpRpcClient {
	async fn head_height(&self) -> Result<u64, IndexerError> {
		Ok(self.get_json::<Head>("blocks/head").await?.height)
	}

	async fn hash_at(&self, height: u64) -> Result<BlockHash, IndexerError> {
		Ok(self.get_json::<Header>(&format!("blocks/{height}/header")).await?.hash)
	}

	async fn block(&self, height: u64) -> Result<RawBlock, IndexerError> {
		let mut block: RawBlock = self.get_json(&format!("blocks/{height}")).await?;
		for extrinsic in &mut block.extrinsics {
			normalize_accounts(&mut extrinsic.args);
		}
		Ok(block)
	}

	async fn events(&self, height: u64) -> Result<Vec<RawEvent>, IndexerError> {
		let mut events: Vec<RawEvent> =
			self.get_json(&format!("blocks/{height}/events")).await?;
		for event in &mut events {
			normalize_accounts(&mut event.params);
		}
		Ok(events)
	}

	async fn account_creation_height(
		&self,
		pubkey: &Pubkey,
	) -> Result<Option<u64>, IndexerError> {
		match self
			.get_json::<CreationHeight>(&format!("accounts/{}/created-at", pubkey.to_hex()))
			.await
		{
			Ok(response) => Ok(response.height),
			// Endpoints without account history support simply don't serve the route.
			Err(IndexerError::NotFound(_)) => Ok(None),
			Err(e) => Err(e),
		}
	}
}
