use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::errors::IndexerError;

/// 32-byte account identifier in its canonical raw form. SS58 addresses are
/// converted to this at session ingress and never compared in string form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pubkey(pub [u8; 32]);

impl Pubkey {
	pub fn from_hex(s: &str) -> Result<Self, IndexerError> {
		let stripped = s.strip_prefix("0x").unwrap_or(s);
		let bytes = hex::decode(stripped)
			.map_err(|e| IndexerError::BadRequest(format!("invalid pubkey hex: {e}")))?;
		let arr: [u8; 32] = bytes
			.try_into()
			.map_err(|_| IndexerError::BadRequest("pubkey must be 32 bytes".to_string()))?;
		Ok(Pubkey(arr))
	}

	pub fn to_hex(self) -> String {
		format!("0x{}", hex::encode(self.0))
	}
}

impl fmt::Display for Pubkey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for Pubkey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Pubkey({})", self.to_hex())
	}
}

impl Serialize for Pubkey {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for Pubkey {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Pubkey::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

/// 32-byte block hash, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
	pub fn from_hex(s: &str) -> Result<Self, IndexerError> {
		let stripped = s.strip_prefix("0x").unwrap_or(s);
		let bytes = hex::decode(stripped)
			.map_err(|e| IndexerError::Protocol(format!("invalid block hash: {e}")))?;
		let arr: [u8; 32] = bytes
			.try_into()
			.map_err(|_| IndexerError::Protocol("block hash must be 32 bytes".to_string()))?;
		Ok(BlockHash(arr))
	}

	pub fn to_hex(self) -> String {
		format!("0x{}", hex::encode(self.0))
	}
}

impl fmt::Debug for BlockHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Display for BlockHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl Serialize for BlockHash {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for BlockHash {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		BlockHash::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
	Kusama,
	Polkadot,
}

impl ChainId {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChainId::Kusama => "kusama",
			ChainId::Polkadot => "polkadot",
		}
	}
}

impl fmt::Display for ChainId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ChainId {
	type Err = IndexerError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"kusama" => Ok(ChainId::Kusama),
			"polkadot" => Ok(ChainId::Polkadot),
			other => Err(IndexerError::BadRequest(format!("unknown chain: {other}"))),
		}
	}
}

/// Static parameters of a supported chain. The finality depth can be
/// overridden from settings; 0 means the node's best head is trusted as-is.
#[derive(Debug, Clone)]
pub struct ChainParams {
	pub id: ChainId,
	pub genesis_hash: &'static str,
	pub token_decimals: u8,
	pub ss58_prefix: u16,
	pub finality_depth: u64,
}

impl ChainParams {
	pub fn for_chain(id: ChainId) -> Self {
		match id {
			ChainId::Kusama => ChainParams {
				id,
				genesis_hash:
					"0xb0a8d493285c2df73290dfb7e61f870f17b41801197a149ca93654499ea3dafe",
				token_decimals: 12,
				ss58_prefix: 2,
				finality_depth: 10,
			},
			ChainId::Polkadot => ChainParams {
				id,
				genesis_hash:
					"0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3",
				token_decimals: 10,
				ss58_prefix: 0,
				finality_depth: 10,
			},
		}
	}
}

/// The two independently checkpointed record streams per watched account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
	Extrinsics,
	Staking,
}

impl StreamKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			StreamKind::Extrinsics => "extrinsics",
			StreamKind::Staking => "staking",
		}
	}
}

impl fmt::Display for StreamKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedAccount {
	pub chain: ChainId,
	pub pubkey: Pubkey,
	pub label: Option<String>,
	/// First block of interest. `None` falls back to the account creation
	/// height when the node can provide it, else genesis.
	pub start_block: Option<u64>,
}

/// Amounts are serialised as decimal strings; planck values overflow every
/// float representation long before they overflow a u128.
pub mod amount_string {
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&value.to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse::<u128>().map_err(serde::de::Error::custom)
	}
}

pub mod opt_amount_string {
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(
		value: &Option<u128>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match value {
			Some(v) => serializer.serialize_some(&v.to_string()),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<u128>, D::Error> {
		let s = Option::<String>::deserialize(deserializer)?;
		s.map(|s| s.parse::<u128>().map_err(serde::de::Error::custom)).transpose()
	}
}

/// One persisted extrinsic, unique per `(chain, block_height, extrinsic_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtrinsicRecord {
	pub chain: ChainId,
	pub block_height: u64,
	pub extrinsic_index: u32,
	pub block_hash: BlockHash,
	pub block_timestamp: Option<i64>,
	pub signer: Option<Pubkey>,
	pub call_module: String,
	pub call_function: String,
	pub success: bool,
	#[serde(with = "amount_string")]
	pub tip: u128,
	/// `None` when the fee could not be derived from the block's events.
	#[serde(with = "opt_amount_string")]
	pub fee: Option<u128>,
	/// Full decoded argument tree, nested batch calls included.
	pub params: serde_json::Value,
	pub matched_addresses: BTreeSet<Pubkey>,
}

/// One persisted staking event, unique per
/// `(chain, block_height, extrinsic_index, event_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingEventRecord {
	pub chain: ChainId,
	pub block_height: u64,
	pub extrinsic_index: u32,
	pub event_index: u32,
	pub module: String,
	pub event_id: String,
	pub beneficiary: Pubkey,
	#[serde(with = "amount_string")]
	pub amount: u128,
	pub era: Option<u32>,
	pub validator_stash: Option<Pubkey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
	pub chain: ChainId,
	pub pubkey: Pubkey,
	pub stream: StreamKind,
	pub height: u64,
}
