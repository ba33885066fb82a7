//! Shared fixtures for unit and integration tests.

use serde_json::{json, Value};

use crate::{
	classify::BlockContext,
	rpc::{RawBlock, RawEvent, RawExtrinsic},
	types::{BlockHash, ChainId, Pubkey},
};

pub const ALICE: Pubkey = Pubkey([0xa1; 32]);
pub const BOB: Pubkey = Pubkey([0xb2; 32]);
pub const CHARLIE: Pubkey = Pubkey([0xc3; 32]);
pub const FERDIE: Pubkey = Pubkey([0xfd; 32]);

pub fn raw_extrinsic(
	index: u32,
	signer: Option<Pubkey>,
	module: &str,
	function: &str,
	args: Value,
) -> RawExtrinsic {
	RawExtrinsic {
		index,
		signer,
		module: module.to_string(),
		function: function.to_string(),
		args,
		tip: 0,
		success: true,
	}
}

pub fn raw_block(height: u64, extrinsics: Vec<RawExtrinsic>) -> RawBlock {
	let mut hash = [0u8; 32];
	hash[..8].copy_from_slice(&height.to_be_bytes());
	let mut parent_hash = [0u8; 32];
	parent_hash[..8].copy_from_slice(&height.saturating_sub(1).to_be_bytes());
	RawBlock { height, hash: BlockHash(hash), parent_hash: BlockHash(parent_hash), extrinsics }
}

pub fn timestamp_inherent(timestamp_ms: i64) -> RawExtrinsic {
	raw_extrinsic(0, None, "Timestamp", "set", json!({ "now": timestamp_ms.to_string() }))
}

pub fn block_context(height: u64) -> BlockContext {
	BlockContext {
		chain: ChainId::Kusama,
		height,
		hash: raw_block(height, vec![]).hash,
		timestamp: Some(1_621_400_000_000),
	}
}

pub fn balances_deposit(
	extrinsic_index: u32,
	event_index: u32,
	who: Pubkey,
	amount: u128,
) -> RawEvent {
	RawEvent {
		extrinsic_index: Some(extrinsic_index),
		event_index,
		module: "Balances".to_string(),
		event_id: "Deposit".to_string(),
		params: json!([who.to_hex(), amount.to_string()]),
	}
}

pub fn transfer_event(
	extrinsic_index: u32,
	event_index: u32,
	from: Pubkey,
	to: Pubkey,
	amount: u128,
) -> RawEvent {
	RawEvent {
		extrinsic_index: Some(extrinsic_index),
		event_index,
		module: "Balances".to_string(),
		event_id: "Transfer".to_string(),
		params: json!([from.to_hex(), to.to_hex(), amount.to_string()]),
	}
}

pub fn staking_reward_event(
	extrinsic_index: u32,
	event_index: u32,
	stash: Pubkey,
	amount: u128,
) -> RawEvent {
	RawEvent {
		extrinsic_index: Some(extrinsic_index),
		event_index,
		module: "Staking".to_string(),
		event_id: "Reward".to_string(),
		params: json!([stash.to_hex(), amount.to_string()]),
	}
}
