//! Client <-> controller message envelopes.
//!
//! Both directions use `{type, session_id, payload, request_id?}` JSON
//! envelopes over the event transport. Commands carry an optional
//! `request_id` that is echoed in the acknowledging envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
	errors::ErrorCode,
	types::{ChainId, Pubkey, StreamKind},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSpec {
	/// SS58 or `0x…` pubkey hex; normalised to a pubkey at ingress.
	pub address: String,
	#[serde(default)]
	pub label: Option<String>,
	#[serde(default)]
	pub start_block: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
	#[serde(default)]
	pub session_id: Option<String>,
	#[serde(default)]
	pub request_id: Option<u64>,
	#[serde(flatten)]
	pub command: ClientCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
	Attach {
		chain: ChainId,
		accounts: Vec<AccountSpec>,
	},
	Detach,
	Pause,
	Resume,
	AddAccount {
		chain: ChainId,
		address: String,
		#[serde(default)]
		label: Option<String>,
		#[serde(default)]
		start_block: Option<u64>,
	},
	RemoveAccount {
		chain: ChainId,
		address: String,
	},
	QueryExtrinsics {
		chain: ChainId,
		address: String,
		#[serde(default)]
		from_ts: Option<i64>,
		#[serde(default)]
		to_ts: Option<i64>,
	},
	QueryStaking {
		chain: ChainId,
		address: String,
		#[serde(default)]
		from_height: Option<u64>,
		#[serde(default)]
		to_height: Option<u64>,
	},
	Status,
	ResetHistory {
		chain: ChainId,
		#[serde(default)]
		address: Option<String>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
	pub session_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_id: Option<u64>,
	#[serde(flatten)]
	pub event: ServerEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
	Progress {
		account: Pubkey,
		stream: StreamKind,
		height: u64,
		target: u64,
		rate: f64,
	},
	Checkpoint {
		account: Pubkey,
		stream: StreamKind,
		height: u64,
	},
	Error {
		code: ErrorCode,
		message: String,
		fatal: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		context: Option<String>,
	},
	Records {
		stream: StreamKind,
		batch: Vec<Value>,
	},
	Ack {
		ok: bool,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		data: Option<Value>,
	},
}
