pub mod worker;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{
	errors::ErrorCode,
	types::{Pubkey, WatchedAccount},
};

/// Lifecycle of one worker. Transitions are driven by commands from the
/// session controller and by the worker's own error escalations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
	Idle,
	Planning,
	Running,
	Paused,
	Stopping,
	Stopped,
}

#[derive(Debug)]
pub enum WorkerCommand {
	Pause,
	Resume,
	Stop,
	AddAccount(WatchedAccount),
	RemoveAccount(Pubkey),
	Status(oneshot::Sender<WorkerStatus>),
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountProgress {
	pub pubkey: Pubkey,
	pub last_checkpoint: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
	pub state: WorkerState,
	pub accounts: Vec<AccountProgress>,
	pub target_height: Option<u64>,
	pub rate_blocks_per_sec: f64,
	pub in_flight: usize,
	pub errors_last_5m: usize,
	/// Extrinsics with undecodable parts, skipped without stopping the block.
	pub decode_errors_last_5m: usize,
}

/// Progress and error notifications from a worker to its session.
#[derive(Debug)]
pub enum WorkerEvent {
	Progress { height: u64, target: u64, rate: f64 },
	Error { code: ErrorCode, message: String, fatal: bool },
	Stopped,
}
