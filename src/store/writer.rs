//! Session writer.
//!
//! A single consumer drains the bounded record channel that all of a
//! session's workers feed. Records accumulate until their covering
//! checkpoint marker arrives; the batch and the checkpoint advance then
//! commit in one transaction, so a crash can leave the checkpoint behind the
//! data but never ahead of it.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::{
	constants::WRITER_CHANNEL_CAPACITY,
	errors::IndexerError,
	store::Store,
	types::{Checkpoint, ChainId, ExtrinsicRecord, Pubkey, StakingEventRecord, StreamKind},
};

#[derive(Debug)]
pub enum WriterCommand {
	Extrinsic(ExtrinsicRecord),
	StakingEvent(StakingEventRecord),
	/// Marker: every record at heights <= `height` for this (chain, stream)
	/// is already on the channel ahead of it.
	Checkpoint {
		chain: ChainId,
		stream: StreamKind,
		accounts: Vec<Pubkey>,
		height: u64,
	},
	/// Stored checkpoints, for worker planning.
	LoadCheckpoints {
		chain: ChainId,
		stream: StreamKind,
		accounts: Vec<Pubkey>,
		reply: oneshot::Sender<Result<Vec<(Pubkey, Option<u64>)>, IndexerError>>,
	},
	QueryExtrinsics {
		chain: ChainId,
		pubkey: Pubkey,
		from_ts: Option<i64>,
		to_ts: Option<i64>,
		reply: oneshot::Sender<Result<Vec<ExtrinsicRecord>, IndexerError>>,
	},
	QueryStaking {
		chain: ChainId,
		pubkey: Pubkey,
		from_height: Option<u64>,
		to_height: Option<u64>,
		reply: oneshot::Sender<Result<Vec<StakingEventRecord>, IndexerError>>,
	},
	ResetHistory {
		chain: ChainId,
		pubkey: Option<Pubkey>,
		reply: oneshot::Sender<Result<(), IndexerError>>,
	},
}

/// Pushed back to the session after every durable commit, and on failure.
#[derive(Debug)]
pub enum WriterEvent {
	Committed {
		stream: StreamKind,
		extrinsics: Vec<ExtrinsicRecord>,
		staking_events: Vec<StakingEventRecord>,
		checkpoints: Vec<Checkpoint>,
	},
	StorageError(String),
}

pub struct WriterHandle {
	pub commands: mpsc::Sender<WriterCommand>,
	pub join: tokio::task::JoinHandle<()>,
}

/// Spawn the writer on the blocking pool; rusqlite is synchronous and the
/// writer is the only task touching this connection.
pub fn spawn(store: Store, events: mpsc::UnboundedSender<WriterEvent>) -> WriterHandle {
	let (command_sender, command_receiver) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
	let join = tokio::task::spawn_blocking(move || run(store, command_receiver, events));
	WriterHandle { commands: command_sender, join }
}

fn run(
	mut store: Store,
	mut commands: mpsc::Receiver<WriterCommand>,
	events: mpsc::UnboundedSender<WriterEvent>,
) {
	let mut pending_extrinsics: Vec<ExtrinsicRecord> = Vec::new();
	let mut pending_staking: Vec<StakingEventRecord> = Vec::new();

	while let Some(command) = commands.blocking_recv() {
		match command {
			WriterCommand::Extrinsic(record) => pending_extrinsics.push(record),
			WriterCommand::StakingEvent(record) => pending_staking.push(record),
			WriterCommand::Checkpoint { chain, stream, accounts, height } => {
				match commit_batch(
					&mut store,
					&mut pending_extrinsics,
					&mut pending_staking,
					chain,
					stream,
					&accounts,
					height,
				) {
					Ok(event) => {
						let _ = events.send(event);
					},
					Err(e) => {
						// A failed commit rolled back; the checkpoint still
						// covers only previously committed data. Storage
						// errors end the session.
						error!("writer commit failed: {e}");
						let _ = events.send(WriterEvent::StorageError(e.to_string()));
						return
					},
				}
			},
			WriterCommand::LoadCheckpoints { chain, stream, accounts, reply } => {
				let result = accounts
					.into_iter()
					.map(|pubkey| {
						store.checkpoint(chain, &pubkey, stream).map(|cp| (pubkey, cp))
					})
					.collect();
				let _ = reply.send(result);
			},
			WriterCommand::QueryExtrinsics { chain, pubkey, from_ts, to_ts, reply } => {
				let _ = reply.send(store.get_extrinsics(chain, &pubkey, from_ts, to_ts));
			},
			WriterCommand::QueryStaking { chain, pubkey, from_height, to_height, reply } => {
				let _ =
					reply.send(store.get_staking_events(chain, &pubkey, from_height, to_height));
			},
			WriterCommand::ResetHistory { chain, pubkey, reply } => {
				let _ = reply.send(store.delete_history(chain, pubkey.as_ref()));
			},
		}
	}
	debug!("writer channel closed, exiting");
}

fn commit_batch(
	store: &mut Store,
	pending_extrinsics: &mut Vec<ExtrinsicRecord>,
	pending_staking: &mut Vec<StakingEventRecord>,
	chain: ChainId,
	stream: StreamKind,
	accounts: &[Pubkey],
	height: u64,
) -> Result<WriterEvent, IndexerError> {
	let extrinsics = std::mem::take(pending_extrinsics);
	let staking_events = std::mem::take(pending_staking);

	let tx = store.transaction()?;
	for record in &extrinsics {
		Store::upsert_extrinsic(&tx, record)?;
	}
	for record in &staking_events {
		Store::upsert_staking_event(&tx, record)?;
	}
	let mut checkpoints = Vec::with_capacity(accounts.len());
	for pubkey in accounts {
		Store::advance_checkpoint(&tx, chain, pubkey, stream, height)?;
		checkpoints.push(Checkpoint { chain, pubkey: *pubkey, stream, height });
	}
	tx.commit()?;

	debug!(
		chain = %chain,
		stream = %stream,
		height,
		extrinsics = extrinsics.len(),
		staking_events = staking_events.len(),
		"committed batch"
	);
	Ok(WriterEvent::Committed { stream, extrinsics, staking_events, checkpoints })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{ALICE, BOB};
	use serde_json::json;
	use std::collections::BTreeSet;

	fn record(height: u64) -> ExtrinsicRecord {
		ExtrinsicRecord {
			chain: ChainId::Kusama,
			block_height: height,
			extrinsic_index: 1,
			block_hash: crate::types::BlockHash([1; 32]),
			block_timestamp: Some(1_621_400_000_000),
			signer: Some(ALICE),
			call_module: "Balances".to_string(),
			call_function: "transfer".to_string(),
			success: true,
			tip: 0,
			fee: None,
			params: json!({ "dest": BOB.to_hex(), "value": "1" }),
			matched_addresses: BTreeSet::from([ALICE]),
		}
	}

	#[tokio::test]
	async fn records_commit_with_their_checkpoint() {
		let (event_sender, mut event_receiver) = mpsc::unbounded_channel();
		let writer = spawn(Store::open_in_memory().unwrap(), event_sender);

		writer.commands.send(WriterCommand::Extrinsic(record(100))).await.unwrap();
		writer
			.commands
			.send(WriterCommand::Checkpoint {
				chain: ChainId::Kusama,
				stream: StreamKind::Extrinsics,
				accounts: vec![ALICE],
				height: 100,
			})
			.await
			.unwrap();

		let event = event_receiver.recv().await.unwrap();
		match event {
			WriterEvent::Committed { extrinsics, checkpoints, .. } => {
				assert_eq!(extrinsics.len(), 1);
				assert_eq!(checkpoints, vec![Checkpoint {
					chain: ChainId::Kusama,
					pubkey: ALICE,
					stream: StreamKind::Extrinsics,
					height: 100,
				}]);
			},
			other => panic!("unexpected event: {other:?}"),
		}

		let (reply_sender, reply_receiver) = oneshot::channel();
		writer
			.commands
			.send(WriterCommand::QueryExtrinsics {
				chain: ChainId::Kusama,
				pubkey: ALICE,
				from_ts: None,
				to_ts: None,
				reply: reply_sender,
			})
			.await
			.unwrap();
		assert_eq!(reply_receiver.await.unwrap().unwrap().len(), 1);

		drop(writer.commands);
		writer.join.await.unwrap();
	}

	#[tokio::test]
	async fn records_without_checkpoint_are_not_durable() {
		// A writer dropped mid-batch must leave the store as if the batch
		// never arrived: the checkpoint stays behind the data, never ahead.
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("portfolio.db");

		{
			let (event_sender, _event_receiver) = mpsc::unbounded_channel();
			let writer = spawn(Store::open(&path).unwrap(), event_sender);
			writer.commands.send(WriterCommand::Extrinsic(record(100))).await.unwrap();
			writer
				.commands
				.send(WriterCommand::Checkpoint {
					chain: ChainId::Kusama,
					stream: StreamKind::Extrinsics,
					accounts: vec![ALICE],
					height: 100,
				})
				.await
				.unwrap();
			// This record's checkpoint never arrives.
			writer.commands.send(WriterCommand::Extrinsic(record(101))).await.unwrap();
			drop(writer.commands);
			writer.join.await.unwrap();
		}

		let store = Store::open(&path).unwrap();
		assert_eq!(
			store.checkpoint(ChainId::Kusama, &ALICE, StreamKind::Extrinsics).unwrap(),
			Some(100)
		);
		let rows = store.get_extrinsics(ChainId::Kusama, &ALICE, None, None).unwrap();
		assert_eq!(rows.iter().map(|r| r.block_height).collect::<Vec<_>>(), vec![100]);
	}
}
