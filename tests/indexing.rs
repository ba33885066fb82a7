//! End-to-end indexing scenarios: fixture blocks replayed through a session,
//! its workers and writer, down into the store.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::json;
use tokio::time::{timeout, Duration};

use substrate_indexer::{
	errors::IndexerError,
	rpc::{ChainRpcApi, RawBlock, RawEvent},
	session::{
		protocol::{AccountSpec, ClientCommand, ClientEnvelope, ServerEnvelope, ServerEvent},
		spawn_session, SessionHandle,
	},
	store::Store,
	testing::{
		balances_deposit, raw_block, raw_extrinsic, staking_reward_event, timestamp_inherent,
		BOB, FERDIE,
	},
	types::{ChainId, ChainParams, Pubkey, StreamKind},
};

/// The watched portfolio account of the scenarios.
const TARGET: Pubkey = Pubkey([0x20; 32]);

struct FakeChain {
	head: u64,
	blocks: HashMap<u64, (RawBlock, Vec<RawEvent>)>,
}

#[async_trait]
impl ChainRpcApi for FakeChain {
	async fn head_height(&self) -> Result<u64, IndexerError> {
		Ok(self.head)
	}

	async fn hash_at(&self, height: u64) -> Result<substrate_indexer::types::BlockHash, IndexerError> {
		self.blocks
			.get(&height)
			.map(|(block, _)| block.hash)
			.ok_or_else(|| IndexerError::NotFound(format!("no block {height}")))
	}

	async fn block(&self, height: u64) -> Result<RawBlock, IndexerError> {
		self.blocks
			.get(&height)
			.map(|(block, _)| block.clone())
			.ok_or_else(|| IndexerError::NotFound(format!("no block {height}")))
	}

	async fn events(&self, height: u64) -> Result<Vec<RawEvent>, IndexerError> {
		self.blocks
			.get(&height)
			.map(|(_, events)| events.clone())
			.ok_or_else(|| IndexerError::NotFound(format!("no block {height}")))
	}

	async fn account_creation_height(&self, _: &Pubkey) -> Result<Option<u64>, IndexerError> {
		Ok(None)
	}
}

/// Three fixture blocks:
/// 1: a `transfer_keep_alive` signed by the watched account, fee derivable.
/// 2: a third-party `Utility.batch` paying out era 2000 rewards where the
///    watched account is a beneficiary only.
/// 3: the timestamp inherent alone.
fn fixture_chain() -> FakeChain {
	let block_1 = raw_block(
		1,
		vec![
			timestamp_inherent(1_621_400_000_000),
			raw_extrinsic(
				1,
				Some(TARGET),
				"Balances",
				"transfer_keep_alive",
				json!({ "dest": BOB.to_hex(), "value": "2000000000000" }),
			),
		],
	);
	let events_1 = vec![balances_deposit(1, 0, FERDIE, 15_000_000)];

	let block_2 = raw_block(
		2,
		vec![
			timestamp_inherent(1_621_400_006_000),
			raw_extrinsic(
				1,
				Some(BOB),
				"Utility",
				"batch",
				json!({ "calls": [
					{ "module": "Staking", "function": "payout_stakers",
					  "args": { "validator_stash": FERDIE.to_hex(), "era": 2000 } },
				] }),
			),
		],
	);
	let events_2 = vec![staking_reward_event(1, 0, TARGET, 56_754_728_805)];

	let block_3 = raw_block(3, vec![timestamp_inherent(1_621_400_012_000)]);

	FakeChain {
		head: 3,
		blocks: HashMap::from([
			(1, (block_1, events_1)),
			(2, (block_2, events_2)),
			(3, (block_3, vec![])),
		]),
	}
}

fn test_chains(
	chain: Arc<FakeChain>,
) -> std::collections::BTreeMap<ChainId, (ChainParams, Arc<FakeChain>)> {
	let params = ChainParams { finality_depth: 0, ..ChainParams::for_chain(ChainId::Kusama) };
	std::collections::BTreeMap::from([(ChainId::Kusama, (params, chain))])
}

fn attach_envelope() -> ClientEnvelope {
	ClientEnvelope {
		session_id: None,
		request_id: Some(1),
		command: ClientCommand::Attach {
			chain: ChainId::Kusama,
			accounts: vec![AccountSpec {
				address: TARGET.to_hex(),
				label: Some("portfolio".to_string()),
				start_block: Some(1),
			}],
		},
	}
}

/// Drive a session until both streams have checkpointed the target height.
async fn index_until_checkpointed(handle: &mut SessionHandle, target: u64) {
	let mut done_extrinsics = false;
	let mut done_staking = false;
	while !(done_extrinsics && done_staking) {
		let envelope: ServerEnvelope = timeout(Duration::from_secs(30), handle.events.recv())
			.await
			.expect("indexing makes progress")
			.expect("session stays alive");
		if let ServerEvent::Checkpoint { stream, height, .. } = envelope.event {
			if height >= target {
				match stream {
					StreamKind::Extrinsics => done_extrinsics = true,
					StreamKind::Staking => done_staking = true,
				}
			}
		}
	}
}

#[tokio::test]
async fn indexes_fixture_blocks_into_the_store() {
	let dir = tempfile::tempdir().unwrap();
	let db_path = dir.path().join("portfolio.db");
	let chain = Arc::new(fixture_chain());

	let (mut handle, _join) = spawn_session(
		"s-e2e".to_string(),
		Store::open(&db_path).unwrap(),
		test_chains(chain),
	);
	handle.commands.send(attach_envelope()).await.unwrap();
	index_until_checkpointed(&mut handle, 3).await;
	drop(handle);

	let store = Store::open(&db_path).unwrap();
	let extrinsics = store.get_extrinsics(ChainId::Kusama, &TARGET, None, None).unwrap();
	// Newest first: the batch payout, then the transfer. The inherent-only
	// block contributes nothing.
	assert_eq!(extrinsics.len(), 2);

	assert_eq!(extrinsics[1].block_height, 1);
	assert_eq!(extrinsics[1].call_module, "Balances");
	assert_eq!(extrinsics[1].call_function, "transfer_keep_alive");
	assert_eq!(extrinsics[1].matched_addresses.iter().copied().collect::<Vec<_>>(), vec![TARGET]);
	assert_eq!(extrinsics[1].fee, Some(15_000_000));
	assert_eq!(extrinsics[1].block_timestamp, Some(1_621_400_000_000));

	assert_eq!(extrinsics[0].block_height, 2);
	assert_eq!(extrinsics[0].call_module, "Utility");
	assert_eq!(extrinsics[0].call_function, "batch");
	assert!(extrinsics[0].matched_addresses.contains(&TARGET));

	let staking = store.get_staking_events(ChainId::Kusama, &TARGET, None, None).unwrap();
	assert_eq!(staking.len(), 1);
	assert_eq!(staking[0].amount, 56_754_728_805);
	assert_eq!(staking[0].era, Some(2000));
	assert_eq!(staking[0].validator_stash, Some(FERDIE));

	for stream in [StreamKind::Extrinsics, StreamKind::Staking] {
		assert_eq!(store.checkpoint(ChainId::Kusama, &TARGET, stream).unwrap(), Some(3));
	}
}

#[tokio::test]
async fn resume_reproduces_the_clean_run() {
	let dir = tempfile::tempdir().unwrap();
	let db_path = dir.path().join("portfolio.db");

	// First session indexes everything, then the client goes away.
	{
		let (mut handle, _join) = spawn_session(
			"s-first".to_string(),
			Store::open(&db_path).unwrap(),
			test_chains(Arc::new(fixture_chain())),
		);
		handle.commands.send(attach_envelope()).await.unwrap();
		index_until_checkpointed(&mut handle, 3).await;
	}

	let snapshot = |store: &Store| {
		let extrinsics = store.get_extrinsics(ChainId::Kusama, &TARGET, None, None).unwrap();
		let staking = store.get_staking_events(ChainId::Kusama, &TARGET, None, None).unwrap();
		(extrinsics, staking)
	};
	let before = snapshot(&Store::open(&db_path).unwrap());

	// A new session over the same database resumes from the checkpoints and
	// must leave the committed state exactly as a clean run would.
	{
		let (mut handle, _join) = spawn_session(
			"s-second".to_string(),
			Store::open(&db_path).unwrap(),
			test_chains(Arc::new(fixture_chain())),
		);
		handle.commands.send(attach_envelope()).await.unwrap();

		// Wait for the acknowledgement, then give the workers a moment to
		// (not) do anything: everything is already checkpointed.
		loop {
			let envelope = timeout(Duration::from_secs(30), handle.events.recv())
				.await
				.expect("session responds")
				.expect("session stays alive");
			if matches!(envelope.event, ServerEvent::Ack { .. }) {
				break
			}
		}
		tokio::time::sleep(Duration::from_millis(200)).await;
	}

	let after = snapshot(&Store::open(&db_path).unwrap());
	assert_eq!(before, after);
}

#[tokio::test]
async fn removed_account_keeps_history_but_stops_matching() {
	let dir = tempfile::tempdir().unwrap();
	let db_path = dir.path().join("portfolio.db");

	let (mut handle, _join) = spawn_session(
		"s-remove".to_string(),
		Store::open(&db_path).unwrap(),
		test_chains(Arc::new(fixture_chain())),
	);
	handle.commands.send(attach_envelope()).await.unwrap();
	index_until_checkpointed(&mut handle, 3).await;

	handle
		.commands
		.send(ClientEnvelope {
			session_id: None,
			request_id: Some(2),
			command: ClientCommand::RemoveAccount {
				chain: ChainId::Kusama,
				address: TARGET.to_hex(),
			},
		})
		.await
		.unwrap();
	loop {
		let envelope = timeout(Duration::from_secs(30), handle.events.recv())
			.await
			.expect("session responds")
			.expect("session stays alive");
		if let ServerEvent::Ack { ok, .. } = envelope.event {
			assert!(ok);
			if envelope.request_id == Some(2) {
				break
			}
		}
	}
	drop(handle);

	// Pre-existing rows stay queryable after removal.
	let store = Store::open(&db_path).unwrap();
	assert_eq!(store.get_extrinsics(ChainId::Kusama, &TARGET, None, None).unwrap().len(), 2);
}
