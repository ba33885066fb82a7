//! Session controller.
//!
//! One session owns the workers and the writer acting on behalf of a single
//! client connection. Commands arrive as envelopes, progress and records
//! flow back on the event channel, and on disconnect everything the session
//! owns is stopped with a bounded deadline.

pub mod protocol;

use std::{
	collections::{BTreeMap, HashMap},
	path::PathBuf,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::{
	constants::{EVENT_BUFFER_SIZE, SHUTDOWN_DEADLINE},
	errors::{ErrorCode, IndexerError},
	indexer::{worker, WorkerCommand, WorkerEvent},
	rpc::ChainRpcApi,
	session::protocol::{
		AccountSpec, ClientCommand, ClientEnvelope, ServerEnvelope, ServerEvent,
	},
	ss58,
	store::{
		writer::{self, WriterCommand, WriterEvent, WriterHandle},
		Store,
	},
	types::{ChainId, ChainParams, Pubkey, StreamKind, WatchedAccount},
};

/// Client-facing ends of a spawned session.
pub struct SessionHandle {
	pub id: String,
	pub commands: mpsc::Sender<ClientEnvelope>,
	pub events: mpsc::Receiver<ServerEnvelope>,
}

/// Registry of live sessions. Sessions are acquired at connection time and
/// reclaimed either on disconnect or at process shutdown.
pub struct Controller<C> {
	db_path: PathBuf,
	chains: BTreeMap<ChainId, (ChainParams, Arc<C>)>,
	sessions: Mutex<HashMap<String, SessionEntry>>,
	next_session_id: AtomicU64,
}

struct SessionEntry {
	commands: mpsc::Sender<ClientEnvelope>,
	join: tokio::task::JoinHandle<()>,
}

impl<C: ChainRpcApi + 'static> Controller<C> {
	pub fn new(db_path: PathBuf, chains: BTreeMap<ChainId, (ChainParams, Arc<C>)>) -> Self {
		Self {
			db_path,
			chains,
			sessions: Mutex::new(HashMap::new()),
			next_session_id: AtomicU64::new(1),
		}
	}

	pub async fn open_session(&self) -> Result<SessionHandle, IndexerError> {
		let store = Store::open(&self.db_path)?;
		let id = format!("s-{:08x}", self.next_session_id.fetch_add(1, Ordering::Relaxed));
		let (handle, join) = spawn_session(id.clone(), store, self.chains.clone());
		self.sessions
			.lock()
			.await
			.insert(id, SessionEntry { commands: handle.commands.clone(), join });
		Ok(handle)
	}

	/// Release a session after its connection went away. The session task
	/// finishes once the last command sender is gone.
	pub async fn close_session(&self, id: &str) {
		let entry = self.sessions.lock().await.remove(id);
		if let Some(entry) = entry {
			drop(entry.commands);
			if tokio::time::timeout(SHUTDOWN_DEADLINE, entry.join).await.is_err() {
				warn!(session = id, "session missed shutdown deadline, detaching");
			}
		}
	}

	/// Stop every session, bounded by the shutdown deadline each.
	pub async fn shutdown(&self) {
		let sessions = std::mem::take(&mut *self.sessions.lock().await);
		for (id, entry) in sessions {
			drop(entry.commands);
			let abort = entry.join.abort_handle();
			if tokio::time::timeout(SHUTDOWN_DEADLINE, entry.join).await.is_err() {
				warn!(session = %id, "session missed shutdown deadline, aborting");
				abort.abort();
			}
		}
	}
}

pub fn spawn_session<C: ChainRpcApi + 'static>(
	id: String,
	store: Store,
	chains: BTreeMap<ChainId, (ChainParams, Arc<C>)>,
) -> (SessionHandle, tokio::task::JoinHandle<()>) {
	let (command_sender, command_receiver) = mpsc::channel(16);
	let (event_sender, event_receiver) = mpsc::channel(EVENT_BUFFER_SIZE);
	let (writer_event_sender, writer_event_receiver) = mpsc::unbounded_channel();
	let (worker_event_sender, worker_event_receiver) = mpsc::unbounded_channel();

	let session = Session {
		id: id.clone(),
		chains,
		accounts: BTreeMap::new(),
		workers: BTreeMap::new(),
		writer: writer::spawn(store, writer_event_sender),
		writer_events: writer_event_receiver,
		worker_events: worker_event_receiver,
		worker_event_sender,
		commands: command_receiver,
		out: event_sender,
	};
	let join = tokio::spawn(session.run());

	(SessionHandle { id, commands: command_sender, events: event_receiver }, join)
}

struct Session<C> {
	id: String,
	chains: BTreeMap<ChainId, (ChainParams, Arc<C>)>,
	accounts: BTreeMap<ChainId, BTreeMap<Pubkey, WatchedAccount>>,
	workers: BTreeMap<(ChainId, StreamKind), worker::WorkerHandle>,
	writer: WriterHandle,
	writer_events: mpsc::UnboundedReceiver<WriterEvent>,
	worker_events: mpsc::UnboundedReceiver<(ChainId, StreamKind, WorkerEvent)>,
	worker_event_sender: mpsc::UnboundedSender<(ChainId, StreamKind, WorkerEvent)>,
	commands: mpsc::Receiver<ClientEnvelope>,
	out: mpsc::Sender<ServerEnvelope>,
}

impl<C: ChainRpcApi + 'static> Session<C> {
	async fn run(mut self) {
		info!(session = %self.id, "session started");
		loop {
			tokio::select! {
				maybe_command = self.commands.recv() => match maybe_command {
					Some(envelope) => self.handle_command(envelope).await,
					// Disconnect: all command senders are gone.
					None => break,
				},
				Some(event) = self.writer_events.recv() => {
					if !self.handle_writer_event(event).await {
						break
					}
				},
				Some((chain, stream, event)) = self.worker_events.recv() => {
					self.handle_worker_event(chain, stream, event).await;
				},
			}
		}
		self.stop_workers().await;
		info!(session = %self.id, "session closed");
	}

	async fn handle_command(&mut self, envelope: ClientEnvelope) {
		let request_id = envelope.request_id;
		let result = match envelope.command {
			ClientCommand::Attach { chain, accounts } =>
				self.attach(chain, accounts).await,
			ClientCommand::Detach => {
				self.stop_workers().await;
				Ok(None)
			},
			ClientCommand::Pause => {
				self.broadcast_to_workers(|| WorkerCommand::Pause).await;
				Ok(None)
			},
			ClientCommand::Resume => {
				self.broadcast_to_workers(|| WorkerCommand::Resume).await;
				Ok(None)
			},
			ClientCommand::AddAccount { chain, address, label, start_block } =>
				self.add_account(chain, &address, label, start_block).await,
			ClientCommand::RemoveAccount { chain, address } =>
				self.remove_account(chain, &address).await,
			ClientCommand::QueryExtrinsics { chain, address, from_ts, to_ts } =>
				self.query_extrinsics(request_id, chain, &address, from_ts, to_ts).await,
			ClientCommand::QueryStaking { chain, address, from_height, to_height } =>
				self.query_staking(request_id, chain, &address, from_height, to_height).await,
			ClientCommand::Status => self.status().await,
			ClientCommand::ResetHistory { chain, address } =>
				self.reset_history(chain, address.as_deref()).await,
		};

		match result {
			Ok(data) =>
				self.send(request_id, ServerEvent::Ack { ok: true, error: None, data }).await,
			Err(e) => {
				self.send(
					request_id,
					ServerEvent::Ack { ok: false, error: Some(e.to_string()), data: None },
				)
				.await
			},
		}
	}

	async fn attach(
		&mut self,
		chain: ChainId,
		specs: Vec<AccountSpec>,
	) -> Result<Option<serde_json::Value>, IndexerError> {
		if specs.is_empty() {
			return Err(IndexerError::BadRequest("attach requires at least one account".into()))
		}
		let accounts = specs
			.into_iter()
			.map(|spec| {
				Ok(WatchedAccount {
					chain,
					pubkey: self.parse_address(chain, &spec.address)?,
					label: spec.label,
					start_block: spec.start_block,
				})
			})
			.collect::<Result<Vec<_>, IndexerError>>()?;

		self.spawn_or_extend_workers(chain, accounts).await?;
		Ok(None)
	}

	async fn add_account(
		&mut self,
		chain: ChainId,
		address: &str,
		label: Option<String>,
		start_block: Option<u64>,
	) -> Result<Option<serde_json::Value>, IndexerError> {
		let account = WatchedAccount {
			chain,
			pubkey: self.parse_address(chain, address)?,
			label,
			start_block,
		};
		self.spawn_or_extend_workers(chain, vec![account]).await?;
		Ok(None)
	}

	/// Start workers for the chain, or extend the running ones: existing
	/// accounts keep their in-flight work, the new ones join the next
	/// planning round.
	async fn spawn_or_extend_workers(
		&mut self,
		chain: ChainId,
		accounts: Vec<WatchedAccount>,
	) -> Result<(), IndexerError> {
		let (params, client) = self
			.chains
			.get(&chain)
			.ok_or_else(|| IndexerError::BadRequest(format!("chain {chain} is not configured")))?
			.clone();

		let known = self.accounts.entry(chain).or_default();
		for account in &accounts {
			known.insert(account.pubkey, account.clone());
		}

		if self.workers.contains_key(&(chain, StreamKind::Extrinsics)) {
			for account in accounts {
				for stream in [StreamKind::Extrinsics, StreamKind::Staking] {
					if let Some(handle) = self.workers.get(&(chain, stream)) {
						let _ = handle
							.commands
							.send(WorkerCommand::AddAccount(account.clone()))
							.await;
					}
				}
			}
			return Ok(())
		}

		let pubkeys: Vec<Pubkey> = accounts.iter().map(|a| a.pubkey).collect();
		for stream in [StreamKind::Extrinsics, StreamKind::Staking] {
			let checkpoints = self.load_checkpoints(chain, stream, pubkeys.clone()).await?;
			let with_checkpoints = accounts
				.iter()
				.map(|account| {
					(account.clone(), checkpoints.get(&account.pubkey).copied().flatten())
				})
				.collect();
			let handle = worker::spawn(
				params.clone(),
				stream,
				with_checkpoints,
				client.clone(),
				self.writer.commands.clone(),
				self.tagged_worker_events(chain, stream),
			);
			self.workers.insert((chain, stream), handle);
		}
		Ok(())
	}

	async fn remove_account(
		&mut self,
		chain: ChainId,
		address: &str,
	) -> Result<Option<serde_json::Value>, IndexerError> {
		let pubkey = self.parse_address(chain, address)?;
		self.accounts.get_mut(&chain).map(|accounts| accounts.remove(&pubkey));
		for stream in [StreamKind::Extrinsics, StreamKind::Staking] {
			if let Some(handle) = self.workers.get(&(chain, stream)) {
				let _ = handle.commands.send(WorkerCommand::RemoveAccount(pubkey)).await;
			}
		}
		Ok(None)
	}

	async fn query_extrinsics(
		&mut self,
		request_id: Option<u64>,
		chain: ChainId,
		address: &str,
		from_ts: Option<i64>,
		to_ts: Option<i64>,
	) -> Result<Option<serde_json::Value>, IndexerError> {
		let pubkey = self.parse_address(chain, address)?;
		let (reply_sender, reply_receiver) = oneshot::channel();
		self.writer
			.commands
			.send(WriterCommand::QueryExtrinsics {
				chain,
				pubkey,
				from_ts,
				to_ts,
				reply: reply_sender,
			})
			.await
			.map_err(|_| IndexerError::Storage("writer is gone".into()))?;
		let records = reply_receiver
			.await
			.map_err(|_| IndexerError::Storage("writer dropped the query".into()))??;

		let batch = records
			.iter()
			.map(|record| serde_json::to_value(record).expect("records serialise"))
			.collect();
		self.send(request_id, ServerEvent::Records { stream: StreamKind::Extrinsics, batch })
			.await;
		Ok(None)
	}

	async fn query_staking(
		&mut self,
		request_id: Option<u64>,
		chain: ChainId,
		address: &str,
		from_height: Option<u64>,
		to_height: Option<u64>,
	) -> Result<Option<serde_json::Value>, IndexerError> {
		let pubkey = self.parse_address(chain, address)?;
		let (reply_sender, reply_receiver) = oneshot::channel();
		self.writer
			.commands
			.send(WriterCommand::QueryStaking {
				chain,
				pubkey,
				from_height,
				to_height,
				reply: reply_sender,
			})
			.await
			.map_err(|_| IndexerError::Storage("writer is gone".into()))?;
		let records = reply_receiver
			.await
			.map_err(|_| IndexerError::Storage("writer dropped the query".into()))??;

		let batch = records
			.iter()
			.map(|record| serde_json::to_value(record).expect("records serialise"))
			.collect();
		self.send(request_id, ServerEvent::Records { stream: StreamKind::Staking, batch }).await;
		Ok(None)
	}

	async fn status(&mut self) -> Result<Option<serde_json::Value>, IndexerError> {
		let mut per_chain = serde_json::Map::new();
		for ((chain, stream), handle) in &self.workers {
			let (status_sender, status_receiver) = oneshot::channel();
			if handle.commands.send(WorkerCommand::Status(status_sender)).await.is_err() {
				continue
			}
			let Ok(status) = status_receiver.await else { continue };
			per_chain
				.entry(chain.as_str())
				.or_insert_with(|| json!({}))
				.as_object_mut()
				.expect("chain entry is an object")
				.insert(
					stream.as_str().to_string(),
					serde_json::to_value(&status).expect("status serialises"),
				);
		}
		Ok(Some(serde_json::Value::Object(per_chain)))
	}

	async fn reset_history(
		&mut self,
		chain: ChainId,
		address: Option<&str>,
	) -> Result<Option<serde_json::Value>, IndexerError> {
		let pubkey = address.map(|a| self.parse_address(chain, a)).transpose()?;
		let (reply_sender, reply_receiver) = oneshot::channel();
		self.writer
			.commands
			.send(WriterCommand::ResetHistory { chain, pubkey, reply: reply_sender })
			.await
			.map_err(|_| IndexerError::Storage("writer is gone".into()))?;
		reply_receiver
			.await
			.map_err(|_| IndexerError::Storage("writer dropped the reset".into()))??;
		Ok(None)
	}

	async fn handle_writer_event(&mut self, event: WriterEvent) -> bool {
		match event {
			WriterEvent::Committed { stream, extrinsics, staking_events, checkpoints } => {
				if !extrinsics.is_empty() {
					let batch = extrinsics
						.iter()
						.map(|record| serde_json::to_value(record).expect("records serialise"))
						.collect();
					self.send(None, ServerEvent::Records { stream, batch }).await;
				}
				if !staking_events.is_empty() {
					let batch = staking_events
						.iter()
						.map(|record| serde_json::to_value(record).expect("records serialise"))
						.collect();
					self.send(None, ServerEvent::Records { stream, batch }).await;
				}
				for checkpoint in checkpoints {
					self.send(
						None,
						ServerEvent::Checkpoint {
							account: checkpoint.pubkey,
							stream: checkpoint.stream,
							height: checkpoint.height,
						},
					)
					.await;
				}
				true
			},
			WriterEvent::StorageError(message) => {
				// Storage failures end the whole session.
				self.send(
					None,
					ServerEvent::Error {
						code: ErrorCode::Storage,
						message,
						fatal: true,
						context: None,
					},
				)
				.await;
				false
			},
		}
	}

	async fn handle_worker_event(
		&mut self,
		chain: ChainId,
		stream: StreamKind,
		event: WorkerEvent,
	) {
		match event {
			WorkerEvent::Progress { height, target, rate } => {
				let accounts: Vec<Pubkey> = self
					.accounts
					.get(&chain)
					.map(|accounts| accounts.keys().copied().collect())
					.unwrap_or_default();
				for account in accounts {
					self.send(
						None,
						ServerEvent::Progress { account, stream, height, target, rate },
					)
					.await;
				}
			},
			WorkerEvent::Error { code, message, fatal } => {
				self.send(
					None,
					ServerEvent::Error {
						code,
						message,
						fatal,
						context: Some(format!("{chain}/{stream}")),
					},
				)
				.await;
			},
			WorkerEvent::Stopped => {
				debug!(session = %self.id, %chain, %stream, "worker stopped");
				self.workers.remove(&(chain, stream));
			},
		}
	}

	async fn broadcast_to_workers(&self, command: impl Fn() -> WorkerCommand) {
		for handle in self.workers.values() {
			let _ = handle.commands.send(command()).await;
		}
	}

	/// Stop all owned workers, each bounded by the shutdown deadline, then
	/// abort stragglers so they cannot outlive the session.
	async fn stop_workers(&mut self) {
		let workers = std::mem::take(&mut self.workers);
		let stops = workers.into_iter().map(|((chain, stream), handle)| async move {
			let _ = handle.commands.send(WorkerCommand::Stop).await;
			let abort = handle.join.abort_handle();
			if tokio::time::timeout(SHUTDOWN_DEADLINE, handle.join).await.is_err() {
				warn!(%chain, %stream, "worker missed shutdown deadline, aborting");
				abort.abort();
			}
		});
		futures::future::join_all(stops).await;
	}

	fn tagged_worker_events(
		&self,
		chain: ChainId,
		stream: StreamKind,
	) -> mpsc::UnboundedSender<WorkerEvent> {
		let (sender, mut receiver) = mpsc::unbounded_channel();
		let tagged = self.worker_event_sender.clone();
		tokio::spawn(async move {
			while let Some(event) = receiver.recv().await {
				if tagged.send((chain, stream, event)).is_err() {
					break
				}
			}
		});
		sender
	}

	async fn load_checkpoints(
		&self,
		chain: ChainId,
		stream: StreamKind,
		accounts: Vec<Pubkey>,
	) -> Result<BTreeMap<Pubkey, Option<u64>>, IndexerError> {
		let (reply_sender, reply_receiver) = oneshot::channel();
		self.writer
			.commands
			.send(WriterCommand::LoadCheckpoints { chain, stream, accounts, reply: reply_sender })
			.await
			.map_err(|_| IndexerError::Storage("writer is gone".into()))?;
		Ok(reply_receiver
			.await
			.map_err(|_| IndexerError::Storage("writer dropped the lookup".into()))??
			.into_iter()
			.collect())
	}

	fn parse_address(&self, chain: ChainId, address: &str) -> Result<Pubkey, IndexerError> {
		let (params, _) = self
			.chains
			.get(&chain)
			.ok_or_else(|| IndexerError::BadRequest(format!("chain {chain} is not configured")))?;
		ss58::parse_account(address, params.ss58_prefix)
	}

	async fn send(&self, request_id: Option<u64>, event: ServerEvent) {
		let _ = self
			.out
			.send(ServerEnvelope { session_id: self.id.clone(), request_id, event })
			.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		rpc::MockChainRpcApi,
		testing::{raw_block, raw_extrinsic, timestamp_inherent, ALICE, BOB},
	};
	use serde_json::json;

	fn mock_chains(head: u64) -> BTreeMap<ChainId, (ChainParams, Arc<MockChainRpcApi>)> {
		let mut mock = MockChainRpcApi::new();
		mock.expect_head_height().returning(move || Ok(head));
		mock.expect_block().returning(|height| {
			Ok(raw_block(
				height,
				vec![
					timestamp_inherent(1_621_400_000_000 + height as i64),
					raw_extrinsic(
						1,
						Some(ALICE),
						"Balances",
						"transfer_keep_alive",
						json!({ "dest": BOB.to_hex(), "value": "100" }),
					),
				],
			))
		});
		mock.expect_events().returning(|_| Ok(vec![]));

		let params =
			ChainParams { finality_depth: 0, ..ChainParams::for_chain(ChainId::Kusama) };
		BTreeMap::from([(ChainId::Kusama, (params, Arc::new(mock)))])
	}

	fn attach_envelope(request_id: u64) -> ClientEnvelope {
		ClientEnvelope {
			session_id: None,
			request_id: Some(request_id),
			command: ClientCommand::Attach {
				chain: ChainId::Kusama,
				accounts: vec![AccountSpec {
					address: ALICE.to_hex(),
					label: Some("hot wallet".to_string()),
					start_block: Some(1),
				}],
			},
		}
	}

	async fn next_matching(
		events: &mut mpsc::Receiver<ServerEnvelope>,
		mut predicate: impl FnMut(&ServerEvent) -> bool,
	) -> ServerEnvelope {
		loop {
			let envelope = events.recv().await.expect("session alive");
			if predicate(&envelope.event) {
				return envelope
			}
		}
	}

	#[tokio::test(start_paused = true)]
	async fn attach_streams_records_and_checkpoints() {
		let (mut handle, _join) = spawn_session(
			"s-test".to_string(),
			Store::open_in_memory().unwrap(),
			mock_chains(2),
		);

		handle.commands.send(attach_envelope(1)).await.unwrap();

		let ack = next_matching(&mut handle.events, |event| {
			matches!(event, ServerEvent::Ack { .. })
		})
		.await;
		assert_eq!(ack.request_id, Some(1));
		assert!(matches!(ack.event, ServerEvent::Ack { ok: true, .. }));

		let records = next_matching(&mut handle.events, |event| {
			matches!(event, ServerEvent::Records { .. })
		})
		.await;
		match records.event {
			ServerEvent::Records { stream, batch } => {
				assert_eq!(stream, StreamKind::Extrinsics);
				assert_eq!(batch.len(), 2);
				assert_eq!(batch[0]["call_function"], "transfer_keep_alive");
			},
			_ => unreachable!(),
		}

		let checkpoint = next_matching(&mut handle.events, |event| {
			matches!(event, ServerEvent::Checkpoint { stream: StreamKind::Extrinsics, .. })
		})
		.await;
		match checkpoint.event {
			ServerEvent::Checkpoint { account, height, .. } => {
				assert_eq!(account, ALICE);
				assert_eq!(height, 2);
			},
			_ => unreachable!(),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn status_reports_both_streams() {
		let (mut handle, _join) = spawn_session(
			"s-test".to_string(),
			Store::open_in_memory().unwrap(),
			mock_chains(1),
		);

		handle.commands.send(attach_envelope(1)).await.unwrap();
		let _ = next_matching(&mut handle.events, |event| {
			matches!(event, ServerEvent::Checkpoint { .. })
		})
		.await;

		handle
			.commands
			.send(ClientEnvelope {
				session_id: None,
				request_id: Some(2),
				command: ClientCommand::Status,
			})
			.await
			.unwrap();
		let ack = next_matching(&mut handle.events, |event| {
			matches!(event, ServerEvent::Ack { .. })
		})
		.await;
		match ack.event {
			ServerEvent::Ack { ok, data, .. } => {
				assert!(ok);
				let data = data.expect("status carries data");
				assert!(data["kusama"]["extrinsics"].is_object());
				assert!(data["kusama"]["staking"].is_object());
			},
			_ => unreachable!(),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn unknown_chain_is_rejected() {
		let (mut handle, _join) = spawn_session(
			"s-test".to_string(),
			Store::open_in_memory().unwrap(),
			mock_chains(1),
		);

		handle
			.commands
			.send(ClientEnvelope {
				session_id: None,
				request_id: Some(9),
				command: ClientCommand::Attach {
					chain: ChainId::Polkadot,
					accounts: vec![AccountSpec {
						address: ALICE.to_hex(),
						label: None,
						start_block: None,
					}],
				},
			})
			.await
			.unwrap();

		let ack = next_matching(&mut handle.events, |event| {
			matches!(event, ServerEvent::Ack { .. })
		})
		.await;
		assert!(matches!(ack.event, ServerEvent::Ack { ok: false, .. }));
	}

	#[tokio::test(start_paused = true)]
	async fn disconnect_stops_workers() {
		let (handle, join) = spawn_session(
			"s-test".to_string(),
			Store::open_in_memory().unwrap(),
			mock_chains(1),
		);

		handle.commands.send(attach_envelope(1)).await.unwrap();
		// Dropping both ends simulates the client going away.
		drop(handle.commands);
		drop(handle.events);

		join.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn query_returns_persisted_records() {
		let (mut handle, _join) = spawn_session(
			"s-test".to_string(),
			Store::open_in_memory().unwrap(),
			mock_chains(1),
		);

		handle.commands.send(attach_envelope(1)).await.unwrap();
		let _ = next_matching(&mut handle.events, |event| {
			matches!(event, ServerEvent::Checkpoint { .. })
		})
		.await;

		handle
			.commands
			.send(ClientEnvelope {
				session_id: None,
				request_id: Some(3),
				command: ClientCommand::QueryExtrinsics {
					chain: ChainId::Kusama,
					address: ALICE.to_hex(),
					from_ts: None,
					to_ts: None,
				},
			})
			.await
			.unwrap();

		let records = next_matching(&mut handle.events, |event| {
			matches!(event, ServerEvent::Records { .. })
		})
		.await;
		assert_eq!(records.request_id, Some(3));
		match records.event {
			ServerEvent::Records { batch, .. } => {
				assert!(!batch.is_empty());
				assert_eq!(batch[0]["block_height"], 1);
			},
			_ => unreachable!(),
		}
	}
}
