//! Per-(chain, stream) indexing pipeline.
//!
//! A worker plans the block range its accounts still need, fans block
//! fetches out over a bounded pool, reorders results back into ascending
//! height, classifies and filters each block, and hands matched records to
//! the session writer. Heartbeat checkpoint markers are emitted only after
//! every record at covered heights has been placed on the writer channel.

use std::{
	collections::{BTreeMap, BTreeSet, VecDeque},
	pin::Pin,
	sync::Arc,
	time::Duration,
};

use futures::{stream::FuturesUnordered, Future, StreamExt};
use rand::Rng;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
	classify::{self, BlockContext},
	constants::{
		BLOCK_DEADLINE, CHECKPOINT_BLOCK_INTERVAL, CHECKPOINT_TIME_INTERVAL, ERROR_WINDOW,
		FETCH_BACKOFF_BASE, FETCH_BACKOFF_CAP, FETCH_MAX_ATTEMPTS, FETCH_PARALLELISM,
		FETCH_WINDOW_SIZE, RATE_WINDOW, SUBSTRATE_AVERAGE_BLOCK_TIME,
	},
	errors::{ErrorCode, IndexerError},
	filter,
	indexer::{
		AccountProgress, WorkerCommand, WorkerEvent, WorkerState, WorkerStatus,
	},
	rpc::{ChainRpcApi, RawBlock, RawEvent},
	store::writer::WriterCommand,
	types::{ChainParams, ExtrinsicRecord, Pubkey, StreamKind, WatchedAccount},
};

type FetchOutput = (u64, Result<(RawBlock, Vec<RawEvent>), IndexerError>);
type FetchFuture = Pin<Box<dyn Future<Output = FetchOutput> + Send>>;

pub struct WorkerHandle {
	pub commands: mpsc::Sender<WorkerCommand>,
	pub join: tokio::task::JoinHandle<()>,
}

pub fn spawn<C: ChainRpcApi + 'static>(
	chain: ChainParams,
	stream: StreamKind,
	accounts: Vec<(WatchedAccount, Option<u64>)>,
	client: Arc<C>,
	writer: mpsc::Sender<WriterCommand>,
	events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
	let (command_sender, command_receiver) = mpsc::channel(16);
	let worker = Worker {
		chain,
		stream,
		client,
		writer,
		events,
		commands: command_receiver,
		state: WorkerState::Idle,
		accounts: accounts.iter().map(|(a, _)| (a.pubkey, a.clone())).collect(),
		checkpoints: accounts.into_iter().map(|(a, cp)| (a.pubkey, cp)).collect(),
		covered: BTreeSet::new(),
		job: None,
		fetches: FuturesUnordered::new(),
		buffer: BTreeMap::new(),
		last_processed: None,
		last_marker: None,
		blocks_since_marker: 0,
		last_marker_time: Instant::now(),
		next_plan_time: Instant::now(),
		needs_final_marker: false,
		processed_samples: VecDeque::new(),
		error_samples: VecDeque::new(),
		decode_error_samples: VecDeque::new(),
	};
	let join = tokio::spawn(worker.run());
	WorkerHandle { commands: command_sender, join }
}

struct Job {
	target: u64,
	next_fetch: u64,
	next_emit: u64,
}

struct Worker<C> {
	chain: ChainParams,
	stream: StreamKind,
	client: Arc<C>,
	writer: mpsc::Sender<WriterCommand>,
	events: mpsc::UnboundedSender<WorkerEvent>,
	commands: mpsc::Receiver<WorkerCommand>,

	state: WorkerState,
	accounts: BTreeMap<Pubkey, WatchedAccount>,
	/// Last checkpoint this worker has emitted (or loaded) per account.
	checkpoints: BTreeMap<Pubkey, Option<u64>>,
	/// Accounts whose range the current pass covers. Accounts added
	/// mid-pass join at the next planning round so their checkpoint can
	/// never leap over unscanned history.
	covered: BTreeSet<Pubkey>,

	job: Option<Job>,
	fetches: FuturesUnordered<FetchFuture>,
	buffer: BTreeMap<u64, (RawBlock, Vec<RawEvent>)>,

	last_processed: Option<u64>,
	last_marker: Option<u64>,
	blocks_since_marker: u64,
	last_marker_time: Instant,
	next_plan_time: Instant,
	needs_final_marker: bool,

	processed_samples: VecDeque<Instant>,
	error_samples: VecDeque<Instant>,
	decode_error_samples: VecDeque<Instant>,
}

impl<C: ChainRpcApi + 'static> Worker<C> {
	async fn run(mut self) {
		info!(chain = %self.chain.id, stream = %self.stream, "starting indexer worker");

		loop {
			if self.state == WorkerState::Stopped {
				break
			}

			if self.state == WorkerState::Idle {
				self.state = WorkerState::Running;
			}

			if self.state == WorkerState::Running {
				if self.job.is_none() && Instant::now() >= self.next_plan_time {
					match self.plan().await {
						Ok(Some(job)) => {
							info!(
								chain = %self.chain.id,
								stream = %self.stream,
								from = job.next_fetch,
								target = job.target,
								"planned indexing pass"
							);
							self.job = Some(job);
						},
						Ok(None) => {
							self.next_plan_time =
								Instant::now() + SUBSTRATE_AVERAGE_BLOCK_TIME;
						},
						Err(e) => self.escalate(e).await,
					}
				}
				self.refill();
			}

			let draining = !self.fetches.is_empty();
			tokio::select! {
				biased;
				command = self.commands.recv() => match command {
					Some(command) => self.handle_command(command).await,
					// Controller dropped the handle: treat as stop.
					None => {
						self.state = WorkerState::Stopping;
						self.needs_final_marker = true;
					},
				},
				Some((height, result)) = self.fetches.next(), if draining => match result {
					Ok(block_and_events) => {
						self.buffer.insert(height, block_and_events);
						if let Err(e) = self.drain_buffer().await {
							self.escalate(e).await;
						}
					},
					Err(e) => self.escalate(e).await,
				},
				_ = tokio::time::sleep(Duration::from_secs(1)) => {
					if self.blocks_since_marker > 0 &&
						self.last_marker_time.elapsed() >= CHECKPOINT_TIME_INTERVAL
					{
						if let Err(e) = self.emit_marker().await {
							self.escalate(e).await;
						}
					}
				},
			}

			if matches!(self.state, WorkerState::Paused | WorkerState::Stopping) &&
				self.fetches.is_empty()
			{
				if self.needs_final_marker {
					if let Err(e) = self.drain_buffer().await {
						self.escalate(e).await;
					}
					if let Err(e) = self.emit_marker().await {
						warn!("could not emit final checkpoint: {e}");
					}
					self.needs_final_marker = false;
					self.buffer.clear();
					self.job = None;
				}
				if self.state == WorkerState::Stopping {
					self.state = WorkerState::Stopped;
					let _ = self.events.send(WorkerEvent::Stopped);
				}
			}
		}

		info!(chain = %self.chain.id, stream = %self.stream, "indexer worker stopped");
	}

	/// Compute the next `[start, target]` pass. The pass starts at the
	/// earliest height any watched account still needs and targets the
	/// finality cutoff below the node's best head.
	async fn plan(&mut self) -> Result<Option<Job>, IndexerError> {
		if self.accounts.is_empty() {
			return Ok(None)
		}
		self.state = WorkerState::Planning;

		let head = self.client.head_height().await?;
		let target = head.saturating_sub(self.chain.finality_depth);

		let mut start: Option<u64> = None;
		for (pubkey, account) in &self.accounts {
			let account_start = match account.start_block {
				Some(configured) => configured,
				None => self
					.client
					.account_creation_height(pubkey)
					.await?
					.unwrap_or_default(),
			};
			let from = match self.checkpoints.get(pubkey).copied().flatten() {
				Some(checkpoint) => (checkpoint + 1).max(account_start),
				None => account_start,
			};
			start = Some(start.map_or(from, |s| s.min(from)));
		}
		self.state = WorkerState::Running;

		let start = start.expect("accounts is non-empty");
		if start > target {
			return Ok(None)
		}
		self.covered = self.accounts.keys().copied().collect();
		Ok(Some(Job { target, next_fetch: start, next_emit: start }))
	}

	/// Keep the fetch pool full. Fetches never run more than one window
	/// ahead of the contiguous emit point, which bounds the reorder buffer.
	fn refill(&mut self) {
		let Some(job) = &mut self.job else { return };
		let window_limit = job.next_emit.saturating_add(FETCH_WINDOW_SIZE);
		while self.fetches.len() < FETCH_PARALLELISM &&
			job.next_fetch <= job.target &&
			job.next_fetch < window_limit
		{
			let height = job.next_fetch;
			job.next_fetch += 1;
			let client = self.client.clone();
			self.fetches.push(Box::pin(fetch_block(client, height)));
		}
	}

	/// Emit every buffered block that is contiguous with the emit point, in
	/// strictly ascending height.
	async fn drain_buffer(&mut self) -> Result<(), IndexerError> {
		loop {
			let next_emit = match &self.job {
				Some(job) => job.next_emit,
				None => return Ok(()),
			};
			let Some((block, events)) = self.buffer.remove(&next_emit) else { return Ok(()) };

			self.process_block(block, events).await?;

			if let Some(job) = &mut self.job {
				job.next_emit += 1;
			}
			self.last_processed = Some(next_emit);
			self.blocks_since_marker += 1;
			self.note_processed();

			if self.blocks_since_marker >= CHECKPOINT_BLOCK_INTERVAL {
				self.emit_marker().await?;
			}

			let caught_up_target = match &self.job {
				Some(job) if job.next_emit > job.target => Some(job.target),
				_ => None,
			};
			if let Some(target) = caught_up_target {
				self.emit_marker().await?;
				debug!(
					chain = %self.chain.id,
					stream = %self.stream,
					target = target,
					"caught up to target"
				);
				self.job = None;
				self.next_plan_time = Instant::now() + SUBSTRATE_AVERAGE_BLOCK_TIME;
				return Ok(())
			}
		}
	}

	async fn process_block(
		&mut self,
		block: RawBlock,
		events: Vec<RawEvent>,
	) -> Result<(), IndexerError> {
		let timestamp = classify::block_timestamp(&block);
		let context = BlockContext {
			chain: self.chain.id,
			height: block.height,
			hash: block.hash,
			timestamp,
		};
		let watched: BTreeSet<Pubkey> = self.accounts.keys().copied().collect();

		for extrinsic in &block.extrinsics {
			let extrinsic_events: Vec<RawEvent> = events
				.iter()
				.filter(|event| event.extrinsic_index == Some(extrinsic.index))
				.cloned()
				.collect();
			let classified = classify::classify_extrinsic(extrinsic, &extrinsic_events);
			if classified.decode_errors > 0 {
				self.note_decode_errors(block.height, extrinsic.index, classified.decode_errors);
			}
			if classified.is_inherent() {
				continue
			}

			match self.stream {
				StreamKind::Extrinsics => {
					let matched = filter::matched_addresses(&classified, &watched);
					if matched.is_empty() {
						continue
					}
					self.send_to_writer(WriterCommand::Extrinsic(ExtrinsicRecord {
						chain: context.chain,
						block_height: context.height,
						extrinsic_index: extrinsic.index,
						block_hash: context.hash,
						block_timestamp: context.timestamp,
						signer: extrinsic.signer,
						call_module: extrinsic.module.clone(),
						call_function: extrinsic.function.clone(),
						success: extrinsic.success,
						tip: extrinsic.tip,
						fee: classified.fee,
						params: extrinsic.args.clone(),
						matched_addresses: matched,
					}))
					.await?;
				},
				StreamKind::Staking => {
					for record in classify::staking_events(&context, &classified) {
						if watched.contains(&record.beneficiary) {
							self.send_to_writer(WriterCommand::StakingEvent(record)).await?;
						}
					}
				},
			}
		}
		Ok(())
	}

	async fn send_to_writer(&mut self, command: WriterCommand) -> Result<(), IndexerError> {
		self.writer
			.send(command)
			.await
			.map_err(|_| IndexerError::Storage("writer channel closed".to_string()))
	}

	/// Checkpoint marker for the highest contiguous processed height. Only
	/// accounts covered by the current pass advance.
	async fn emit_marker(&mut self) -> Result<(), IndexerError> {
		let Some(height) = self.last_processed else { return Ok(()) };
		if self.last_marker == Some(height) {
			self.last_marker_time = Instant::now();
			self.blocks_since_marker = 0;
			return Ok(())
		}

		let accounts: Vec<Pubkey> = self
			.covered
			.iter()
			.filter(|pubkey| self.accounts.contains_key(pubkey))
			.copied()
			.collect();
		self.send_to_writer(WriterCommand::Checkpoint {
			chain: self.chain.id,
			stream: self.stream,
			accounts: accounts.clone(),
			height,
		})
		.await?;

		for pubkey in accounts {
			self.checkpoints.insert(pubkey, Some(height));
		}
		self.last_marker = Some(height);
		self.last_marker_time = Instant::now();
		self.blocks_since_marker = 0;

		let target = self.job.as_ref().map(|job| job.target).unwrap_or(height);
		let _ = self.events.send(WorkerEvent::Progress {
			height,
			target,
			rate: self.current_rate(),
		});
		Ok(())
	}

	async fn handle_command(&mut self, command: WorkerCommand) {
		match command {
			WorkerCommand::Pause =>
				if matches!(self.state, WorkerState::Running | WorkerState::Planning) {
					info!(chain = %self.chain.id, stream = %self.stream, "pausing");
					self.state = WorkerState::Paused;
					self.needs_final_marker = true;
				},
			WorkerCommand::Resume =>
				if self.state == WorkerState::Paused {
					info!(chain = %self.chain.id, stream = %self.stream, "resuming");
					self.state = WorkerState::Running;
					self.next_plan_time = Instant::now();
				},
			WorkerCommand::Stop => {
				self.state = WorkerState::Stopping;
				self.needs_final_marker = true;
			},
			WorkerCommand::AddAccount(account) => {
				self.checkpoints.entry(account.pubkey).or_insert(None);
				self.accounts.insert(account.pubkey, account);
				// Joins `covered` at the next planning round.
				self.next_plan_time = Instant::now();
			},
			WorkerCommand::RemoveAccount(pubkey) => {
				self.accounts.remove(&pubkey);
				self.covered.remove(&pubkey);
				self.checkpoints.remove(&pubkey);
			},
			WorkerCommand::Status(reply) => {
				let _ = reply.send(self.status());
			},
		}
	}

	async fn escalate(&mut self, error: IndexerError) {
		self.error_samples.push_back(Instant::now());
		self.prune_samples();

		match error {
			IndexerError::Transient(message) => {
				// Retries are exhausted; park at the last good checkpoint
				// and wait for a resume.
				warn!(
					chain = %self.chain.id,
					stream = %self.stream,
					"pausing after exhausted retries: {message}"
				);
				let _ = self.events.send(WorkerEvent::Error {
					code: ErrorCode::RpcTransient,
					message,
					fatal: false,
				});
				self.fetches.clear();
				self.buffer.clear();
				self.job = None;
				self.state = WorkerState::Paused;
				self.needs_final_marker = true;
			},
			IndexerError::Storage(message) => {
				error!(chain = %self.chain.id, stream = %self.stream, "storage failure: {message}");
				let _ = self.events.send(WorkerEvent::Error {
					code: ErrorCode::Storage,
					message,
					fatal: true,
				});
				self.fetches.clear();
				self.buffer.clear();
				self.job = None;
				// The writer is gone; a final marker could not commit anyway.
				self.needs_final_marker = false;
				self.state = WorkerState::Stopping;
			},
			IndexerError::Cancelled => {},
			other => {
				error!(chain = %self.chain.id, stream = %self.stream, "fatal worker error: {other}");
				let _ = self.events.send(WorkerEvent::Error {
					code: other.code(),
					message: other.to_string(),
					fatal: true,
				});
				self.fetches.clear();
				self.buffer.clear();
				self.job = None;
				self.state = WorkerState::Stopping;
				self.needs_final_marker = true;
			},
		}
	}

	fn status(&mut self) -> WorkerStatus {
		self.prune_samples();
		WorkerStatus {
			state: self.state,
			accounts: self
				.accounts
				.keys()
				.map(|pubkey| AccountProgress {
					pubkey: *pubkey,
					last_checkpoint: self.checkpoints.get(pubkey).copied().flatten(),
				})
				.collect(),
			target_height: self.job.as_ref().map(|job| job.target),
			rate_blocks_per_sec: self.current_rate(),
			in_flight: self.fetches.len(),
			errors_last_5m: self.error_samples.len(),
			decode_errors_last_5m: self.decode_error_samples.len(),
		}
	}

	/// Decode failures inside an extrinsic skip the affected calls and count
	/// towards the error side channel; the block itself proceeds.
	fn note_decode_errors(&mut self, height: u64, extrinsic_index: u32, count: u32) {
		let now = Instant::now();
		for _ in 0..count {
			self.decode_error_samples.push_back(now);
		}
		self.prune_samples();
		let _ = self.events.send(WorkerEvent::Error {
			code: ErrorCode::Decode,
			message: format!(
				"skipped {count} undecodable inner calls in extrinsic {height}-{extrinsic_index}"
			),
			fatal: false,
		});
	}

	fn note_processed(&mut self) {
		self.processed_samples.push_back(Instant::now());
		self.prune_samples();
	}

	fn prune_samples(&mut self) {
		let now = Instant::now();
		while self
			.processed_samples
			.front()
			.is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
		{
			self.processed_samples.pop_front();
		}
		while self
			.error_samples
			.front()
			.is_some_and(|t| now.duration_since(*t) > ERROR_WINDOW)
		{
			self.error_samples.pop_front();
		}
		while self
			.decode_error_samples
			.front()
			.is_some_and(|t| now.duration_since(*t) > ERROR_WINDOW)
		{
			self.decode_error_samples.pop_front();
		}
	}

	fn current_rate(&self) -> f64 {
		self.processed_samples.len() as f64 / RATE_WINDOW.as_secs_f64()
	}
}

/// Fetch one block and its events, retrying per the worker policy:
/// `Transient` up to the attempt cap with full-jitter exponential backoff,
/// `Protocol` once, `NotFound` never (the height is below the finality
/// cutoff, so a missing block is not going to appear).
async fn fetch_block<C: ChainRpcApi>(client: Arc<C>, height: u64) -> FetchOutput {
	let mut attempt: u32 = 0;
	loop {
		let result = match tokio::time::timeout(BLOCK_DEADLINE, async {
			let block = client.block(height).await?;
			let events = client.events(height).await?;
			Ok::<_, IndexerError>((block, events))
		})
		.await
		{
			Ok(result) => result,
			Err(_) =>
				Err(IndexerError::Transient(format!("block {height} exceeded fetch deadline"))),
		};

		match result {
			Ok(block_and_events) => return (height, Ok(block_and_events)),
			Err(error) => {
				attempt += 1;
				let retry = match &error {
					IndexerError::Transient(_) => attempt < FETCH_MAX_ATTEMPTS,
					IndexerError::Protocol(_) => attempt < 2,
					_ => false,
				};
				if !retry {
					return (height, Err(error))
				}
				let delay = backoff_with_jitter(attempt);
				debug!(height, attempt, ?delay, "retrying block fetch: {error}");
				tokio::time::sleep(delay).await;
			},
		}
	}
}

fn backoff_with_jitter(attempt: u32) -> Duration {
	let exponential = FETCH_BACKOFF_BASE
		.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
		.min(FETCH_BACKOFF_CAP);
	Duration::from_millis(rand::thread_rng().gen_range(0..=exponential.as_millis() as u64))
}
