pub mod writer;

use std::{collections::BTreeSet, path::Path};

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::info;

use crate::{
	errors::IndexerError,
	types::{BlockHash, ChainId, ExtrinsicRecord, Pubkey, StakingEventRecord, StreamKind},
};

/// Bump on any change to the persisted layout and append a migration below.
const LATEST_SCHEMA_VERSION: u32 = 1;

/// Append-only migration list; entry `i` brings the schema from version `i`
/// to `i + 1`.
const MIGRATIONS: [&str; LATEST_SCHEMA_VERSION as usize] = ["
	CREATE TABLE substrate_extrinsics (
		chain TEXT NOT NULL,
		height INTEGER NOT NULL,
		xidx INTEGER NOT NULL,
		block_hash BLOB NOT NULL,
		ts INTEGER NULL,
		signer BLOB NULL,
		module TEXT NOT NULL,
		function TEXT NOT NULL,
		success INTEGER NOT NULL,
		tip TEXT NOT NULL,
		fee TEXT NULL,
		params BLOB NOT NULL,
		matched BLOB NOT NULL,
		PRIMARY KEY (chain, height, xidx)
	);
	CREATE INDEX idx_extrinsics_matched_ts ON substrate_extrinsics (chain, matched, ts);
	CREATE TABLE substrate_staking_events (
		chain TEXT NOT NULL,
		height INTEGER NOT NULL,
		xidx INTEGER NOT NULL,
		eidx INTEGER NOT NULL,
		module TEXT NOT NULL,
		event_id TEXT NOT NULL,
		beneficiary BLOB NOT NULL,
		amount TEXT NOT NULL,
		era INTEGER NULL,
		validator BLOB NULL,
		PRIMARY KEY (chain, height, xidx, eidx)
	);
	CREATE INDEX idx_staking_beneficiary ON substrate_staking_events (chain, beneficiary, height);
	CREATE TABLE substrate_checkpoints (
		chain TEXT NOT NULL,
		pubkey BLOB NOT NULL,
		stream TEXT NOT NULL,
		height INTEGER NOT NULL,
		PRIMARY KEY (chain, pubkey, stream)
	);
"];

/// The embedded relational store. One `Store` owns one sqlite connection;
/// each session writer holds its own instance on the shared database file.
pub struct Store {
	conn: Connection,
}

impl Store {
	pub fn open(path: &Path) -> Result<Self, IndexerError> {
		let mut conn = Connection::open(path)
			.map_err(|e| IndexerError::Storage(format!("failed to open {}: {e}", path.display())))?;
		// Writers from concurrent sessions share the file; let them queue
		// instead of failing on the sqlite lock.
		conn.busy_timeout(std::time::Duration::from_secs(5))?;
		migrate(&mut conn)?;
		Ok(Self { conn })
	}

	pub fn open_in_memory() -> Result<Self, IndexerError> {
		let mut conn = Connection::open_in_memory()?;
		migrate(&mut conn)?;
		Ok(Self { conn })
	}

	pub fn transaction(&mut self) -> Result<Transaction<'_>, IndexerError> {
		Ok(self.conn.transaction()?)
	}

	/// Idempotent on the primary key; a pre-existing row keeps its fields but
	/// its matched-address set is unioned with the incoming one.
	pub fn upsert_extrinsic(
		tx: &Transaction<'_>,
		record: &ExtrinsicRecord,
	) -> Result<(), IndexerError> {
		let existing_matched: Option<String> = tx
			.query_row(
				"SELECT matched FROM substrate_extrinsics WHERE chain = ?1 AND height = ?2 AND xidx = ?3",
				params![record.chain.as_str(), record.block_height, record.extrinsic_index],
				|row| row.get(0),
			)
			.optional()?;

		let mut matched = record.matched_addresses.clone();
		if let Some(existing) = existing_matched {
			matched.extend(decode_matched(&existing)?);
		}

		tx.execute(
			"INSERT OR REPLACE INTO substrate_extrinsics
				(chain, height, xidx, block_hash, ts, signer, module, function, success, tip, fee, params, matched)
				VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
			params![
				record.chain.as_str(),
				record.block_height,
				record.extrinsic_index,
				record.block_hash.0.as_slice(),
				record.block_timestamp,
				record.signer.map(|s| s.0.to_vec()),
				record.call_module,
				record.call_function,
				record.success,
				record.tip.to_string(),
				record.fee.map(|f| f.to_string()),
				serde_json::to_vec(&record.params)
					.map_err(|e| IndexerError::Storage(format!("params not serialisable: {e}")))?,
				encode_matched(&matched),
			],
		)?;
		Ok(())
	}

	pub fn upsert_staking_event(
		tx: &Transaction<'_>,
		record: &StakingEventRecord,
	) -> Result<(), IndexerError> {
		tx.execute(
			"INSERT OR REPLACE INTO substrate_staking_events
				(chain, height, xidx, eidx, module, event_id, beneficiary, amount, era, validator)
				VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
			params![
				record.chain.as_str(),
				record.block_height,
				record.extrinsic_index,
				record.event_index,
				record.module,
				record.event_id,
				record.beneficiary.0.as_slice(),
				record.amount.to_string(),
				record.era,
				record.validator_stash.map(|v| v.0.to_vec()),
			],
		)?;
		Ok(())
	}

	/// Monotone: an advance below the stored height is a no-op, never an
	/// overwrite.
	pub fn advance_checkpoint(
		tx: &Transaction<'_>,
		chain: ChainId,
		pubkey: &Pubkey,
		stream: StreamKind,
		height: u64,
	) -> Result<(), IndexerError> {
		tx.execute(
			"INSERT INTO substrate_checkpoints (chain, pubkey, stream, height)
				VALUES (?1, ?2, ?3, ?4)
				ON CONFLICT (chain, pubkey, stream)
				DO UPDATE SET height = MAX(height, excluded.height)",
			params![chain.as_str(), pubkey.0.as_slice(), stream.as_str(), height],
		)?;
		Ok(())
	}

	pub fn checkpoint(
		&self,
		chain: ChainId,
		pubkey: &Pubkey,
		stream: StreamKind,
	) -> Result<Option<u64>, IndexerError> {
		Ok(self
			.conn
			.query_row(
				"SELECT height FROM substrate_checkpoints WHERE chain = ?1 AND pubkey = ?2 AND stream = ?3",
				params![chain.as_str(), pubkey.0.as_slice(), stream.as_str()],
				|row| row.get(0),
			)
			.optional()?)
	}

	/// Extrinsics matched to the account, newest first. Blocks without an
	/// inherent timestamp are excluded whenever a time bound is given.
	pub fn get_extrinsics(
		&self,
		chain: ChainId,
		pubkey: &Pubkey,
		from_ts: Option<i64>,
		to_ts: Option<i64>,
	) -> Result<Vec<ExtrinsicRecord>, IndexerError> {
		let mut statement = self.conn.prepare(
			"SELECT chain, height, xidx, block_hash, ts, signer, module, function, success, tip, fee, params, matched
				FROM substrate_extrinsics
				WHERE chain = ?1 AND matched LIKE ?2
					AND (?3 IS NULL OR (ts IS NOT NULL AND ts >= ?3))
					AND (?4 IS NULL OR (ts IS NOT NULL AND ts <= ?4))
				ORDER BY height DESC, xidx DESC",
		)?;
		let rows = statement.query_map(
			params![chain.as_str(), format!("%{}%", pubkey.to_hex()), from_ts, to_ts],
			extrinsic_from_row,
		)?;
		rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
	}

	pub fn get_staking_events(
		&self,
		chain: ChainId,
		pubkey: &Pubkey,
		from_height: Option<u64>,
		to_height: Option<u64>,
	) -> Result<Vec<StakingEventRecord>, IndexerError> {
		let mut statement = self.conn.prepare(
			"SELECT chain, height, xidx, eidx, module, event_id, beneficiary, amount, era, validator
				FROM substrate_staking_events
				WHERE chain = ?1 AND beneficiary = ?2
					AND (?3 IS NULL OR height >= ?3)
					AND (?4 IS NULL OR height <= ?4)
				ORDER BY height DESC, xidx DESC, eidx DESC",
		)?;
		let rows = statement.query_map(
			params![chain.as_str(), pubkey.0.as_slice(), from_height, to_height],
			staking_event_from_row,
		)?;
		rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
	}

	/// Nuclear reset. With a pubkey: drop that account's view of history and
	/// its checkpoints, leaving rows other accounts still reference. Without:
	/// wipe the chain.
	pub fn delete_history(
		&mut self,
		chain: ChainId,
		pubkey: Option<&Pubkey>,
	) -> Result<(), IndexerError> {
		let tx = self.conn.transaction()?;
		match pubkey {
			None => {
				tx.execute(
					"DELETE FROM substrate_extrinsics WHERE chain = ?1",
					params![chain.as_str()],
				)?;
				tx.execute(
					"DELETE FROM substrate_staking_events WHERE chain = ?1",
					params![chain.as_str()],
				)?;
				tx.execute(
					"DELETE FROM substrate_checkpoints WHERE chain = ?1",
					params![chain.as_str()],
				)?;
			},
			Some(pubkey) => {
				let affected: Vec<(u64, u32, String)> = {
					let mut statement = tx.prepare(
						"SELECT height, xidx, matched FROM substrate_extrinsics
							WHERE chain = ?1 AND matched LIKE ?2",
					)?;
					let rows = statement.query_map(
						params![chain.as_str(), format!("%{}%", pubkey.to_hex())],
						|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
					)?;
					rows.collect::<Result<Vec<_>, _>>()?
				};
				for (height, xidx, matched) in affected {
					let mut remaining = decode_matched(&matched)?;
					remaining.remove(pubkey);
					if remaining.is_empty() {
						tx.execute(
							"DELETE FROM substrate_extrinsics WHERE chain = ?1 AND height = ?2 AND xidx = ?3",
							params![chain.as_str(), height, xidx],
						)?;
					} else {
						tx.execute(
							"UPDATE substrate_extrinsics SET matched = ?4 WHERE chain = ?1 AND height = ?2 AND xidx = ?3",
							params![chain.as_str(), height, xidx, encode_matched(&remaining)],
						)?;
					}
				}
				tx.execute(
					"DELETE FROM substrate_staking_events WHERE chain = ?1 AND beneficiary = ?2",
					params![chain.as_str(), pubkey.0.as_slice()],
				)?;
				tx.execute(
					"DELETE FROM substrate_checkpoints WHERE chain = ?1 AND pubkey = ?2",
					params![chain.as_str(), pubkey.0.as_slice()],
				)?;
			},
		}
		tx.commit()?;
		Ok(())
	}
}

fn migrate(conn: &mut Connection) -> Result<(), IndexerError> {
	conn.execute(
		"CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
		[],
	)?;
	let version: u32 = conn
		.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
		.optional()?
		.unwrap_or(0);

	if version > LATEST_SCHEMA_VERSION {
		return Err(IndexerError::Storage(format!(
			"database schema version {version} is newer than supported {LATEST_SCHEMA_VERSION}"
		)))
	}

	for (index, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
		let tx = conn.transaction()?;
		tx.execute_batch(migration)?;
		tx.execute("DELETE FROM schema_version", [])?;
		tx.execute("INSERT INTO schema_version (version) VALUES (?1)", params![index as u32 + 1])?;
		tx.commit()?;
		info!("migrated database schema to version {}", index + 1);
	}
	Ok(())
}

/// The matched-address set is persisted as a JSON array of pubkey hex
/// strings, sorted so equal sets are byte-identical. It is bound as TEXT so
/// the address-containment queries can use `LIKE`.
fn encode_matched(matched: &BTreeSet<Pubkey>) -> String {
	serde_json::to_string(&matched.iter().map(|p| p.to_hex()).collect::<Vec<_>>())
		.expect("strings always serialise")
}

fn decode_matched(text: &str) -> Result<BTreeSet<Pubkey>, IndexerError> {
	let hexes: Vec<String> = serde_json::from_str(text)
		.map_err(|e| IndexerError::Storage(format!("corrupt matched column: {e}")))?;
	hexes.iter().map(|h| Pubkey::from_hex(h)).collect()
}

fn blob_to_pubkey(blob: Vec<u8>) -> rusqlite::Result<Pubkey> {
	let arr: [u8; 32] = blob.try_into().map_err(|_| {
		rusqlite::Error::FromSqlConversionFailure(
			32,
			rusqlite::types::Type::Blob,
			"pubkey column is not 32 bytes".into(),
		)
	})?;
	Ok(Pubkey(arr))
}

fn parse_amount_text(text: String) -> rusqlite::Result<u128> {
	text.parse::<u128>().map_err(|e| {
		rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
	})
}

fn extrinsic_from_row(row: &Row<'_>) -> rusqlite::Result<ExtrinsicRecord> {
	let chain: String = row.get(0)?;
	let block_hash: Vec<u8> = row.get(3)?;
	let signer: Option<Vec<u8>> = row.get(5)?;
	let tip: String = row.get(9)?;
	let fee: Option<String> = row.get(10)?;
	let params_blob: Vec<u8> = row.get(11)?;
	let matched_text: String = row.get(12)?;

	Ok(ExtrinsicRecord {
		chain: chain.parse().map_err(|_| {
			rusqlite::Error::FromSqlConversionFailure(
				0,
				rusqlite::types::Type::Text,
				"unknown chain".into(),
			)
		})?,
		block_height: row.get(1)?,
		extrinsic_index: row.get(2)?,
		block_hash: BlockHash(block_hash.try_into().map_err(|_| {
			rusqlite::Error::FromSqlConversionFailure(
				3,
				rusqlite::types::Type::Blob,
				"block hash is not 32 bytes".into(),
			)
		})?),
		block_timestamp: row.get(4)?,
		signer: signer.map(blob_to_pubkey).transpose()?,
		call_module: row.get(6)?,
		call_function: row.get(7)?,
		success: row.get(8)?,
		tip: parse_amount_text(tip)?,
		fee: fee.map(parse_amount_text).transpose()?,
		params: serde_json::from_slice(&params_blob).map_err(|e| {
			rusqlite::Error::FromSqlConversionFailure(
				11,
				rusqlite::types::Type::Blob,
				Box::new(e),
			)
		})?,
		matched_addresses: decode_matched(&matched_text).map_err(|e| {
			rusqlite::Error::FromSqlConversionFailure(
				12,
				rusqlite::types::Type::Blob,
				e.to_string().into(),
			)
		})?,
	})
}

fn staking_event_from_row(row: &Row<'_>) -> rusqlite::Result<StakingEventRecord> {
	let chain: String = row.get(0)?;
	let beneficiary: Vec<u8> = row.get(6)?;
	let amount: String = row.get(7)?;
	let validator: Option<Vec<u8>> = row.get(9)?;

	Ok(StakingEventRecord {
		chain: chain.parse().map_err(|_| {
			rusqlite::Error::FromSqlConversionFailure(
				0,
				rusqlite::types::Type::Text,
				"unknown chain".into(),
			)
		})?,
		block_height: row.get(1)?,
		extrinsic_index: row.get(2)?,
		event_index: row.get(3)?,
		module: row.get(4)?,
		event_id: row.get(5)?,
		beneficiary: blob_to_pubkey(beneficiary)?,
		amount: parse_amount_text(amount)?,
		era: row.get(8)?,
		validator_stash: validator.map(blob_to_pubkey).transpose()?,
	})
}
