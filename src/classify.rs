//! Extrinsic classification.
//!
//! Takes one decoded extrinsic together with the events it emitted and tags
//! it with the call categories the portfolio cares about. Utility batches are
//! recursed into up to a fixed depth; each inner call is classified as if it
//! stood alone but stays attached to the outer extrinsic index.

use serde_json::Value;
use tracing::warn;

use crate::{
	constants::BATCH_DEPTH_CAP,
	rpc::{RawBlock, RawEvent, RawExtrinsic},
	types::{BlockHash, ChainId, Pubkey, StakingEventRecord},
};

pub const BALANCES_TRANSFER_FUNCTIONS: [&str; 3] =
	["transfer", "transfer_keep_alive", "transfer_all"];

pub const STAKING_CALL_FUNCTIONS: [&str; 9] = [
	"bond",
	"bond_extra",
	"unbond",
	"nominate",
	"chill",
	"payout_stakers",
	"withdraw_unbonded",
	"set_controller",
	"set_payee",
];

const STAKING_EVENT_IDS: [&str; 7] =
	["Reward", "Rewarded", "Bonded", "Unbonded", "Nominated", "Slashed", "Withdrawn"];

#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
	pub chain: ChainId,
	pub height: u64,
	pub hash: BlockHash,
	pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
	/// Block-author inserted, e.g. `Timestamp.set`. Never persisted.
	Inherent,
	BalanceTransfer { to: Option<Pubkey>, value: u128 },
	StakingCall,
	/// `Utility.batch`/`batch_all` wrapper; the inner calls follow it in the
	/// flattened call list.
	Batch,
	Other,
}

#[derive(Debug, Clone)]
pub struct ClassifiedCall {
	pub module: String,
	pub function: String,
	pub kind: CallKind,
	pub args: Value,
}

#[derive(Debug, Clone)]
pub struct ClassifiedExtrinsic {
	pub index: u32,
	pub signer: Option<Pubkey>,
	pub success: bool,
	pub tip: u128,
	pub fee: Option<u128>,
	/// Outer call first, batch inner calls flattened behind it.
	pub calls: Vec<ClassifiedCall>,
	pub events: Vec<RawEvent>,
	/// Inner calls that could not be decoded. They are skipped, never fatal;
	/// the worker feeds this into its error side channel.
	pub decode_errors: u32,
}

impl ClassifiedExtrinsic {
	/// Whether any call falls into a category that is indexed on its own
	/// merits. Unclassified extrinsics are only retained on an event match.
	pub fn is_classified(&self) -> bool {
		self.calls.iter().any(|call| {
			matches!(
				call.kind,
				CallKind::BalanceTransfer { .. } | CallKind::StakingCall | CallKind::Batch
			)
		})
	}

	pub fn is_inherent(&self) -> bool {
		self.calls.iter().all(|call| call.kind == CallKind::Inherent)
	}
}

/// Timestamp of a block, read from the `Timestamp.set` inherent at index 0.
/// Absent inherent means the block legitimately carries no timestamp.
pub fn block_timestamp(block: &RawBlock) -> Option<i64> {
	let first = block.extrinsics.first()?;
	if first.index == 0 &&
		first.signer.is_none() &&
		first.module == "Timestamp" &&
		first.function == "set"
	{
		parse_amount(first.args.get("now")?).map(|now| now as i64)
	} else {
		None
	}
}

pub fn classify_extrinsic(extrinsic: &RawExtrinsic, events: &[RawEvent]) -> ClassifiedExtrinsic {
	let mut calls = Vec::new();
	let mut decode_errors = 0;
	classify_call(
		&extrinsic.module,
		&extrinsic.function,
		&extrinsic.args,
		extrinsic.signer.is_none() && extrinsic.index == 0,
		0,
		&mut calls,
		&mut decode_errors,
	);

	ClassifiedExtrinsic {
		index: extrinsic.index,
		signer: extrinsic.signer,
		success: extrinsic.success,
		tip: extrinsic.tip,
		fee: compute_fee(extrinsic, events),
		calls,
		events: events.to_vec(),
		decode_errors,
	}
}

fn classify_call(
	module: &str,
	function: &str,
	args: &Value,
	inherent_position: bool,
	depth: u8,
	out: &mut Vec<ClassifiedCall>,
	decode_errors: &mut u32,
) {
	let kind = match (module, function) {
		("Timestamp", "set") if inherent_position => CallKind::Inherent,
		("Balances", f) if BALANCES_TRANSFER_FUNCTIONS.contains(&f) =>
			CallKind::BalanceTransfer {
				to: args.get("dest").and_then(lookup_account),
				value: args.get("value").and_then(parse_amount).unwrap_or_default(),
			},
		("Staking", f) if STAKING_CALL_FUNCTIONS.contains(&f) => CallKind::StakingCall,
		("Utility", "batch" | "batch_all") => {
			if depth >= BATCH_DEPTH_CAP {
				warn!(module, function, depth, "batch nesting beyond cap, classifying as Other");
				CallKind::Other
			} else {
				CallKind::Batch
			}
		},
		_ => CallKind::Other,
	};

	let recurse = kind == CallKind::Batch;
	out.push(ClassifiedCall {
		module: module.to_string(),
		function: function.to_string(),
		kind,
		args: args.clone(),
	});

	if recurse {
		for inner in args.get("calls").and_then(Value::as_array).into_iter().flatten() {
			let (Some(inner_module), Some(inner_function)) = (
				inner.get("module").and_then(Value::as_str),
				inner.get("function").and_then(Value::as_str),
			) else {
				warn!("malformed inner call in batch, skipping");
				*decode_errors += 1;
				continue
			};
			let inner_args = inner.get("args").cloned().unwrap_or(Value::Null);
			classify_call(
				inner_module,
				inner_function,
				&inner_args,
				false,
				depth + 1,
				out,
				decode_errors,
			);
		}
	}
}

/// Fee paid by the extrinsic: deposits to accounts other than the signer
/// (author and treasury shares) plus the tip. `None` when the events carry
/// no deposit at all, which is distinct from a zero fee.
pub fn compute_fee(extrinsic: &RawExtrinsic, events: &[RawEvent]) -> Option<u128> {
	let signer = extrinsic.signer?;

	let mut found_deposit = false;
	let mut fee: u128 = 0;
	for event in events {
		let is_deposit = (event.module == "Balances" || event.module == "Treasury") &&
			event.event_id == "Deposit";
		if !is_deposit {
			continue
		}
		let beneficiary = event_param_account(&event.params, 0, "who");
		if beneficiary == Some(signer) {
			continue
		}
		if let Some(amount) =
			event_param_amount(&event.params, if beneficiary.is_some() { 1 } else { 0 }, "amount")
		{
			found_deposit = true;
			fee = fee.saturating_add(amount);
		}
	}

	found_deposit.then(|| fee.saturating_add(extrinsic.tip))
}

/// Staking events of one extrinsic, one record per (event, beneficiary).
/// Era and validator are resolved from the enclosing `payout_stakers` call
/// when there is one.
pub fn staking_events(
	context: &BlockContext,
	extrinsic: &ClassifiedExtrinsic,
) -> Vec<StakingEventRecord> {
	let payout = extrinsic
		.calls
		.iter()
		.find(|call| call.module == "Staking" && call.function == "payout_stakers");
	let era = payout.and_then(|call| {
		call.args.get("era").and_then(parse_amount).and_then(|era| u32::try_from(era).ok())
	});
	let validator_stash =
		payout.and_then(|call| call.args.get("validator_stash").and_then(lookup_account));

	extrinsic
		.events
		.iter()
		.filter(|event| {
			event.module == "Staking" && STAKING_EVENT_IDS.contains(&event.event_id.as_str())
		})
		.filter_map(|event| {
			let beneficiary = event_param_account(&event.params, 0, "stash")
				.or_else(|| event_param_account(&event.params, 0, "who"))?;
			Some(StakingEventRecord {
				chain: context.chain,
				block_height: context.height,
				extrinsic_index: extrinsic.index,
				event_index: event.event_index,
				module: event.module.clone(),
				event_id: event.event_id.clone(),
				beneficiary,
				amount: event_param_amount(&event.params, 1, "amount").unwrap_or_default(),
				era,
				validator_stash,
			})
		})
		.collect()
}

/// Account reference in a decoded argument tree: either a bare pubkey hex
/// string or the `LookupSource` object form `{"Id": "0x…"}`.
pub fn lookup_account(value: &Value) -> Option<Pubkey> {
	match value {
		Value::String(s) => Pubkey::from_hex(s).ok(),
		Value::Object(map) => map.get("Id").and_then(lookup_account),
		_ => None,
	}
}

/// Amounts appear as JSON numbers or as decimal strings depending on the
/// decoder; both are accepted, floats are not.
pub fn parse_amount(value: &Value) -> Option<u128> {
	match value {
		Value::Number(n) => n.as_u64().map(u128::from),
		Value::String(s) => s.parse::<u128>().ok(),
		_ => None,
	}
}

fn event_param(params: &Value, position: usize, name: &str) -> Option<Value> {
	match params {
		Value::Array(items) => items.get(position).cloned(),
		Value::Object(map) => map.get(name).cloned(),
		_ => None,
	}
}

pub fn event_param_account(params: &Value, position: usize, name: &str) -> Option<Pubkey> {
	event_param(params, position, name).as_ref().and_then(lookup_account)
}

pub fn event_param_amount(params: &Value, position: usize, name: &str) -> Option<u128> {
	event_param(params, position, name).as_ref().and_then(parse_amount)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{
		balances_deposit, block_context, raw_extrinsic, staking_reward_event, ALICE, BOB, FERDIE,
	};
	use serde_json::json;

	#[test]
	fn classifies_balance_transfer() {
		let extrinsic = raw_extrinsic(
			1,
			Some(ALICE),
			"Balances",
			"transfer_keep_alive",
			json!({ "dest": { "Id": BOB.to_hex() }, "value": "2000000000000" }),
		);
		let classified = classify_extrinsic(&extrinsic, &[]);

		assert!(classified.is_classified());
		assert_eq!(classified.calls.len(), 1);
		assert_eq!(
			classified.calls[0].kind,
			CallKind::BalanceTransfer { to: Some(BOB), value: 2_000_000_000_000 }
		);
	}

	#[test]
	fn classifies_staking_calls() {
		for function in STAKING_CALL_FUNCTIONS {
			let extrinsic =
				raw_extrinsic(1, Some(ALICE), "Staking", function, json!({ "era": 100 }));
			let classified = classify_extrinsic(&extrinsic, &[]);
			assert_eq!(classified.calls[0].kind, CallKind::StakingCall, "{function}");
		}
	}

	#[test]
	fn timestamp_inherent_is_not_a_record() {
		let extrinsic =
			raw_extrinsic(0, None, "Timestamp", "set", json!({ "now": "1621400000000" }));
		let classified = classify_extrinsic(&extrinsic, &[]);
		assert!(classified.is_inherent());
		assert!(!classified.is_classified());
	}

	#[test]
	fn block_timestamp_from_index_zero_inherent() {
		let block = RawBlock {
			height: 100,
			hash: BlockHash([9; 32]),
			parent_hash: BlockHash([8; 32]),
			extrinsics: vec![raw_extrinsic(
				0,
				None,
				"Timestamp",
				"set",
				json!({ "now": "1621400000000" }),
			)],
		};
		assert_eq!(block_timestamp(&block), Some(1_621_400_000_000));

		let no_inherent = RawBlock { extrinsics: vec![], ..block };
		assert_eq!(block_timestamp(&no_inherent), None);
	}

	#[test]
	fn batch_flattens_inner_calls() {
		let extrinsic = raw_extrinsic(
			2,
			Some(ALICE),
			"Utility",
			"batch",
			json!({ "calls": [
				{ "module": "Staking", "function": "payout_stakers",
				  "args": { "validator_stash": FERDIE.to_hex(), "era": 2000 } },
				{ "module": "Balances", "function": "transfer",
				  "args": { "dest": BOB.to_hex(), "value": 5 } },
			] }),
		);
		let classified = classify_extrinsic(&extrinsic, &[]);

		let kinds: Vec<_> = classified.calls.iter().map(|c| &c.kind).collect();
		assert_eq!(kinds.len(), 3);
		assert_eq!(*kinds[0], CallKind::Batch);
		assert_eq!(*kinds[1], CallKind::StakingCall);
		assert_eq!(*kinds[2], CallKind::BalanceTransfer { to: Some(BOB), value: 5 });
	}

	#[test]
	fn batch_nesting_beyond_cap_becomes_other() {
		let mut call = json!({ "module": "Balances", "function": "transfer",
			"args": { "dest": BOB.to_hex(), "value": 1 } });
		for _ in 0..=BATCH_DEPTH_CAP {
			call = json!({ "module": "Utility", "function": "batch",
				"args": { "calls": [call] } });
		}
		let args = call.get("args").cloned().unwrap();
		let extrinsic = raw_extrinsic(1, Some(ALICE), "Utility", "batch", args);
		let classified = classify_extrinsic(&extrinsic, &[]);

		// The innermost wrapper hits the cap and is not recursed into, so no
		// transfer surfaces.
		assert!(classified
			.calls
			.iter()
			.all(|c| !matches!(c.kind, CallKind::BalanceTransfer { .. })));
		assert!(classified.calls.iter().any(|c| c.kind == CallKind::Other));
		// Hitting the cap is a policy decision, not a decode failure.
		assert_eq!(classified.decode_errors, 0);
	}

	#[test]
	fn malformed_inner_call_is_counted_and_skipped() {
		let extrinsic = raw_extrinsic(
			1,
			Some(ALICE),
			"Utility",
			"batch",
			json!({ "calls": [
				{ "bogus": true },
				{ "module": "Balances", "function": "transfer",
				  "args": { "dest": BOB.to_hex(), "value": 5 } },
			] }),
		);
		let classified = classify_extrinsic(&extrinsic, &[]);

		assert_eq!(classified.decode_errors, 1);
		// The well-formed sibling call still classifies.
		assert!(classified
			.calls
			.iter()
			.any(|c| matches!(c.kind, CallKind::BalanceTransfer { .. })));
	}

	#[test]
	fn fee_sums_foreign_deposits_plus_tip() {
		let extrinsic = raw_extrinsic(
			1,
			Some(ALICE),
			"Balances",
			"transfer",
			json!({ "dest": BOB.to_hex(), "value": 10 }),
		);
		let mut extrinsic = extrinsic;
		extrinsic.tip = 25;

		let events = vec![
			// Refund deposit back to the signer must not count.
			balances_deposit(1, 0, ALICE, 999),
			balances_deposit(1, 1, FERDIE, 1_000_000),
			RawEvent {
				extrinsic_index: Some(1),
				event_index: 2,
				module: "Treasury".to_string(),
				event_id: "Deposit".to_string(),
				params: json!([ "2400000" ]),
			},
		];
		assert_eq!(compute_fee(&extrinsic, &events), Some(1_000_000 + 2_400_000 + 25));
	}

	#[test]
	fn fee_unknown_without_deposit_events() {
		let extrinsic = raw_extrinsic(
			1,
			Some(ALICE),
			"Balances",
			"transfer",
			json!({ "dest": BOB.to_hex(), "value": 10 }),
		);
		assert_eq!(compute_fee(&extrinsic, &[]), None);
	}

	#[test]
	fn staking_reward_resolves_era_from_enclosing_payout() {
		let extrinsic = raw_extrinsic(
			2,
			Some(ALICE),
			"Utility",
			"batch",
			json!({ "calls": [
				{ "module": "Staking", "function": "payout_stakers",
				  "args": { "validator_stash": FERDIE.to_hex(), "era": 2000 } },
			] }),
		);
		let events = vec![staking_reward_event(2, 0, BOB, 56_754_728_805)];
		let classified = classify_extrinsic(&extrinsic, &events);
		let records = staking_events(&block_context(100), &classified);

		assert_eq!(records.len(), 1);
		assert_eq!(records[0].beneficiary, BOB);
		assert_eq!(records[0].amount, 56_754_728_805);
		assert_eq!(records[0].era, Some(2000));
		assert_eq!(records[0].validator_stash, Some(FERDIE));
	}
}
