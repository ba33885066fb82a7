//! Address filter.
//!
//! Decides which of a session's watched accounts an extrinsic is of interest
//! to. An extrinsic in a classified category matches on its signer or on any
//! account referenced anywhere in its (flattened) call arguments; any
//! extrinsic additionally matches on accounts appearing in its events, which
//! covers staking payouts submitted by third parties.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::{classify::ClassifiedExtrinsic, types::Pubkey};

/// The subset of `watched` this extrinsic pertains to. Empty means the
/// extrinsic is dropped. Inherents never match.
pub fn matched_addresses(
	extrinsic: &ClassifiedExtrinsic,
	watched: &BTreeSet<Pubkey>,
) -> BTreeSet<Pubkey> {
	let mut matched = BTreeSet::new();
	if watched.is_empty() || extrinsic.is_inherent() {
		return matched
	}

	if extrinsic.is_classified() {
		if let Some(signer) = extrinsic.signer {
			if watched.contains(&signer) {
				matched.insert(signer);
			}
		}
		for call in &extrinsic.calls {
			collect_accounts(&call.args, watched, &mut matched);
		}
	}

	for event in &extrinsic.events {
		collect_accounts(&event.params, watched, &mut matched);
	}

	matched
}

/// Walk a decoded tree and pick out every watched account identifier.
/// Account references are 32-byte hex strings after ingress normalisation.
fn collect_accounts(value: &Value, watched: &BTreeSet<Pubkey>, out: &mut BTreeSet<Pubkey>) {
	match value {
		Value::String(s) => {
			if s.len() == 66 && s.starts_with("0x") {
				if let Ok(pubkey) = Pubkey::from_hex(s) {
					if watched.contains(&pubkey) {
						out.insert(pubkey);
					}
				}
			}
		},
		Value::Array(items) =>
			items.iter().for_each(|item| collect_accounts(item, watched, out)),
		Value::Object(map) =>
			map.values().for_each(|item| collect_accounts(item, watched, out)),
		_ => {},
	}
}
