//! SS58 address codec.
//!
//! Addresses are accepted in SS58 or raw hex form at session ingress and
//! normalised to 32-byte public keys; everything downstream compares pubkeys
//! only.

use blake2::{Blake2b512, Digest};

use crate::{errors::IndexerError, types::Pubkey};

const SS58_PREFIX: &[u8] = b"SS58PRE";

/// Decode an SS58 address to its public key, checking the checksum and,
/// when `expected_prefix` is given, the network prefix.
pub fn decode(address: &str, expected_prefix: Option<u16>) -> Result<Pubkey, IndexerError> {
	let data = bs58::decode(address)
		.into_vec()
		.map_err(|e| IndexerError::BadRequest(format!("invalid SS58 address: {e}")))?;

	// One or two prefix bytes, 32 payload bytes, two checksum bytes.
	let (prefix, prefix_len) = match data.first() {
		Some(&b) if b < 64 => (b as u16, 1),
		Some(&b) if b < 128 => {
			let lower = data
				.get(1)
				.ok_or_else(|| IndexerError::BadRequest("truncated SS58 address".to_string()))?;
			let ident = ((b as u16 & 0b0011_1111) << 2) | (*lower as u16 >> 6);
			let upper = (*lower as u16) & 0b0011_1111;
			(ident | (upper << 8), 2)
		},
		_ => return Err(IndexerError::BadRequest("invalid SS58 prefix".to_string())),
	};

	if data.len() != prefix_len + 32 + 2 {
		return Err(IndexerError::BadRequest(format!(
			"unexpected SS58 payload length {}",
			data.len()
		)))
	}

	let (body, checksum) = data.split_at(data.len() - 2);
	let mut hasher = Blake2b512::new();
	hasher.update(SS58_PREFIX);
	hasher.update(body);
	if hasher.finalize()[..2] != *checksum {
		return Err(IndexerError::BadRequest("SS58 checksum mismatch".to_string()))
	}

	if let Some(expected) = expected_prefix {
		if prefix != expected {
			return Err(IndexerError::BadRequest(format!(
				"SS58 prefix {prefix} does not match chain prefix {expected}"
			)))
		}
	}

	let mut pubkey = [0u8; 32];
	pubkey.copy_from_slice(&body[prefix_len..]);
	Ok(Pubkey(pubkey))
}

/// Encode a public key for the given network prefix. Only used for
/// human-facing output; storage and matching stay in pubkey form.
pub fn encode(pubkey: &Pubkey, prefix: u16) -> String {
	let mut data = Vec::with_capacity(35);
	if prefix < 64 {
		data.push(prefix as u8);
	} else {
		let ident = prefix & 0b0011_1111_1111_1111;
		data.push(((ident & 0b0000_0000_1111_1100) >> 2) as u8 | 0b0100_0000);
		data.push(((ident >> 8) as u8) | ((ident & 0b0000_0000_0000_0011) as u8) << 6);
	}
	data.extend_from_slice(&pubkey.0);

	let mut hasher = Blake2b512::new();
	hasher.update(SS58_PREFIX);
	hasher.update(&data);
	data.extend_from_slice(&hasher.finalize()[..2]);

	bs58::encode(data).into_string()
}

/// Parse either form a client may hand us: `0x…` hex or SS58.
pub fn parse_account(address: &str, prefix: u16) -> Result<Pubkey, IndexerError> {
	if address.starts_with("0x") {
		Pubkey::from_hex(address)
	} else {
		decode(address, Some(prefix))
	}
}
