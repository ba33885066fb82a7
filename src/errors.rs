use serde::{Deserialize, Serialize};

/// Error taxonomy shared by the chain client, the workers and the writer.
///
/// The class decides the escalation path: `Transient` is retried with
/// backoff, `Protocol` and `NotFound` stop the worker, `Storage` stops the
/// whole session, `Cancelled` is swallowed.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
	#[error("transient: {0}")]
	Transient(String),
	#[error("protocol: {0}")]
	Protocol(String),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("storage: {0}")]
	Storage(String),
	#[error("cancelled")]
	Cancelled,
	#[error("bad request: {0}")]
	BadRequest(String),
	#[error("fatal: {0}")]
	Fatal(String),
}

impl IndexerError {
	pub fn is_transient(&self) -> bool {
		matches!(self, IndexerError::Transient(_))
	}

	pub fn code(&self) -> ErrorCode {
		match self {
			IndexerError::Transient(_) => ErrorCode::RpcTransient,
			IndexerError::Protocol(_) => ErrorCode::RpcProtocol,
			IndexerError::NotFound(_) => ErrorCode::RpcProtocol,
			IndexerError::Storage(_) => ErrorCode::Storage,
			IndexerError::Cancelled => ErrorCode::Cancelled,
			IndexerError::BadRequest(_) => ErrorCode::BadRequest,
			IndexerError::Fatal(_) => ErrorCode::Unknown,
		}
	}
}

impl From<rusqlite::Error> for IndexerError {
	fn from(e: rusqlite::Error) -> Self {
		IndexerError::Storage(e.to_string())
	}
}

/// Wire-level error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
	#[serde(rename = "E_RPC_TRANSIENT")]
	RpcTransient,
	#[serde(rename = "E_RPC_PROTOCOL")]
	RpcProtocol,
	#[serde(rename = "E_DECODE")]
	Decode,
	#[serde(rename = "E_STORAGE")]
	Storage,
	#[serde(rename = "E_CANCELLED")]
	Cancelled,
	#[serde(rename = "E_BAD_REQUEST")]
	BadRequest,
	#[serde(rename = "E_UNKNOWN")]
	Unknown,
}
