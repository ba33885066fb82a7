use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::{
	constants::{HASH_CACHE_CAPACITY, RPC_POOL_SIZE, RPC_RATE_LIMIT_PER_SEC},
	errors::IndexerError,
	rpc::{ChainRpcApi, RawBlock, RawEvent},
	types::{BlockHash, Pubkey},
};

/// Process-wide block-hash-by-height cache. Hashes at or below the finality
/// cutoff never change, so entries are never invalidated, only evicted.
pub struct HashCache {
	inner: Mutex<HashCacheInner>,
}

struct HashCacheInner {
	entries: HashMap<u64, (BlockHash, u64)>,
	by_use: BTreeMap<u64, u64>,
	next_stamp: u64,
	capacity: usize,
}

impl HashCache {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Mutex::new(HashCacheInner {
				entries: HashMap::new(),
				by_use: BTreeMap::new(),
				next_stamp: 0,
				capacity,
			}),
		}
	}

	pub fn get(&self, height: u64) -> Option<BlockHash> {
		let mut inner = self.inner.lock().unwrap();
		let stamp = inner.next_stamp;
		inner.next_stamp += 1;
		let (hash, old_stamp) = inner.entries.get_mut(&height).map(|e| {
			let old = e.1;
			e.1 = stamp;
			(e.0, old)
		})?;
		inner.by_use.remove(&old_stamp);
		inner.by_use.insert(stamp, height);
		Some(hash)
	}

	pub fn insert(&self, height: u64, hash: BlockHash) {
		let mut inner = self.inner.lock().unwrap();
		let stamp = inner.next_stamp;
		inner.next_stamp += 1;
		if let Some((_, old_stamp)) = inner.entries.insert(height, (hash, stamp)) {
			inner.by_use.remove(&old_stamp);
		}
		inner.by_use.insert(stamp, height);
		while inner.entries.len() > inner.capacity {
			let (_, oldest_height) = inner.by_use.pop_first().expect("cache is non-empty");
			inner.entries.remove(&oldest_height);
		}
	}
}

impl Default for HashCache {
	fn default() -> Self {
		Self::new(HASH_CACHE_CAPACITY)
	}
}

struct TokenBucket {
	tokens: f64,
	last_refill: std::time::Instant,
}

/// Shared per-chain node client: bounds concurrent requests with a fair
/// semaphore, smooths bursts with a token bucket (excess callers queue, they
/// are never rejected), and caches hash lookups.
pub struct ChainClient<C> {
	inner: C,
	permits: Semaphore,
	bucket: Mutex<TokenBucket>,
	rate_per_sec: f64,
	hash_cache: Arc<HashCache>,
}

impl<C: ChainRpcApi> ChainClient<C> {
	pub fn new(inner: C, hash_cache: Arc<HashCache>) -> Self {
		Self::with_limits(inner, hash_cache, RPC_POOL_SIZE, RPC_RATE_LIMIT_PER_SEC)
	}

	pub fn with_limits(
		inner: C,
		hash_cache: Arc<HashCache>,
		pool_size: usize,
		rate_per_sec: f64,
	) -> Self {
		Self {
			inner,
			permits: Semaphore::new(pool_size),
			bucket: Mutex::new(TokenBucket {
				tokens: rate_per_sec,
				last_refill: std::time::Instant::now(),
			}),
			rate_per_sec,
			hash_cache,
		}
	}

	async fn throttle(&self) {
		loop {
			let wait = {
				let mut bucket = self.bucket.lock().unwrap();
				let elapsed = bucket.last_refill.elapsed().as_secs_f64();
				bucket.tokens =
					(bucket.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
				bucket.last_refill = std::time::Instant::now();
				if bucket.tokens >= 1.0 {
					bucket.tokens -= 1.0;
					return
				}
				Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_sec)
			};
			trace!("rate limited, waiting {wait:?}");
			tokio::time::sleep(wait).await;
		}
	}

	async fn acquire(&self) -> tokio::sync::SemaphorePermit<'_> {
		let permit = self.permits.acquire().await.expect("semaphore is never closed");
		self.throttle().await;
		permit
	}
}

#[async_trait]
impl<C: ChainRpcApi> ChainRpcApi for ChainClient<C> {
	async fn head_height(&self) -> Result<u64, IndexerError> {
		let _permit = self.acquire().await;
		self.inner.head_height().await
	}

	async fn hash_at(&self, height: u64) -> Result<BlockHash, IndexerError> {
		if let Some(hash) = self.hash_cache.get(height) {
			return Ok(hash)
		}
		let _permit = self.acquire().await;
		let hash = self.inner.hash_at(height).await?;
		self.hash_cache.insert(height, hash);
		Ok(hash)
	}

	async fn block(&self, height: u64) -> Result<RawBlock, IndexerError> {
		let _permit = self.acquire().await;
		let block = self.inner.block(height).await?;
		self.hash_cache.insert(height, block.hash);
		Ok(block)
	}

	async fn events(&self, height: u64) -> Result<Vec<RawEvent>, IndexerError> {
		let _permit = self.acquire().await;
		self.inner.events(height).await
	}

	async fn account_creation_height(
		&self,
		pubkey: &Pubkey,
	) -> Result<Option<u64>, IndexerError> {
		let _permit = self.acquire().await;
		self.inner.account_creation_height(pubkey).await
	}
}
