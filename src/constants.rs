use std::time::Duration;

// ======= Chain client =======

/// Average block time on the Dotsama relay chains.
pub const SUBSTRATE_AVERAGE_BLOCK_TIME: Duration = Duration::from_secs(6);

/// Upper bound on concurrently outstanding node requests per chain.
pub const RPC_POOL_SIZE: usize = 16;

/// Token bucket refill rate for the node connection, requests per second.
pub const RPC_RATE_LIMIT_PER_SEC: f64 = 50.0;

/// Applied to every individual node request.
pub const RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Capacity of the process-wide block-hash-by-height cache.
pub const HASH_CACHE_CAPACITY: usize = 4096;

// ======= Indexer worker =======

/// Number of block heights planned into one fetch window.
pub const FETCH_WINDOW_SIZE: u64 = 256;

/// Concurrent block fetches per worker.
pub const FETCH_PARALLELISM: usize = 8;

/// Fetch attempts per height before the worker escalates.
pub const FETCH_MAX_ATTEMPTS: u32 = 5;

pub const FETCH_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const FETCH_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// End-to-end budget for fetching and filtering a single block.
pub const BLOCK_DEADLINE: Duration = Duration::from_secs(60);

/// A checkpoint marker is emitted at least every this many contiguous blocks.
pub const CHECKPOINT_BLOCK_INTERVAL: u64 = 64;

/// ... and at least this often while progress is being made.
pub const CHECKPOINT_TIME_INTERVAL: Duration = Duration::from_secs(5);

/// Utility.batch nesting beyond this depth is classified as `Other`.
pub const BATCH_DEPTH_CAP: u8 = 8;

// ======= Writer =======

/// Records in flight between a worker and its session writer.
pub const WRITER_CHANNEL_CAPACITY: usize = 1024;

// ======= Session controller =======

/// How long a stopping session waits for its workers before detaching them.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Sliding window used for the blocks-per-second rate in status reports.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Errors are counted towards status over this window.
pub const ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Buffered progress events per session before the oldest are dropped.
pub const EVENT_BUFFER_SIZE: usize = 1024;

// ======= Settings environment variables =======

/// Base path for the settings file.
pub const CONFIG_ROOT: &str = "INDEXER_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = ".";
