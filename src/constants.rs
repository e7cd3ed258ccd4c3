/// Initial receive buffer size.
pub const DEFAULT_RECEIVE_CAPACITY: usize = 4 * 1024 * 1024;
/// Receive buffer growth never goes past this.
pub const MAX_RECEIVE_CAPACITY: usize = 40 * 1024 * 1024;
/// Fixed send buffer size.
pub const DEFAULT_SEND_CAPACITY: usize = 10 * 1024;
/// Sends are deferred while the transport reports at least this many unsent bytes.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 200;

// Compaction kicks in once the write position passes capacity / GROW_DIVISOR
pub const GROW_DIVISOR: usize = 8;
// Headroom multiplier when growing to fit a specific chunk
pub const FIT_MULTIPLIER: usize = 8;

/// The only subprotocol a session will negotiate.
pub const PROTOCOL_BINARY: &str = "binary";

pub const TCP_READ_CHUNK: usize = 65536;
pub const TCP_EVENT_QUEUE: usize = 1000;
pub const FLUSH_RETRY_MS: u64 = 10;
