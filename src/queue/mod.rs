//! Durable queue for writes that could not reach the origin.
//!
//! Items are persisted before `enqueue` returns and survive process
//! termination. Replay drains pending items strictly in creation order,
//! one at a time, with exponential backoff between attempts and a bounded
//! attempt budget; exhausted items are surfaced, never silently dropped.

mod replay;
mod store;

pub use replay::{OfflineQueue, QueueConfig, ReplayReport};
pub use store::{MemoryQueueStore, QueueStore, QueuedWrite, SqliteQueueStore, WriteStatus};
