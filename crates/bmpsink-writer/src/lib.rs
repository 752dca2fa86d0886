//! bmpsink writer
//!
//! Everything between the ingestion loop and the storage handler: the
//! bounded hand-off queue, the per-category writer pools with sticky
//! routing, and the batching writer workers.

pub mod handoff;
pub mod keepalive;
pub mod merge;
pub mod pool;
pub mod worker;

pub use handoff::HandoffQueue;
pub use keepalive::{KeepAlive, NoKeepAlive};
pub use merge::MergeBuffer;
pub use pool::{CategoryPool, PoolConfig, WorkerSlot, WorkerState, WriterPool};
pub use worker::{IMMEDIATE_RETRIES, MAX_VALUE_LEN, WriterConfig, WriterHandle, WriterWorker};
