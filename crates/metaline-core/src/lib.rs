//! Metaline Core - common infrastructure for the harvesting pipeline
//!
//! This crate provides the building blocks shared by the OAI-PMH harvester
//! and the enrichment stage: the framed worker channel, the bounded worker
//! pool, the retrying HTTP helper, and logging/progress plumbing.
#![feature(unix_socket_peek)]

pub mod channel;
pub mod fetch;
pub mod logging;
pub mod pool;
pub mod progress;
pub mod shutdown;

// Re-exports for convenience
pub use channel::{Channel, ChannelError};
pub use fetch::{FetchError, Fetcher, SHARED_RUNTIME, http_client};
pub use logging::{IndicatifLogger, init_logging};
pub use pool::{DEFAULT_MAX_QUEUE, InitFn, PoolError, RunFn, WorkerExit, WorkerPool};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use shutdown::{
    install_interrupt_handler, is_shutdown_requested, request_shutdown, shutdown_flag,
};
