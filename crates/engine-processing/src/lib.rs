pub mod batcher;
pub mod bulk;
pub mod config;
pub mod error;
pub mod failed_writer;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod writer_pool;
