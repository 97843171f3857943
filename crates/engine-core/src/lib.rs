pub mod clock;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod progress;
pub mod retry;
