pub mod coordinator;
pub mod error;
pub mod setup;
pub mod worker;
