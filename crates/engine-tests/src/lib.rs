#![allow(dead_code)]

pub mod utils;

/// Snapshot name shared by every scenario.
pub const SNAPSHOT: &str = "snap-2024";
/// Source index shared by every scenario.
pub const INDEX: &str = "logs";
