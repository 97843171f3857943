pub mod item;
pub mod lease;
