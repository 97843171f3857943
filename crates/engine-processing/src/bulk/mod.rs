pub mod client;
pub mod response;
pub mod serialize;
