pub mod error;
pub mod http;
pub mod source;
pub mod transport;
