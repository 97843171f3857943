pub mod batch;
pub mod document;
