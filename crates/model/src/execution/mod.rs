pub mod failed_document;
pub mod outcome;
