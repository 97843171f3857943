pub mod identifiers;
pub mod version;
