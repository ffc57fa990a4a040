//! Fixture storage: file layout and text format

pub mod format;
mod store;

pub use format::{decode_collection, encode_collection, BodyEncoding};
pub use store::FixtureStore;

/// File extension of fixture files
pub const FIXTURE_EXTENSION: &str = "yaml";
