//! Proxy integration for recording and replay

mod http;

pub use http::FixtureProxy;
