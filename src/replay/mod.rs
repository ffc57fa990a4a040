//! Replay engine and response rendering

mod engine;
mod render;

pub use engine::ReplayEngine;
pub use render::render_response;
