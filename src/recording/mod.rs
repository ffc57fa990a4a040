//! Recording engine for capturing upstream traffic

mod decode;
mod engine;

pub use decode::{read_decoded_body, ContentCoding};
pub use engine::{Recording, RecordingEngine};
