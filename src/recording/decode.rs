//! Streaming decode of upstream response bodies

use std::fmt::Display;
use std::io::Write;

use bytes::Buf;
use flate2::write::GzDecoder;
use flate2::{Decompress, FlushDecompress, Status};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderMap, CONTENT_ENCODING};

use crate::{Result, TapedeckError};

/// Output space reserved per inflate call
const INFLATE_CHUNK: usize = 32 * 1024;

/// Content coding of an upstream response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    /// No coding
    Identity,
    /// `gzip` or `x-gzip`
    Gzip,
    /// `deflate` (zlib-wrapped)
    Deflate,
}

impl ContentCoding {
    /// Codings the decoder understands, as sent in `accept-encoding`
    pub const ACCEPTED: &'static str = "gzip, deflate";

    /// Read the coding from response headers
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::Upstream`] for codings that cannot be decoded,
    /// including stacked codings such as `gzip, br`
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let Some(value) = headers.get(CONTENT_ENCODING) else {
            return Ok(Self::Identity);
        };

        let value = value
            .to_str()
            .map_err(|e| TapedeckError::Upstream(format!("Invalid content-encoding: {e}")))?;

        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "gzip" | "x-gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            other => Err(TapedeckError::Upstream(format!(
                "Unsupported content-encoding '{other}'"
            ))),
        }
    }
}

/// Incremental decoder fed one body chunk at a time
enum BodyDecoder {
    Identity(Vec<u8>),
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(Inflater),
}

impl BodyDecoder {
    fn new(coding: ContentCoding) -> Self {
        match coding {
            ContentCoding::Identity => Self::Identity(Vec::new()),
            ContentCoding::Gzip => Self::Gzip(GzDecoder::new(Vec::new())),
            ContentCoding::Deflate => Self::Deflate(Inflater::new()),
        }
    }

    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            Self::Identity(buffer) => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            Self::Gzip(decoder) => decoder.write_all(chunk).map_err(corrupt),
            Self::Deflate(inflater) => inflater.write(chunk),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Identity(buffer) => buffer.len(),
            Self::Gzip(decoder) => decoder.get_ref().len(),
            Self::Deflate(inflater) => inflater.output.len(),
        }
    }

    fn finish(self) -> Result<Vec<u8>> {
        match self {
            Self::Identity(buffer) => Ok(buffer),
            Self::Gzip(decoder) => decoder.finish().map_err(corrupt),
            Self::Deflate(inflater) => inflater.finish(),
        }
    }
}

/// zlib stream decoder that knows whether the stream reached its end
///
/// A zlib stream has no length prefix, so a body cut short decodes cleanly up
/// to the cut. Only reaching the end-of-stream marker proves it is complete.
struct Inflater {
    stream: Decompress,
    output: Vec<u8>,
    ended: bool,
}

impl Inflater {
    fn new() -> Self {
        Self {
            stream: Decompress::new(true),
            output: Vec::new(),
            ended: false,
        }
    }

    fn write(&mut self, mut input: &[u8]) -> Result<()> {
        while !self.ended {
            self.output.reserve(INFLATE_CHUNK);

            let before = self.stream.total_in();
            let status = self
                .stream
                .decompress_vec(input, &mut self.output, FlushDecompress::None)
                .map_err(|e| corrupt(e.into()))?;
            let consumed = (self.stream.total_in() - before) as usize;
            input = &input[consumed..];

            match status {
                Status::StreamEnd => self.ended = true,
                Status::Ok | Status::BufError => {
                    // input used up and output not full: nothing left to emit
                    if input.is_empty() && self.output.len() < self.output.capacity() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>> {
        if !self.ended {
            return Err(TapedeckError::Upstream(format!(
                "Failed to decode response body: deflate stream ended after {} bytes",
                self.stream.total_in()
            )));
        }

        Ok(self.output)
    }
}

fn corrupt(e: std::io::Error) -> TapedeckError {
    TapedeckError::Upstream(format!("Failed to decode response body: {e}"))
}

fn too_large(limit: usize) -> TapedeckError {
    TapedeckError::Upstream(format!("Response body exceeds {limit} bytes"))
}

/// Read a whole response body, decoding it while it streams in
///
/// Completes once, when the body signals its end. A stream error (for example
/// the connection closing before `content-length` bytes arrived) or a
/// truncated compressed stream fails the read; no partial body is returned.
///
/// # Errors
///
/// Returns [`TapedeckError::Upstream`] on stream or decode failures, and once
/// the decoded body exceeds `limit`
pub async fn read_decoded_body<B>(
    mut body: B,
    coding: ContentCoding,
    limit: usize,
) -> Result<Vec<u8>>
where
    B: Body + Unpin,
    B::Error: Display,
{
    let mut decoder = BodyDecoder::new(coding);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| {
            TapedeckError::Upstream(format!("Response body ended prematurely: {e}"))
        })?;

        // trailers carry no body bytes
        let Ok(mut data) = frame.into_data() else {
            continue;
        };

        while data.has_remaining() {
            let chunk = data.chunk();
            let read = chunk.len();
            decoder.write(chunk)?;
            data.advance(read);
        }

        if decoder.len() > limit {
            return Err(too_large(limit));
        }
    }

    let decoded = decoder.finish()?;
    if decoded.len() > limit {
        return Err(too_large(limit));
    }

    Ok(decoded)
}
