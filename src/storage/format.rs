//! Fixture file format
//!
//! A fixture file is a stream of YAML documents separated by `---` lines, one
//! document per snapshot:
//!
//! ```yaml
//! method: GET
//! protocol: 'http:'
//! search: page=2
//! statusCode: 200
//! headers:
//!   content-type: application/json
//! body: !!binary |
//!   eyJvayI6dHJ1ZX0=
//! ```
//!
//! The `body` key is always last. Bodies are written as base64 under a
//! `!!binary` block, or as literal text under a `!!str` block when the
//! snapshot's content type is HTML. Every body line is indented by two spaces
//! so the block can be cut back out byte-exactly.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::snapshot::{FixtureCollection, Headers, Snapshot};
use crate::{Result, TapedeckError};

/// Line separating two snapshot documents
pub const DOCUMENT_SEPARATOR: &str = "---";

/// Block header for base64 bodies
pub const BINARY_MARKER: &str = "body: !!binary |";

/// Block header for literal text bodies
pub const TEXT_MARKER: &str = "body: !!str |2-";

const BODY_KEY: &str = "body:";
const BODY_INDENT: &str = "  ";
const BASE64_LINE_WIDTH: usize = 76;

/// How a body is written to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Base64 under a `!!binary` block
    Binary,
    /// Literal UTF-8 text under a `!!str` block
    Text,
}

/// Choose the body encoding for a snapshot
///
/// HTML bodies are stored as text so fixtures stay readable and editable;
/// everything else, and HTML that is not valid UTF-8, is stored as base64.
#[must_use]
pub fn body_encoding(snapshot: &Snapshot) -> BodyEncoding {
    match &snapshot.body {
        Some(body) if snapshot.is_html() && std::str::from_utf8(body).is_ok() => BodyEncoding::Text,
        _ => BodyEncoding::Binary,
    }
}

/// Everything in a snapshot document except the body
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    method: String,
    protocol: String,
    #[serde(default)]
    search: String,
    #[serde(rename = "statusCode")]
    status_code: u16,
    #[serde(default)]
    headers: Headers,
}

/// Serialize a collection to fixture text
///
/// # Errors
///
/// Returns error if a snapshot record cannot be rendered as YAML
pub fn encode_collection(collection: &FixtureCollection) -> Result<String> {
    let documents = collection
        .snapshots()
        .iter()
        .map(encode_snapshot)
        .collect::<Result<Vec<_>>>()?;

    Ok(documents.join(&format!("{DOCUMENT_SEPARATOR}\n")))
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<String> {
    let record = SnapshotRecord {
        method: snapshot.method.clone(),
        protocol: snapshot.protocol.clone(),
        search: snapshot.search.clone(),
        status_code: snapshot.status_code,
        headers: snapshot.headers.clone(),
    };

    let mut out = serde_yaml::to_string(&record)
        .map_err(|e| TapedeckError::Other(format!("Failed to render snapshot: {e}")))?;
    if !out.ends_with('\n') {
        out.push('\n');
    }

    let Some(body) = &snapshot.body else {
        return Ok(out);
    };

    match body_encoding(snapshot) {
        BodyEncoding::Binary => {
            out.push_str(BINARY_MARKER);
            out.push('\n');
            let encoded = STANDARD.encode(body);
            // base64 output is ASCII, so byte chunks are valid str slices
            for start in (0..encoded.len()).step_by(BASE64_LINE_WIDTH) {
                let end = (start + BASE64_LINE_WIDTH).min(encoded.len());
                push_body_line(&mut out, &encoded[start..end]);
            }
        }
        BodyEncoding::Text => {
            out.push_str(TEXT_MARKER);
            out.push('\n');
            let text = String::from_utf8_lossy(body);
            for line in text.split('\n') {
                push_body_line(&mut out, line);
            }
        }
    }

    Ok(out)
}

fn push_body_line(out: &mut String, line: &str) {
    out.push_str(BODY_INDENT);
    out.push_str(line);
    out.push('\n');
}

/// Parse fixture text into a collection, preserving document order
///
/// Empty documents are skipped, so an empty file is an empty collection.
///
/// # Errors
///
/// Returns [`TapedeckError::Parse`] naming `path` if any document is malformed
pub fn decode_collection(path: &Path, content: &str) -> Result<FixtureCollection> {
    let mut snapshots = Vec::new();

    for (index, document) in split_documents(content).into_iter().enumerate() {
        if document.trim().is_empty() {
            continue;
        }

        let snapshot = decode_snapshot(document).map_err(|message| {
            TapedeckError::parse(path, format!("document {}: {message}", index + 1))
        })?;
        snapshots.push(snapshot);
    }

    Ok(FixtureCollection::from(snapshots))
}

fn split_documents(content: &str) -> Vec<&str> {
    let mut documents = Vec::new();
    let mut start = 0;
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        if line.trim_end() == DOCUMENT_SEPARATOR {
            documents.push(&content[start..offset]);
            start = offset + line.len();
        }
        offset += line.len();
    }
    documents.push(&content[start..]);

    documents
}

fn decode_snapshot(document: &str) -> std::result::Result<Snapshot, String> {
    let (head, body) = split_body(document)?;

    let record: SnapshotRecord = serde_yaml::from_str(head).map_err(|e| e.to_string())?;

    let body = match body {
        Some((BodyEncoding::Binary, block)) => Some(decode_binary_block(block)?),
        Some((BodyEncoding::Text, block)) => Some(decode_text_block(block)?.into_bytes()),
        None => None,
    };

    Ok(Snapshot {
        method: record.method,
        protocol: record.protocol,
        search: record.search,
        status_code: record.status_code,
        headers: record.headers,
        body,
    })
}

/// Cut the trailing `body:` block off a document
type BodyBlock<'a> = Option<(BodyEncoding, &'a str)>;

fn split_body(document: &str) -> std::result::Result<(&str, BodyBlock<'_>), String> {
    let mut offset = 0;

    for line in document.split_inclusive('\n') {
        if let Some(marker) = line.strip_prefix(BODY_KEY) {
            let marker = marker.trim();
            let encoding = if marker.starts_with("!!binary") {
                BodyEncoding::Binary
            } else if marker.starts_with("!!str") {
                BodyEncoding::Text
            } else {
                return Err(format!("unsupported body marker '{marker}'"));
            };

            let block = &document[offset + line.len()..];
            return Ok((&document[..offset], Some((encoding, block))));
        }
        offset += line.len();
    }

    Ok((document, None))
}

fn decode_binary_block(block: &str) -> std::result::Result<Vec<u8>, String> {
    let compact: String = block.chars().filter(|c| !c.is_whitespace()).collect();

    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| format!("invalid base64 body: {e}"))
}

fn decode_text_block(block: &str) -> std::result::Result<String, String> {
    let mut lines: Vec<&str> = block.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }

    let mut text = Vec::with_capacity(lines.len());
    for (number, line) in lines.into_iter().enumerate() {
        match line.strip_prefix(BODY_INDENT) {
            Some(content) => text.push(content),
            // editors tend to strip the indentation of blank lines
            None if line.trim().is_empty() => text.push(""),
            None => return Err(format!("text body line {} is not indented", number + 1)),
        }
    }

    Ok(text.join("\n"))
}
