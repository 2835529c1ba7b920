// Payload encoding and chunk planning
//
// A file travels as a `data:` URL string; chunks are slices of that text.
// The chunk count is the integer quotient of payload length by chunk size
// (at least one), and the final chunk carries any remainder.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

const DATA_URL_PREFIX: &str = "data:application/octet-stream;base64,";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not a data URL")]
    NotDataUrl,
    #[error("invalid base64 payload: {0}")]
    Base64(String),
}

pub fn encode_data_url(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(DATA_URL_PREFIX.len() + bytes.len() * 4 / 3 + 4);
    out.push_str(DATA_URL_PREFIX);
    STANDARD.encode_string(bytes, &mut out);
    out
}

pub fn decode_data_url(text: &str) -> Result<Vec<u8>, PayloadError> {
    let rest = text.strip_prefix("data:").ok_or(PayloadError::NotDataUrl)?;
    let (header, body) = rest.split_once(',').ok_or(PayloadError::NotDataUrl)?;
    if header.ends_with(";base64") {
        STANDARD
            .decode(body.trim())
            .map_err(|e| PayloadError::Base64(e.to_string()))
    } else {
        Ok(body.as_bytes().to_vec())
    }
}

/// Upper bound on the header of a data URL from any sender (mime type included).
const MAX_HEADER_LEN: usize = 256;

/// Largest data URL a file of `size` bytes can legitimately encode to.
pub fn encoded_len(size: u64) -> usize {
    let body = size.div_ceil(3).saturating_mul(4);
    usize::try_from(body)
        .unwrap_or(usize::MAX)
        .saturating_add(MAX_HEADER_LEN)
}

/// Number of chunks for a payload of `len` units.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    (len / chunk_size.max(1)).max(1)
}

/// Byte range of chunk `index`; the last chunk extends to the end.
pub fn chunk_bounds(len: usize, chunk_size: usize, index: usize) -> (usize, usize) {
    let size = chunk_size.max(1);
    let total = chunk_count(len, size);
    let start = (index * size).min(len);
    let end = if index + 1 >= total {
        len
    } else {
        ((index + 1) * size).min(len)
    };
    (start, end)
}

pub fn percent(index: usize, total: usize) -> f64 {
    (index + 1) as f64 / total.max(1) as f64 * 100.0
}
