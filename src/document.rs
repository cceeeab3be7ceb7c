//! Length-prefixed opaque document framing.
//!
//! Every document on the wire is a `u32` little-endian total length (counting
//! the 4 prefix bytes themselves) followed by the payload. The block
//! terminator is the 4-byte value with every bit set, an otherwise-invalid
//! length. The archive core never inspects payload contents at this layer.

use crate::error::{DuffelError, Result};
use std::io::{Read, Write};

/// Size of the length prefix on every document.
pub const DOC_LEN_BYTES: usize = 4;

/// Block terminator: an all-bits-set length, invalid for any real document.
pub const TERMINATOR: [u8; 4] = [0xFF; 4];

/// Upper bound on a single document, including its length prefix.
pub const MAX_DOCUMENT_SIZE: u32 = 16 * 1024 * 1024 + 4096;

/// One framed unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete document, length prefix included.
    Document(Vec<u8>),
    Terminator,
}

/// Read as many bytes as the stream will give, up to `buf.len()`.
///
/// Returns the number of bytes read; anything short of `buf.len()` means the
/// stream ended.
fn fill_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}

/// Read the next frame from the stream.
///
/// Returns `Ok(None)` only when zero bytes were available: a stream that ends
/// inside the length prefix or inside the document body is a hard error, not
/// end-of-stream. That distinction separates "no more data" from
/// "truncated/corrupt data".
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; DOC_LEN_BYTES];
    match fill_or_eof(reader, &mut len_buf)? {
        0 => return Ok(None),
        n if n < DOC_LEN_BYTES => {
            return Err(DuffelError::TruncatedStream("document length prefix"))
        }
        _ => {}
    }
    if len_buf == TERMINATOR {
        return Ok(Some(Frame::Terminator));
    }
    let len = u32::from_le_bytes(len_buf);
    if len < DOC_LEN_BYTES as u32 || len > MAX_DOCUMENT_SIZE {
        return Err(DuffelError::InvalidDocumentLength(len));
    }
    let mut doc = vec![0u8; len as usize];
    doc[..DOC_LEN_BYTES].copy_from_slice(&len_buf);
    let body_len = len as usize - DOC_LEN_BYTES;
    if fill_or_eof(reader, &mut doc[DOC_LEN_BYTES..])? < body_len {
        return Err(DuffelError::TruncatedStream("document body"));
    }
    Ok(Some(Frame::Document(doc)))
}

/// Frame a payload into a standalone document buffer.
pub fn encode_document(payload: &[u8]) -> Vec<u8> {
    let total = payload.len() + DOC_LEN_BYTES;
    let mut doc = Vec::with_capacity(total);
    doc.extend_from_slice(&(total as u32).to_le_bytes());
    doc.extend_from_slice(payload);
    doc
}

/// The payload portion of a complete document buffer.
pub fn payload(doc: &[u8]) -> &[u8] {
    if doc.len() < DOC_LEN_BYTES {
        &[]
    } else {
        &doc[DOC_LEN_BYTES..]
    }
}

/// Check that `doc` is a well-formed document: its length prefix must equal
/// the buffer length and stay within bounds.
pub fn validate_document(doc: &[u8]) -> Result<()> {
    if doc.len() < DOC_LEN_BYTES {
        return Err(DuffelError::MalformedDocument {
            prefix: 0,
            actual: doc.len(),
        });
    }
    let prefix = u32::from_le_bytes([doc[0], doc[1], doc[2], doc[3]]);
    if prefix as usize != doc.len() || prefix > MAX_DOCUMENT_SIZE {
        return Err(DuffelError::MalformedDocument {
            prefix,
            actual: doc.len(),
        });
    }
    Ok(())
}

/// Write `payload` as one framed document.
pub fn write_document<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let total = payload.len() + DOC_LEN_BYTES;
    if total > MAX_DOCUMENT_SIZE as usize {
        return Err(DuffelError::InvalidDocumentLength(total as u32));
    }
    writer.write_all(&(total as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Write an already-framed document, validating its prefix first.
pub fn write_raw_document<W: Write>(writer: &mut W, doc: &[u8]) -> Result<()> {
    validate_document(doc)?;
    writer.write_all(doc)?;
    Ok(())
}

pub fn write_terminator<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_all(&TERMINATOR)?;
    Ok(())
}
