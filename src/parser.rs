//! Block parser: reads one self-terminating framed block at a time.
//!
//! A block is a header document, zero or more body documents, then the
//! 4-byte terminator. The parser never interprets document payloads; it
//! hands complete document buffers to a [`BlockConsumer`].

use crate::document::{read_frame, Frame};
use crate::error::{DuffelError, Result};
use std::io::Read;

/// Callback surface invoked while a block is parsed.
pub trait BlockConsumer {
    /// Called once with the block's header document.
    fn header(&mut self, doc: &[u8]) -> Result<()>;
    /// Called once per body document, in stream order.
    fn body(&mut self, doc: &[u8]) -> Result<()>;
    /// Called when the block's terminator is read.
    fn end(&mut self) -> Result<()>;
}

/// Streaming block reader over any byte source.
pub struct Parser<R: Read> {
    reader: R,
}

impl<R: Read> Parser<R> {
    pub fn new(reader: R) -> Self {
        Parser { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read exactly one block, driving `consumer` through
    /// header/body.../end.
    ///
    /// Returns `Ok(false)` only when the stream held zero bytes before the
    /// header. A stream that ends mid-block is a [`DuffelError::TruncatedStream`]
    /// error; a terminator in header position is corruption.
    pub fn read_block<C: BlockConsumer>(&mut self, consumer: &mut C) -> Result<bool> {
        let header = match read_frame(&mut self.reader)? {
            None => return Ok(false),
            Some(Frame::Terminator) => return Err(DuffelError::UnexpectedTerminator),
            Some(Frame::Document(doc)) => doc,
        };
        consumer.header(&header)?;
        loop {
            match read_frame(&mut self.reader)? {
                None => return Err(DuffelError::TruncatedStream("block terminator")),
                Some(Frame::Terminator) => {
                    consumer.end()?;
                    return Ok(true);
                }
                Some(Frame::Document(doc)) => consumer.body(&doc)?,
            }
        }
    }

    /// Read blocks until clean end-of-stream.
    pub fn read_to_end<C: BlockConsumer>(&mut self, consumer: &mut C) -> Result<()> {
        while self.read_block(consumer)? {}
        Ok(())
    }
}
