//! Synchronous push/pull rendezvous between the demultiplexer and a restore
//! worker.
//!
//! The demultiplexer is push-driven (it hands complete document buffers to
//! `write`); the worker consuming a namespace is pull-driven
//! (`std::io::Read` with arbitrary-sized reads). The bridge reconciles the
//! two without any intervening unbounded buffer: every channel here is a
//! zero-capacity rendezvous, so backpressure flows in both directions.
//!
//! Handshake per write: the writer sends the buffer length, waits for a
//! reader-owned scratch buffer sized to fit, copies into it, and sends it
//! back with the byte count. A read smaller than the pending write keeps the
//! remainder for subsequent reads, so the writer is never forced to split.

use crate::demux::DemuxOut;
use crate::error::{DuffelError, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use xxhash_rust::xxh3::Xxh3;

/// Write half: registered with the demultiplexer as a namespace's consumer.
pub struct RegularCollectionReceiver {
    namespace: String,
    // Taken on close; dropping it is the close signal (close-once guard).
    len_tx: Option<Sender<usize>>,
    buf_rx: Receiver<Vec<u8>>,
    filled_tx: Sender<(Vec<u8>, usize)>,
    ack_rx: Receiver<()>,
    hash: Xxh3,
}

/// Read half: handed to the restore worker pulling the namespace's bytes.
pub struct ReceiverStream {
    namespace: String,
    len_rx: Receiver<usize>,
    buf_tx: Sender<Vec<u8>>,
    filled_rx: Receiver<(Vec<u8>, usize)>,
    ack_tx: Option<Sender<()>>,
    scratch: Vec<u8>,
    leftover: Vec<u8>,
    leftover_pos: usize,
    leftover_len: usize,
}

/// Build a connected bridge pair for one namespace.
pub fn receiver_bridge(namespace: impl Into<String>) -> (RegularCollectionReceiver, ReceiverStream) {
    let namespace = namespace.into();
    let (len_tx, len_rx) = bounded(0);
    let (buf_tx, buf_rx) = bounded(0);
    let (filled_tx, filled_rx) = bounded(0);
    let (ack_tx, ack_rx) = bounded(1);
    (
        RegularCollectionReceiver {
            namespace: namespace.clone(),
            len_tx: Some(len_tx),
            buf_rx,
            filled_tx,
            ack_rx,
            hash: Xxh3::new(),
        },
        ReceiverStream {
            namespace,
            len_rx,
            buf_tx,
            filled_rx,
            ack_tx: Some(ack_tx),
            scratch: Vec::new(),
            leftover: Vec::new(),
            leftover_pos: 0,
            leftover_len: 0,
        },
    )
}

impl RegularCollectionReceiver {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn closed_err(&self) -> DuffelError {
        DuffelError::BridgeClosed(self.namespace.clone())
    }
}

impl DemuxOut for RegularCollectionReceiver {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len_tx = self.len_tx.as_ref().ok_or_else(|| self.closed_err())?;
        len_tx
            .send(buf.len())
            .map_err(|_| self.closed_err())?;
        let mut dst = self.buf_rx.recv().map_err(|_| self.closed_err())?;
        dst[..buf.len()].copy_from_slice(buf);
        self.hash.update(buf);
        self.filled_tx
            .send((dst, buf.len()))
            .map_err(|_| self.closed_err())?;
        Ok(buf.len())
    }

    /// Idempotent: the length channel is closed exactly once, then we wait
    /// until the paired reader has observed the close (or is gone), so the
    /// writer never blocks forever on a reader that already gave up.
    fn close(&mut self) -> Result<()> {
        if let Some(len_tx) = self.len_tx.take() {
            drop(len_tx);
            let _ = self.ack_rx.recv();
        }
        Ok(())
    }

    fn sum64(&self) -> Option<u64> {
        Some(self.hash.digest())
    }
}

impl ReceiverStream {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn broken_pipe(&self) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!(
                "receiver bridge for namespace {} disconnected mid-handshake",
                self.namespace
            ),
        )
    }
}

impl std::io::Read for ReceiverStream {
    fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        // Serve carried-over bytes from a previous oversized write first.
        if self.leftover_pos < self.leftover_len {
            let n = (self.leftover_len - self.leftover_pos).min(dst.len());
            dst[..n].copy_from_slice(&self.leftover[self.leftover_pos..self.leftover_pos + n]);
            self.leftover_pos += n;
            if self.leftover_pos == self.leftover_len {
                self.scratch = std::mem::take(&mut self.leftover);
                self.leftover_pos = 0;
                self.leftover_len = 0;
            }
            return Ok(n);
        }
        let len = match self.len_rx.recv() {
            Ok(len) => len,
            Err(_) => {
                // Writer closed: acknowledge exactly once, then report EOF.
                if let Some(ack_tx) = self.ack_tx.take() {
                    let _ = ack_tx.send(());
                }
                return Ok(0);
            }
        };
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.resize(len, 0);
        self.buf_tx.send(scratch).map_err(|_| self.broken_pipe())?;
        let (filled, n) = self.filled_rx.recv().map_err(|_| self.broken_pipe())?;
        let take = n.min(dst.len());
        dst[..take].copy_from_slice(&filled[..take]);
        if take < n {
            self.leftover = filled;
            self.leftover_pos = take;
            self.leftover_len = n;
        } else {
            self.scratch = filled;
        }
        Ok(take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;

    // Convenience for computing a one-shot digest in assertions.
    trait Tap {
        fn tap(self, data: &[u8]) -> u64;
    }
    impl Tap for Xxh3 {
        fn tap(mut self, data: &[u8]) -> u64 {
            self.update(data);
            self.digest()
        }
    }

    #[test]
    fn test_write_then_read_exact_size() {
        let (mut receiver, mut stream) = receiver_bridge("app.orders");
        let writer = thread::spawn(move || {
            receiver.write(b"hello").unwrap();
            receiver.close().unwrap();
            receiver.sum64()
        });
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        let sum = writer.join().unwrap();
        assert_eq!(sum, Some(Xxh3::new().tap(b"hello")));
    }

    #[test]
    fn test_small_reads_carry_over() {
        let (mut receiver, mut stream) = receiver_bridge("app.orders");
        let writer = thread::spawn(move || {
            receiver.write(b"abcdefghij").unwrap();
            receiver.write(b"KLM").unwrap();
            receiver.close().unwrap();
        });
        // Read in 4-byte chunks across write boundaries.
        let mut collected = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"abcdefghijKLM");
        writer.join().unwrap();
    }

    #[test]
    fn test_large_read_gets_at_most_one_write() {
        let (mut receiver, mut stream) = receiver_bridge("app.orders");
        let writer = thread::spawn(move || {
            receiver.write(b"first").unwrap();
            receiver.write(b"second!").unwrap();
            receiver.close().unwrap();
        });
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second!");
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        writer.join().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut receiver, mut stream) = receiver_bridge("app.orders");
        let writer = thread::spawn(move || {
            receiver.close().unwrap();
            receiver.close().unwrap();
            assert!(matches!(
                receiver.write(b"late"),
                Err(DuffelError::BridgeClosed(_))
            ));
        });
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        // EOF is sticky.
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        writer.join().unwrap();
    }

    #[test]
    fn test_close_does_not_hang_on_abandoned_reader() {
        let (mut receiver, stream) = receiver_bridge("app.orders");
        drop(stream);
        // Must return, not block forever.
        receiver.close().unwrap();
    }

    #[test]
    fn test_write_fails_when_reader_gone() {
        let (mut receiver, stream) = receiver_bridge("app.orders");
        drop(stream);
        assert!(matches!(
            receiver.write(b"data"),
            Err(DuffelError::BridgeClosed(_))
        ));
    }

    #[test]
    fn test_checksum_independent_of_read_chunking() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        for chunk in [7usize, 64, 4096] {
            let (mut receiver, mut stream) = receiver_bridge("app.orders");
            let data = payload.clone();
            let writer = thread::spawn(move || {
                for piece in data.chunks(100) {
                    receiver.write(piece).unwrap();
                }
                receiver.close().unwrap();
                receiver.sum64().unwrap()
            });
            let mut collected = Vec::new();
            let mut buf = vec![0u8; chunk];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            assert_eq!(collected, payload);
            let sum = writer.join().unwrap();
            assert_eq!(sum, Xxh3::new().tap(&payload));
        }
    }
}
