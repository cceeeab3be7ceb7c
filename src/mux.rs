//! Multiplexer: interleaves many per-namespace producers into one archive
//! stream.
//!
//! The run loop owns the output writer and is the only thread that touches
//! it. Producers attach through [`MuxControl::open`] and push documents
//! through their [`MuxIn`]; every write is acknowledged over a rendezvous
//! channel, so a producer observes exactly the success or failure of its own
//! document hitting the writer.
//!
//! Consecutive writes for the same namespace share one block: the namespace
//! header goes out only when the stream switches namespaces, and the block
//! terminator when switching away or closing.

use crate::demux::NamespaceHeader;
use crate::document;
use crate::error::{DuffelError, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use std::io::Write;
use xxhash_rust::xxh3::Xxh3;

enum ProducerOp {
    Write(Vec<u8>),
    Close,
}

enum ControlMsg {
    Open {
        db: String,
        collection: String,
        ops: Receiver<ProducerOp>,
        ack: Sender<Result<()>>,
        admitted: Sender<()>,
    },
}

struct Producer {
    db: String,
    collection: String,
    namespace: String,
    ops: Receiver<ProducerOp>,
    ack: Sender<Result<()>>,
    hash: Xxh3,
    bytes_written: u64,
}

/// Handle for attaching new producers to a running multiplexer.
///
/// Dropping the last clone tells the run loop that no further namespaces
/// will open; the loop exits once every attached producer has closed.
#[derive(Clone)]
pub struct MuxControl {
    tx: Sender<ControlMsg>,
}

impl MuxControl {
    /// Open a namespace sub-stream. Blocks until the run loop has admitted
    /// the producer, so a successful return guarantees the namespace is
    /// known to the multiplexer.
    pub fn open(&self, db: &str, collection: &str) -> Result<MuxIn> {
        let namespace = format!("{}.{}", db, collection);
        let (ops_tx, ops_rx) = bounded(0);
        let (ack_tx, ack_rx) = bounded(0);
        let (admitted_tx, admitted_rx) = bounded(0);
        self.tx
            .send(ControlMsg::Open {
                db: db.to_string(),
                collection: collection.to_string(),
                ops: ops_rx,
                ack: ack_tx,
                admitted: admitted_tx,
            })
            .map_err(|_| DuffelError::MuxStopped(namespace.clone()))?;
        admitted_rx
            .recv()
            .map_err(|_| DuffelError::MuxStopped(namespace.clone()))?;
        Ok(MuxIn {
            namespace,
            ops: ops_tx,
            ack: ack_rx,
        })
    }
}

/// A producer's writing end for one namespace.
pub struct MuxIn {
    namespace: String,
    ops: Sender<ProducerOp>,
    ack: Receiver<Result<()>>,
}

impl MuxIn {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Push one already-framed document into the namespace's sub-stream.
    /// Blocks until the run loop has written it (or failed trying).
    pub fn write(&self, doc: &[u8]) -> Result<usize> {
        document::validate_document(doc)?;
        self.ops
            .send(ProducerOp::Write(doc.to_vec()))
            .map_err(|_| DuffelError::MuxStopped(self.namespace.clone()))?;
        self.ack
            .recv()
            .map_err(|_| DuffelError::MuxStopped(self.namespace.clone()))??;
        Ok(doc.len())
    }

    /// Finish the namespace: the run loop emits the eof header carrying the
    /// accumulated checksum. Consumes the handle; a clean return means the
    /// namespace is completely on the wire.
    pub fn close(self) -> Result<()> {
        self.ops
            .send(ProducerOp::Close)
            .map_err(|_| DuffelError::MuxStopped(self.namespace.clone()))?;
        self.ack
            .recv()
            .map_err(|_| DuffelError::MuxStopped(self.namespace.clone()))?
    }
}

/// Owns the archive output and serializes all producers onto it.
pub struct Multiplexer<W: Write> {
    writer: W,
    control: Receiver<ControlMsg>,
    producers: Vec<Producer>,
    current: Option<String>,
}

enum Event {
    Open(ControlMsg),
    ControlClosed,
    Producer(usize, Option<ProducerOp>),
}

impl<W: Write> Multiplexer<W> {
    /// Build a multiplexer over `writer` (positioned after the prelude) and
    /// the control handle producers attach through.
    pub fn new(writer: W) -> (Self, MuxControl) {
        let (tx, control) = bounded(0);
        (
            Multiplexer {
                writer,
                control,
                producers: Vec::new(),
                current: None,
            },
            MuxControl { tx },
        )
    }

    /// Service producers until the control handle is dropped and every
    /// producer has closed, then hand the writer back. Runs on one thread;
    /// returns the first write error, leaving blocked producers to observe
    /// the shutdown through their disconnected channels.
    pub fn run(mut self) -> Result<W> {
        let mut control_open = true;
        loop {
            if !control_open && self.producers.is_empty() {
                break;
            }
            let event = {
                let mut select = crossbeam::channel::Select::new();
                if control_open {
                    select.recv(&self.control);
                }
                for producer in &self.producers {
                    select.recv(&producer.ops);
                }
                let oper = select.select();
                let index = oper.index();
                if control_open && index == 0 {
                    match oper.recv(&self.control) {
                        Ok(msg) => Event::Open(msg),
                        Err(_) => Event::ControlClosed,
                    }
                } else {
                    let pi = if control_open { index - 1 } else { index };
                    Event::Producer(pi, oper.recv(&self.producers[pi].ops).ok())
                }
            };
            match event {
                Event::Open(ControlMsg::Open {
                    db,
                    collection,
                    ops,
                    ack,
                    admitted,
                }) => {
                    let namespace = format!("{}.{}", db, collection);
                    tracing::debug!("opened producer for namespace {}", namespace);
                    self.producers.push(Producer {
                        db,
                        collection,
                        namespace,
                        ops,
                        ack,
                        hash: Xxh3::new(),
                        bytes_written: 0,
                    });
                    let _ = admitted.send(());
                }
                Event::ControlClosed => control_open = false,
                Event::Producer(pi, Some(ProducerOp::Write(doc))) => {
                    if let Err(err) = self.write_body(pi, &doc) {
                        let namespace = self.producers[pi].namespace.clone();
                        let _ = self.producers[pi]
                            .ack
                            .send(Err(DuffelError::MuxStopped(namespace)));
                        return Err(err);
                    }
                    let _ = self.producers[pi].ack.send(Ok(()));
                }
                Event::Producer(pi, Some(ProducerOp::Close)) => {
                    let producer = self.producers.swap_remove(pi);
                    if let Err(err) = self.close_producer(&producer) {
                        let _ = producer
                            .ack
                            .send(Err(DuffelError::MuxStopped(producer.namespace.clone())));
                        return Err(err);
                    }
                    let _ = producer.ack.send(Ok(()));
                }
                Event::Producer(pi, None) => {
                    let producer = self.producers.swap_remove(pi);
                    return Err(DuffelError::ProducerAbandoned(producer.namespace));
                }
            }
        }
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn write_namespace_header(
        &mut self,
        db: &str,
        collection: &str,
        eof: bool,
        checksum: u64,
    ) -> Result<()> {
        let header = bincode::serialize(&NamespaceHeader {
            db: db.to_string(),
            collection: collection.to_string(),
            eof,
            checksum,
        })?;
        document::write_document(&mut self.writer, &header)
    }

    fn write_body(&mut self, pi: usize, doc: &[u8]) -> Result<()> {
        let namespace = self.producers[pi].namespace.clone();
        if self.current.as_deref() != Some(namespace.as_str()) {
            if self.current.is_some() {
                document::write_terminator(&mut self.writer)?;
            }
            let (db, collection) = (
                self.producers[pi].db.clone(),
                self.producers[pi].collection.clone(),
            );
            self.write_namespace_header(&db, &collection, false, 0)?;
            self.current = Some(namespace);
        }
        document::write_raw_document(&mut self.writer, doc)?;
        let producer = &mut self.producers[pi];
        producer.hash.update(doc);
        producer.bytes_written += doc.len() as u64;
        Ok(())
    }

    fn close_producer(&mut self, producer: &Producer) -> Result<()> {
        if self.current.is_some() {
            document::write_terminator(&mut self.writer)?;
            self.current = None;
        }
        self.write_namespace_header(
            &producer.db,
            &producer.collection,
            true,
            producer.hash.digest(),
        )?;
        document::write_terminator(&mut self.writer)?;
        tracing::debug!(
            "closed namespace {} ({} bytes)",
            producer.namespace,
            producer.bytes_written
        );
        Ok(())
    }
}
