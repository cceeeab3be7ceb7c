//! Demultiplexer: fans one interleaved archive stream back out to
//! per-namespace consumers.
//!
//! Each namespace walks `Unopened → Opened → Closed`. Consumers attach
//! dynamically: when a header arrives for a namespace nobody has claimed,
//! the demultiplexer publishes the name on its announcement channel and
//! blocks until the scheduling side either registers a consumer or answers
//! with [`NamespaceAck::Finished`], after which every unclaimed namespace is
//! silently drained through a [`MutedCollection`].

use crate::bridge::{receiver_bridge, ReceiverStream};
use crate::document;
use crate::error::{DuffelError, Result};
use crate::parser::{BlockConsumer, Parser};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

/// Header document of every namespace data block.
///
/// `checksum` is meaningful only on the final (`eof`) header, where it
/// carries the xxh3 digest of every body byte written for the namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceHeader {
    pub db: String,
    pub collection: String,
    pub eof: bool,
    pub checksum: u64,
}

impl NamespaceHeader {
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.collection)
    }
}

/// A namespace's registered consumer.
///
/// `sum64` returns `None` when no checksum was computed (a muted consumer),
/// which skips verification at namespace close.
pub trait DemuxOut: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn close(&mut self) -> Result<()>;
    fn sum64(&self) -> Option<u64>;
}

/// Buffers a special collection's documents in memory so the restore driver
/// can replay them inline (oplog, users, roles).
pub struct SpecialCollectionCache {
    namespace: String,
    docs: Vec<Vec<u8>>,
    hash: Xxh3,
}

impl SpecialCollectionCache {
    pub fn new(namespace: impl Into<String>) -> Self {
        SpecialCollectionCache {
            namespace: namespace.into(),
            docs: Vec::new(),
            hash: Xxh3::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn docs(&self) -> &[Vec<u8>] {
        &self.docs
    }

    pub fn into_docs(self) -> Vec<Vec<u8>> {
        self.docs
    }
}

impl DemuxOut for SpecialCollectionCache {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.hash.update(buf);
        self.docs.push(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn sum64(&self) -> Option<u64> {
        Some(self.hash.digest())
    }
}

/// Discards a namespace the restore has no interest in.
pub struct MutedCollection {
    namespace: String,
}

impl MutedCollection {
    pub fn new(namespace: impl Into<String>) -> Self {
        MutedCollection {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl DemuxOut for MutedCollection {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn sum64(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NamespaceStatus {
    Unopened,
    Opened,
    Closed,
}

/// Scheduler's answer to a namespace announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceAck {
    /// A consumer for the announced namespace is now registered.
    Registered,
    /// The scheduler will not consume any further new namespaces; stop
    /// announcing and mute whatever else appears.
    Finished,
}

/// The scheduling side's endpoints of the announcement rendezvous.
pub struct NamespaceAnnouncements {
    pub namespaces: Receiver<String>,
    pub acks: Sender<NamespaceAck>,
}

struct Shared {
    outs: Mutex<HashMap<String, Box<dyn DemuxOut>>>,
}

/// Cloneable handle for registering consumers from worker threads.
#[derive(Clone)]
pub struct DemuxHandle {
    shared: Arc<Shared>,
}

impl DemuxHandle {
    /// Register a consumer for a namespace's sub-stream.
    pub fn open(&self, db: &str, coll: &str, out: Box<dyn DemuxOut>) {
        let ns = format!("{}.{}", db, coll);
        tracing::debug!("registering consumer for namespace {}", ns);
        self.shared.outs.lock().insert(ns, out);
    }

    /// Register a receiver bridge for a namespace and hand back its pulling
    /// end.
    pub fn open_collection(&self, db: &str, coll: &str) -> ReceiverStream {
        let ns = format!("{}.{}", db, coll);
        let (receiver, stream) = receiver_bridge(ns.clone());
        tracing::debug!("registering receiver bridge for namespace {}", ns);
        self.shared.outs.lock().insert(ns, Box::new(receiver));
        stream
    }
}

struct DemuxState {
    shared: Arc<Shared>,
    statuses: HashMap<String, NamespaceStatus>,
    current: Option<String>,
    announce_tx: Sender<String>,
    ack_rx: Receiver<NamespaceAck>,
    announcements_done: bool,
}

impl DemuxState {
    fn status(&self, ns: &str) -> NamespaceStatus {
        self.statuses
            .get(ns)
            .copied()
            .unwrap_or(NamespaceStatus::Unopened)
    }

    /// Make sure `ns` has a consumer, announcing it to the scheduling side
    /// if necessary. Once the scheduler answers `Finished` (or its end of
    /// the rendezvous is gone), unclaimed namespaces are muted instead.
    fn ensure_consumer(&mut self, ns: &str) -> Result<()> {
        if self.shared.outs.lock().contains_key(ns) {
            return Ok(());
        }
        if !self.announcements_done {
            tracing::debug!("announcing new namespace {}", ns);
            if self.announce_tx.send(ns.to_string()).is_ok() {
                match self.ack_rx.recv() {
                    Ok(NamespaceAck::Registered) => {
                        if self.shared.outs.lock().contains_key(ns) {
                            return Ok(());
                        }
                        return Err(DuffelError::ConsumerNotRegistered(ns.to_string()));
                    }
                    Ok(NamespaceAck::Finished) | Err(_) => {
                        self.announcements_done = true;
                    }
                }
            } else {
                self.announcements_done = true;
            }
        }
        tracing::debug!("muting unclaimed namespace {}", ns);
        self.shared
            .outs
            .lock()
            .insert(ns.to_string(), Box::new(MutedCollection::new(ns)));
        Ok(())
    }

    fn check_end_of_stream(&mut self) -> Result<()> {
        let mut open: Vec<String> = self
            .statuses
            .iter()
            .filter(|(_, status)| **status == NamespaceStatus::Opened)
            .map(|(ns, _)| ns.clone())
            .collect();
        // Consumers registered for namespaces that never closed (or never
        // even appeared) are just as truncated.
        for ns in self.shared.outs.lock().keys() {
            if self.status(ns) != NamespaceStatus::Closed && !open.contains(ns) {
                open.push(ns.clone());
            }
        }
        if open.is_empty() {
            Ok(())
        } else {
            open.sort();
            Err(DuffelError::ArchiveTruncated(open))
        }
    }
}

impl BlockConsumer for DemuxState {
    fn header(&mut self, doc: &[u8]) -> Result<()> {
        let header: NamespaceHeader = bincode::deserialize(document::payload(doc))?;
        let ns = header.namespace();
        let status = self.status(&ns);
        if status == NamespaceStatus::Closed {
            return Err(DuffelError::HeaderAfterClose(ns));
        }
        if header.eof {
            if status == NamespaceStatus::Unopened {
                // Empty collection: its only trace is the eof header.
                self.ensure_consumer(&ns)?;
            }
            let mut out = self
                .shared
                .outs
                .lock()
                .remove(&ns)
                .ok_or_else(|| DuffelError::ConsumerNotRegistered(ns.clone()))?;
            out.close()?;
            if let Some(actual) = out.sum64() {
                if actual != header.checksum {
                    return Err(DuffelError::ChecksumMismatch {
                        namespace: ns,
                        expected: header.checksum,
                        actual,
                    });
                }
            }
            tracing::debug!("closed namespace {}", ns);
            self.statuses.insert(ns, NamespaceStatus::Closed);
            self.current = None;
        } else {
            if !self.shared.outs.lock().contains_key(&ns) {
                if status != NamespaceStatus::Unopened {
                    return Err(DuffelError::NamespaceReopened(ns));
                }
                self.ensure_consumer(&ns)?;
            }
            if status == NamespaceStatus::Unopened {
                tracing::debug!("opened namespace {}", ns);
            }
            self.statuses.insert(ns.clone(), NamespaceStatus::Opened);
            self.current = Some(ns);
        }
        Ok(())
    }

    fn body(&mut self, doc: &[u8]) -> Result<()> {
        let ns = self.current.as_ref().ok_or(DuffelError::BodyBeforeHeader)?;
        let mut outs = self.shared.outs.lock();
        let out = outs
            .get_mut(ns)
            .ok_or_else(|| DuffelError::ConsumerNotRegistered(ns.clone()))?;
        out.write(doc)?;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

/// Reads the interleaved stream and routes every block to its namespace's
/// consumer. Owns the input source; runs on one thread.
pub struct Demultiplexer<R: Read> {
    parser: Parser<R>,
    state: DemuxState,
}

impl<R: Read> Demultiplexer<R> {
    /// Build a demultiplexer over `reader` (positioned after the prelude),
    /// returning the consumer-registration handle and the announcement
    /// endpoints for the scheduling side.
    pub fn new(reader: R) -> (Self, DemuxHandle, NamespaceAnnouncements) {
        let shared = Arc::new(Shared {
            outs: Mutex::new(HashMap::new()),
        });
        let (announce_tx, namespaces) = bounded(0);
        let (acks, ack_rx) = bounded(0);
        let demux = Demultiplexer {
            parser: Parser::new(reader),
            state: DemuxState {
                shared: shared.clone(),
                statuses: HashMap::new(),
                current: None,
                announce_tx,
                ack_rx,
                announcements_done: false,
            },
        };
        (
            demux,
            DemuxHandle { shared },
            NamespaceAnnouncements { namespaces, acks },
        )
    }

    pub fn handle(&self) -> DemuxHandle {
        DemuxHandle {
            shared: self.state.shared.clone(),
        }
    }

    /// Process blocks until clean end-of-stream, then verify every namespace
    /// reached Closed. Stops at the first error.
    pub fn run(&mut self) -> Result<()> {
        while self.parser.read_block(&mut self.state)? {}
        self.state.check_end_of_stream()
    }
}
