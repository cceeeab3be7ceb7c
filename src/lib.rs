//! # Duffel - Streaming Archive Core for Document Databases
//!
//! `duffel` implements the archive side of a dump/restore toolkit: many
//! collections multiplexed into one seekless byte stream, plus the intent
//! bookkeeping and scheduling policies that decide which collection moves
//! when.
//!
//! An archive is laid out as:
//!
//! ```text
//! +-------+----------------+------------+------------+-----
//! | magic | prelude block  | data block | data block | ...
//! +-------+----------------+------------+------------+-----
//!
//! block = header document, body documents..., terminator
//! document = u32 LE total length (incl. the 4 prefix bytes) + payload
//! terminator = 4 bytes, all bits set
//! ```
//!
//! The prelude block describes every namespace the archive carries; each
//! data block belongs to exactly one namespace and blocks from different
//! namespaces interleave freely.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use duffel::{IntentManager, Intent, Multiplexer, Prelude, Result};
//! use duffel::document::encode_document;
//!
//! # fn main() -> Result<()> {
//! // Dump side: describe the collections, write the prelude, then stream.
//! let manager = IntentManager::new();
//! manager.put(Intent::new("app", "orders"))?;
//!
//! let mut out = Vec::new();
//! Prelude::new_from_manager(&manager, "7.0.2", 4)?.write(&mut out)?;
//!
//! let (mux, control) = Multiplexer::new(out);
//! let producer = std::thread::spawn(move || -> Result<()> {
//!     let input = control.open("app", "orders")?;
//!     input.write(&encode_document(b"one document"))?;
//!     input.close()
//! });
//! let archive = mux.run()?;
//! producer.join().unwrap()?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod demux;
pub mod document;
pub mod error;
pub mod intent;
pub mod manager;
pub mod mux;
pub mod parser;
pub mod prelude;
pub mod prioritizer;

pub use crate::bridge::{receiver_bridge, ReceiverStream, RegularCollectionReceiver};
pub use crate::demux::{
    DemuxHandle, DemuxOut, Demultiplexer, MutedCollection, NamespaceAck, NamespaceAnnouncements,
    NamespaceHeader, SpecialCollectionCache,
};
pub use crate::error::{DuffelError, Result};
pub use crate::intent::{split_namespace, Intent, SourceHandle};
pub use crate::manager::IntentManager;
pub use crate::mux::{MuxControl, MuxIn, Multiplexer};
pub use crate::parser::{BlockConsumer, Parser};
pub use crate::prelude::{ArchiveHeader, CollectionMetadata, Prelude, FORMAT_VERSION, MAGIC};
pub use crate::prioritizer::{
    IntentPrioritizer, LegacyPrioritizer, LongestTaskFirstPrioritizer,
    MultiDatabaseLtfPrioritizer, PriorityType,
};

/// Crate version baked into every archive prelude this build writes.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
