//! Archive prelude: the magic number plus one block describing every
//! namespace the archive carries.
//!
//! The prelude block's header document is an [`ArchiveHeader`]; each body
//! document is one [`CollectionMetadata`]. On restore the prelude alone is
//! enough to rebuild a fully populated [`IntentManager`] before a single
//! data block is read.

use crate::document;
use crate::error::{DuffelError, Result};
use crate::intent::{Intent, SourceHandle};
use crate::manager::IntentManager;
use crate::parser::{BlockConsumer, Parser};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Stream magic, little-endian on the wire.
pub const MAGIC: u32 = 0x6C66_7564;

/// Archive format version this build reads and writes.
pub const FORMAT_VERSION: &str = "0.1";

/// Header document of the prelude block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub format_version: String,
    pub server_version: String,
    pub tool_version: String,
    /// How many collections the producing dump streamed in parallel; a
    /// restore can size its worker pool to match.
    pub concurrent_collections: u32,
}

/// One body document of the prelude block: everything a restore needs to
/// know about a namespace before its data arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub db: String,
    pub collection: String,
    /// Literal collection-options JSON, `"{}"` when there are none.
    pub metadata: String,
    pub size: u64,
}

/// In-memory form of an archive's prelude.
#[derive(Debug, Clone, PartialEq)]
pub struct Prelude {
    pub header: ArchiveHeader,
    pub namespace_metadatas: Vec<CollectionMetadata>,
}

impl Prelude {
    /// Snapshot a collecting-phase manager into a prelude.
    pub fn new_from_manager(
        manager: &IntentManager,
        server_version: &str,
        concurrent_collections: u32,
    ) -> Result<Self> {
        let mut namespace_metadatas = Vec::new();
        for intent in manager.intents() {
            let metadata = if intent.options.is_null() {
                "{}".to_string()
            } else {
                serde_json::to_string(&intent.options)?
            };
            namespace_metadatas.push(CollectionMetadata {
                db: intent.db,
                collection: intent.coll,
                metadata,
                size: intent.size,
            });
        }
        Ok(Prelude {
            header: ArchiveHeader {
                format_version: FORMAT_VERSION.to_string(),
                server_version: server_version.to_string(),
                tool_version: crate::VERSION.to_string(),
                concurrent_collections,
            },
            namespace_metadatas,
        })
    }

    /// Write the magic and the prelude block.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&MAGIC.to_le_bytes())?;
        let header = bincode::serialize(&self.header)?;
        document::write_document(writer, &header)?;
        for metadata in &self.namespace_metadatas {
            let doc = bincode::serialize(metadata)?;
            document::write_document(writer, &doc)?;
        }
        document::write_terminator(writer)?;
        Ok(())
    }

    /// Read the magic and the prelude block, leaving `reader` positioned at
    /// the first data block.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DuffelError::TruncatedStream("archive magic")
            } else {
                e.into()
            }
        })?;
        let found = u32::from_le_bytes(magic);
        if found != MAGIC {
            return Err(DuffelError::InvalidMagic(found));
        }

        let mut consumer = PreludeConsumer {
            header: None,
            metadatas: Vec::new(),
        };
        let mut parser = Parser::new(reader);
        if !parser.read_block(&mut consumer)? {
            return Err(DuffelError::TruncatedStream("prelude block"));
        }
        let header = consumer
            .header
            .ok_or(DuffelError::TruncatedStream("prelude block"))?;
        if header.format_version != FORMAT_VERSION {
            return Err(DuffelError::UnsupportedFormatVersion {
                found: header.format_version,
                expected: FORMAT_VERSION.to_string(),
            });
        }
        Ok(Prelude {
            header,
            namespace_metadatas: consumer.metadatas,
        })
    }

    /// Build a collecting-phase manager holding one archive-sourced intent
    /// per namespace metadata.
    pub fn new_intent_manager(&self) -> Result<IntentManager> {
        let manager = IntentManager::new();
        for metadata in &self.namespace_metadatas {
            let mut intent = Intent::new(&metadata.db, &metadata.collection);
            if !metadata.metadata.is_empty() && metadata.metadata != "{}" {
                intent.options = serde_json::from_str(&metadata.metadata)?;
            }
            intent.size = metadata.size;
            intent.data_source = Some(SourceHandle::Archive {
                namespace: intent.namespace(),
            });
            manager.put(intent)?;
        }
        Ok(manager)
    }
}

struct PreludeConsumer {
    header: Option<ArchiveHeader>,
    metadatas: Vec<CollectionMetadata>,
}

impl BlockConsumer for PreludeConsumer {
    fn header(&mut self, doc: &[u8]) -> Result<()> {
        self.header = Some(bincode::deserialize(document::payload(doc))?);
        Ok(())
    }

    fn body(&mut self, doc: &[u8]) -> Result<()> {
        self.metadatas
            .push(bincode::deserialize(document::payload(doc))?);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prelude_round_trip() {
        let manager = IntentManager::new();
        let mut orders = Intent::new("app", "orders");
        orders.size = 4096;
        orders.options = json!({ "capped": true, "size": 4096 });
        manager.put(orders).unwrap();
        manager.put(Intent::new("app", "empty")).unwrap();

        let prelude = Prelude::new_from_manager(&manager, "7.0.2", 4).unwrap();
        let mut stream = Vec::new();
        prelude.write(&mut stream).unwrap();

        let mut cursor = stream.as_slice();
        let read_back = Prelude::read(&mut cursor).unwrap();
        assert_eq!(read_back, prelude);
        assert_eq!(read_back.header.concurrent_collections, 4);
        assert_eq!(read_back.namespace_metadatas.len(), 2);
        // The reader stops exactly at the end of the prelude block.
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_rebuilt_manager_carries_archive_sources() {
        let manager = IntentManager::new();
        let mut orders = Intent::new("app", "orders");
        orders.size = 128;
        orders.options = json!({ "viewOn": "raw" });
        manager.put(orders).unwrap();

        let prelude = Prelude::new_from_manager(&manager, "7.0.2", 1).unwrap();
        let rebuilt = prelude.new_intent_manager().unwrap();
        let intent = rebuilt.peek().unwrap();
        assert_eq!(intent.namespace(), "app.orders");
        assert_eq!(intent.size, 128);
        assert!(intent.is_view());
        assert_eq!(
            intent.data_source,
            Some(SourceHandle::Archive {
                namespace: "app.orders".to_string()
            })
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        assert!(matches!(
            Prelude::read(&mut stream.as_slice()),
            Err(DuffelError::InvalidMagic(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn test_truncated_prelude_rejected() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&MAGIC.to_le_bytes());
        assert!(matches!(
            Prelude::read(&mut stream.as_slice()),
            Err(DuffelError::TruncatedStream("prelude block"))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let header = ArchiveHeader {
            format_version: "9.9".to_string(),
            server_version: "7.0.2".to_string(),
            tool_version: "0.0.0".to_string(),
            concurrent_collections: 1,
        };
        let mut stream = Vec::new();
        stream.extend_from_slice(&MAGIC.to_le_bytes());
        document::write_document(&mut stream, &bincode::serialize(&header).unwrap()).unwrap();
        document::write_terminator(&mut stream).unwrap();
        assert!(matches!(
            Prelude::read(&mut stream.as_slice()),
            Err(DuffelError::UnsupportedFormatVersion { found, .. }) if found == "9.9"
        ));
    }
}
