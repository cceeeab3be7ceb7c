use thiserror::Error;

#[derive(Error, Debug)]
pub enum DuffelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid magic number: {0:#010x}")]
    InvalidMagic(u32),

    #[error("unsupported archive format version {found} (expected {expected})")]
    UnsupportedFormatVersion { found: String, expected: String },

    #[error("invalid document length: {0:#010x}")]
    InvalidDocumentLength(u32),

    #[error("corrupt archive: stream ended while reading {0}")]
    TruncatedStream(&'static str),

    #[error("unexpected terminator where a block header was expected")]
    UnexpectedTerminator,

    #[error("document length prefix ({prefix}) does not match buffer length ({actual})")]
    MalformedDocument { prefix: u32, actual: usize },

    #[error(
        "checksum mismatch for namespace {namespace}: header states {expected:#018x}, \
         receiver computed {actual:#018x}"
    )]
    ChecksumMismatch {
        namespace: String,
        expected: u64,
        actual: u64,
    },

    #[error("body document received before any namespace header")]
    BodyBeforeHeader,

    #[error("namespace header for already opened namespace {0}")]
    NamespaceReopened(String),

    #[error("namespace header for already closed namespace {0}")]
    HeaderAfterClose(String),

    #[error("no consumer registered for namespace {0}")]
    ConsumerNotRegistered(String),

    #[error("archive ended with namespaces still open: {}", .0.join(", "))]
    ArchiveTruncated(Vec<String>),

    #[error("multiplexer stopped before acknowledging namespace {0}")]
    MuxStopped(String),

    #[error("producer for namespace {0} dropped without closing")]
    ProducerAbandoned(String),

    #[error("receiver bridge for namespace {0} is closed")]
    BridgeClosed(String),

    #[error("intent manager is finalized; no further intents may be added")]
    ManagerFinalized,

    #[error("invalid namespace {0:?}: expected \"db.collection\"")]
    InvalidNamespace(String),

    #[error(
        "restore would overwrite {destination} from multiple sources (source {source_namespace})"
    )]
    DestinationConflict {
        destination: String,
        source_namespace: String,
    },

    #[error("multiple equally valid oplog candidates found")]
    OplogConflict,
}

pub type Result<T> = std::result::Result<T, DuffelError>;
