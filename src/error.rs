use thiserror::Error;

/// Crate-wide result alias; fallible public APIs return this.
pub type Result<T> = std::result::Result<T, SiphonError>;

/// Error taxonomy for the datapath, matching the propagation policy:
/// transient I/O is swallowed by callers before it reaches here, peer
/// failures are isolated to one peer, protocol violations are logged and
/// skipped, and `Fatal` is the only variant expected to abort the process.
#[derive(Error, Debug)]
pub enum SiphonError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer {node_id} link failed: {source}")]
    PeerIo {
        node_id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("forwarding entry decode failed for session {session_id:?}: {reason}")]
    ForwardingEntryDecode { session_id: String, reason: String },

    #[error("minion pool overflow: a push onto a full queue would have blocked")]
    PoolOverflow,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
