use thiserror::Error;

/// Errors that can occur on framed channels and during handshakes.
#[derive(Error, Debug)]
pub enum NetError {
    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the stream mid-frame
    #[error("stream closed inside a frame")]
    TruncatedFrame,

    /// Frame length prefix exceeds the negotiated maximum
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Handshake did not complete before the deadline
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Peer spoke a different protocol revision
    #[error("protocol version mismatch: peer {peer}, local {local}")]
    VersionMismatch { peer: u32, local: u32 },

    /// Handshake failed for a protocol-level reason
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Signature did not verify against the presented public key
    #[error("invalid signature")]
    InvalidSignature,

    /// Malformed key material
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Channel is closed; the payload was not transmitted
    #[error("channel closed")]
    ChannelClosed,

    /// Payload did not decode as the expected document
    #[error("payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type alias for transport operations
pub type NetResult<T> = Result<T, NetError>;
