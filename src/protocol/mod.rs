//! Wire protocol shared by the broker, the support service, and every agent
//!
//! One bidirectional framed connection per agent multiplexes subscription
//! declarations, publications, direct sends, and inbound deliveries. Frames
//! are length-prefixed and carry one value in the negotiated codec; `json`
//! is the codec this build ships.

pub mod envelope;
pub mod frame;
pub mod wire;

pub use envelope::{Envelope, Target};
pub use frame::{MAX_FRAME_BYTES, read_frame, write_frame};
pub use wire::{
    BrokerFrame, ClientFrame, HandshakeReply, Hello, PROTOCOL_VERSION, PublishStatus, SendStatus,
    SupportRequest, SupportReply,
};

use thiserror::Error;

/// Errors raised by the framing and codec layer
///
/// A `protocol_error` drops the offending connection; it is never retried
/// on the same session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("codec error: {source}")]
    Codec {
        #[from]
        source: serde_json::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("malformed routing target: {expression}")]
    MalformedTarget { expression: String },

    #[error("unsupported codec: {codec}")]
    UnsupportedCodec { codec: String },

    #[error("unexpected frame in state {state}: {frame}")]
    UnexpectedFrame { state: String, frame: String },
}
