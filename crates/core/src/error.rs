//! Error types for the vidlink transport library.

use std::fmt;

/// Errors that can occur in the vidlink library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Wire**: [`MalformedPacket`](Self::MalformedPacket): a datagram that
///   cannot be decoded. The receive loop drops it and keeps going.
/// - **Transport**: [`Io`](Self::Io), [`SocketClosed`](Self::SocketClosed),
///   [`AlreadyOpen`](Self::AlreadyOpen), [`NotOpen`](Self::NotOpen),
///   [`AlreadyRunning`](Self::AlreadyRunning).
/// - **Collaborators**: [`Encode`](Self::Encode), [`Capture`](Self::Capture).
/// - **Setup**: [`InvalidConfig`](Self::InvalidConfig).
///
/// An abandoned frame is not an error. It is reported as
/// [`FrameOutcome::Abandoned`](crate::assembler::FrameOutcome::Abandoned).
#[derive(Debug, thiserror::Error)]
pub enum VidlinkError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes handed to [`decode`](crate::packet::decode) are not a valid packet.
    #[error("malformed packet: {kind}")]
    MalformedPacket { kind: MalformedKind },

    /// The ingress or egress side was closed before or during the call.
    #[error("socket closed")]
    SocketClosed,

    /// [`PacketEgress::open`](crate::transport::PacketEgress::open) called
    /// while a socket is already attached.
    #[error("egress socket already open")]
    AlreadyOpen,

    /// [`PacketEgress::send`](crate::transport::PacketEgress::send) called
    /// before a socket was attached.
    #[error("egress socket not open")]
    NotOpen,

    /// A receive loop or stream pipeline was started twice.
    #[error("already running")]
    AlreadyRunning,

    /// The encoder collaborator failed on a frame.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The capture collaborator failed.
    #[error("capture failed: {0}")]
    Capture(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl VidlinkError {
    pub(crate) fn malformed(kind: MalformedKind) -> Self {
        Self::MalformedPacket { kind }
    }
}

/// Specific kind of packet decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Fewer than 12 bytes: not even a base header.
    TooShort { len: usize },
    /// The CSRC count claims more header than the datagram carries.
    TruncatedCsrc { csrc_count: u8, len: usize },
    /// The padding trailer claims more bytes than the payload holds.
    BadPadding { padding: u8, available: usize },
}

impl fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "{len} bytes is below the 12-byte header"),
            Self::TruncatedCsrc { csrc_count, len } => {
                write!(f, "{csrc_count} CSRC entries do not fit in {len} bytes")
            }
            Self::BadPadding { padding, available } => {
                write!(f, "padding of {padding} bytes exceeds {available} available")
            }
        }
    }
}

/// Convenience alias for `Result<T, VidlinkError>`.
pub type Result<T> = std::result::Result<T, VidlinkError>;
