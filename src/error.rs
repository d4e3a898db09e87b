use thiserror::Error;

/// Errors surfaced by the tunneling core.
///
/// Disposition (what a caller should do with each variant) is documented
/// per-component; receive loops never propagate anything other than
/// [`TunnelError::SocketFatal`] out of themselves — everything else is
/// logged and the loop continues.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unauthorized: session id mismatch")]
    Unauthorized,

    #[error("outgoing batch of {got} bytes exceeds MTU budget of {max}")]
    Oversized { got: usize, max: usize },

    #[error("short write: wrote {wrote} of {expected} bytes")]
    ShortWrite { wrote: usize, expected: usize },

    #[error("socket fatal: {0}")]
    SocketFatal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("stream closed")]
    StreamClosed,

    #[error("no channel available to send on")]
    NoChannel,

    #[error("channel is not started")]
    ChannelNotStarted,

    #[error("ping proxy pool is empty or misconfigured")]
    NoPingProxy,
}

pub type Result<T> = std::result::Result<T, TunnelError>;
