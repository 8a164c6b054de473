use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Reasons a raw DNS message could not be read far enough to be forwarded or cached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is {0} bytes, shorter than the 12-byte header")]
    TooShortForHeader(usize),

    #[error("message carries no question")]
    NoQuestion,

    #[error("label at offset {offset} declares {length} bytes but only {remaining} remain")]
    LabelOverrun {
        offset: usize,
        length: usize,
        remaining: usize,
    },

    #[error("name ran past the end of the message at offset {0}")]
    UnterminatedName(usize),

    #[error("unsupported label type 0x{0:02x} in question name")]
    UnsupportedLabel(u8),

    #[error("record at offset {0} is truncated")]
    TruncatedRecord(usize),
}

/// Everything that can go wrong while serving one query, or while starting the server.
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("could not bind port {requested} nor default port {fallback}: {source}")]
    Bind {
        requested: u16,
        fallback: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to receive datagram: {0}")]
    Receive(#[source] io::Error),

    #[error("malformed query: {0}")]
    Parse(#[from] ParseError),

    #[error("failed to relay query to {upstream}: {source}")]
    Forward {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("upstream {upstream} did not answer within {timeout:?}")]
    UpstreamTimeout {
        upstream: SocketAddr,
        timeout: Duration,
    },

    #[error("shared relay for {0} ended without an answer")]
    RelayAbandoned(String),

    #[error("failed to send response to {client}: {source}")]
    Respond {
        client: SocketAddr,
        #[source]
        source: io::Error,
    },
}
