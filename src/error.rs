use std::io;

use thiserror::Error;

use crate::collapsed::MalformedLine;
use crate::mojo::DecodeError;
use crate::sample::ThreadKey;
use crate::store::ConsumerId;

/// Everything that can go wrong while turning samples into profiles.
#[derive(Debug, Error)]
pub enum Error {
    /// A MOJO stream could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A collapsed line did not parse and the reader was strict.
    #[error(transparent)]
    MalformedLine(#[from] MalformedLine),

    /// Nothing has been recorded for the requested thread.
    #[error("no samples recorded for thread {0}")]
    UnknownThread(ThreadKey),

    /// The consumer never subscribed, or has unsubscribed.
    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    /// The input format could not be told from the first bytes of the stream.
    #[error("could not detect the input format")]
    UnknownFormat,

    /// Reading input or writing output failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A profile could not be serialized.
    #[error("failed to serialize profile: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
