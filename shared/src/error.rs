//! Error types for the envelope codec.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Response {id} is {size} bytes, over the {limit} byte frame limit")]
    Oversize { id: String, size: usize, limit: usize },
}
