use thiserror::Error;

/// Failures reported by the cache's collaborators and constructors.
///
/// Lookups never return these: they surface as `None` and
/// [`crate::Delegate::did_fail_to_get_image`] callbacks, and are logged.
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP request failed before a complete body was received.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// The server answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// The bytes are not an image the decoder understands.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// The cache root or an entry could not be accessed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// There is no default cache root on this platform.
    #[error("no default cache root on this platform")]
    NoDefaultRoot,

    /// The process-wide cache was used before being configured.
    #[error("image cache is not configured")]
    Unconfigured,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
