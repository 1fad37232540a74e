use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum Error {
    /// A transport read or write exceeded the active deadline.
    #[error("transport deadline exceeded")]
    TransportTimeout,

    /// The TCP connection was closed by the peer.
    #[error("connection closed by calibre")]
    TransportClosed,

    /// A frame on the wire could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer broke the request/response contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No Calibre instance answered the discovery probes.
    #[error("calibre server not found")]
    CalibreNotFound,

    /// The device reported an empty password.
    #[error("no password found")]
    NoPassword,

    /// Failure reported by the device collaborator.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error returned by [`Device`](crate::device::Device) implementations,
/// wrapping whatever lower-level cause the device hit.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct DeviceError(Box<dyn std::error::Error + Send + Sync>);

impl DeviceError {
    /// Wrap a lower-level error.
    pub fn new<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(source.into())
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(source: std::io::Error) -> Self {
        Self::new(source)
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(source: serde_json::Error) -> Self {
        Self::new(source)
    }
}

/// Result type alias for the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for device collaborator calls.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
