use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::discovery::CalibreInstance;

/// Cover dimensions advertised to Calibre during capability negotiation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CoverDims {
    /// Cover width in pixels.
    pub width: u32,

    /// Cover height in pixels. Calibre scales thumbnails to this height.
    pub height: u32,
}

/// Everything the session needs to know about the client software and the
/// device it runs on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Name of the client software, shown in the Calibre GUI.
    pub client_name: String,

    /// Name of the device the client software is running on.
    pub device_name: String,

    /// Device model of `device_name`.
    pub device_model: String,

    /// Ebook extensions the device accepts (lowercase, no leading dot).
    #[serde(default)]
    pub supported_extensions: Vec<String>,

    /// Dimensions for covers pushed with incoming books.
    #[serde(default)]
    pub cover_dims: CoverDims,

    /// Connect straight to this instance instead of probing the network.
    #[serde(default)]
    pub direct_connect: Option<CalibreInstance>,
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline applied to every control read and write. Bulk transfers
    /// arm a transient alternate deadline sized to the payload instead.
    pub standard_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            standard_timeout: Duration::from_secs(60),
        }
    }
}
