//! caldev-rs: present any application as a Calibre wireless "Smart
//! Device".
//!
//! This crate implements the device side of Calibre's wireless device
//! protocol: UDP discovery, the length-prefixed JSON framing, capability
//! and password negotiation, book-list synchronization (cached and full),
//! metadata updates, streamed book transfer in both directions, deletion
//! and keep-alive.
//!
//! Storage, password prompting, free-space measurement and progress
//! display stay with the embedding application, behind the
//! [`Device`] trait. A minimal folder-backed reference device ships as
//! the `caldev-rs` binary.
//!
//! # Usage
//!
//! ```no_run
//! # async fn run(mut device: impl caldev_rs::Device) -> caldev_rs::Result<()> {
//! use caldev_rs::{Session, SessionConfig};
//!
//! let session = Session::new(&mut device, SessionConfig::default()).await?;
//! session.run().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// In-memory book index.
pub mod catalog;
/// Length-prefixed JSON framing.
pub mod codec;
/// Client and session configuration.
pub mod config;
/// The collaborator surface the session drives.
pub mod device;
/// Calibre instance discovery.
pub mod discovery;
/// Error types.
pub mod error;
/// Book metadata model.
pub mod metadata;
/// Opcodes and wire messages.
pub mod protocol;
/// Connection state machine.
pub mod session;

#[cfg(test)]
mod tests;

pub use catalog::{BookDetails, Catalog};
pub use config::{ClientOptions, CoverDims, SessionConfig};
pub use device::{BookId, Device, MetadataIter, Status};
pub use discovery::{discover, CalibreInstance};
pub use error::{DeviceError, DeviceResult, Error, Result};
pub use metadata::{CalibreBookMeta, CalibreTime, Thumbnail};
pub use protocol::{CalibreInitInfo, CalibreLibraryInfo, DevInfo, DeviceInfo, PROTOCOL_VERSION};
pub use session::{Phase, Session};
