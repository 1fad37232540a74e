//! The collaborator surface the session drives.
//!
//! The session owns the wire. Storage, passwords, free space and
//! progress display belong to the embedding application and are
//! reached through [`Device`]. Implementations are called synchronously
//! from the session's execution context and may block on their own I/O.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::catalog::BookDetails;
use crate::config::ClientOptions;
use crate::discovery::CalibreInstance;
use crate::error::DeviceResult;
use crate::metadata::CalibreBookMeta;
use crate::protocol::{CalibreInitInfo, CalibreLibraryInfo, DeviceInfo};

/// Identifies one book on the device. Either field may serve as the
/// implementation's preferred key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookId {
    /// Device-relative logical path.
    pub lpath: String,

    /// Calibre book UUID; may be empty.
    pub uuid: String,
}

/// Coarse activity states reported through [`Device::update_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Probing the network for Calibre instances.
    SearchingCalibre,
    /// Establishing the TCP connection.
    Connecting,
    /// Handshake completed.
    Connected,
    /// The connection ended.
    Disconnected,
    /// Waiting for the next request.
    Idle,
    /// A book is streaming in.
    ReceivingBook,
    /// A book is streaming out.
    SendingBook,
    /// Books are being deleted.
    DeletingBook,
    /// Calibre asked for additional metadata.
    SendingExtraMetadata,
    /// The user cancelled the password prompt.
    EmptyPasswordReceived,
}

/// Lazily yields full metadata records. The count is known up front
/// because Calibre needs it before the records stream.
pub trait MetadataIter: Send {
    /// Number of records the iterator will yield.
    fn count(&self) -> usize;

    /// The next record, or `None` when exhausted.
    fn next_meta(&mut self) -> Option<DeviceResult<CalibreBookMeta>>;
}

/// Storage and UI capabilities the session calls out to.
///
/// The session holds a `&mut` borrow for its whole life and never calls
/// two methods concurrently. Errors returned here abort the session.
#[async_trait]
pub trait Device: Send {
    /// Client software and device description used during capability
    /// negotiation.
    fn client_options(&mut self) -> DeviceResult<ClientOptions>;

    /// Books currently on the device. Primary keys are assigned by the
    /// session; an empty list means an empty device.
    fn device_book_list(&mut self) -> DeviceResult<Vec<BookDetails>>;

    /// Metadata for `books`, or for every book on the device when
    /// `books` is empty.
    fn metadata_iter(&mut self, books: &[BookId]) -> DeviceResult<Box<dyn MetadataIter + '_>>;

    /// The drive info record to present to Calibre.
    fn device_info(&mut self) -> DeviceResult<DeviceInfo>;

    /// Persist the drive info record Calibre pushed.
    fn set_device_info(&mut self, info: DeviceInfo) -> DeviceResult<()>;

    /// Note information about the connected library.
    fn set_library_info(&mut self, info: CalibreLibraryInfo) -> DeviceResult<()>;

    /// Apply a batch of updated metadata records.
    fn update_metadata(&mut self, metadata: Vec<CalibreBookMeta>) -> DeviceResult<()>;

    /// Obtain the connection password, prompting the user if need be. An
    /// empty string means the user cancelled.
    async fn password(&mut self, init: &CalibreInitInfo) -> DeviceResult<String>;

    /// Free storage space in bytes.
    fn free_space(&mut self) -> u64;

    /// Validate an lpath, returning a replacement when the device cannot
    /// store the original (filesystem limits and the like). Returning the
    /// input unchanged means no remap.
    fn check_lpath(&mut self, lpath: &str) -> String;

    /// Persist one incoming book, consuming exactly `length` bytes from
    /// `book`. `last_book` marks the final book of the batch.
    async fn save_book(
        &mut self,
        meta: &CalibreBookMeta,
        book: &mut (dyn AsyncRead + Send + Unpin),
        length: u64,
        last_book: bool,
    ) -> DeviceResult<()>;

    /// Open a book for streaming to Calibre, returning the source and the
    /// number of bytes it will yield. `position` may be non-zero even
    /// though current Calibre releases never send it.
    async fn get_book(
        &mut self,
        book: &BookId,
        position: u64,
    ) -> DeviceResult<(Box<dyn AsyncRead + Send + Unpin>, u64)>;

    /// Delete one book from the device.
    fn delete_book(&mut self, book: &BookId) -> DeviceResult<()>;

    /// Choose among discovered instances. Only called with a non-empty
    /// list.
    fn select_calibre_instance(&mut self, instances: &[CalibreInstance]) -> CalibreInstance;

    /// Progress and status display. `progress` is `-1` when the status
    /// has no progress, otherwise `0..=100`.
    fn update_status(&mut self, status: Status, progress: i32);

    /// Optional cancellation handle, checked between requests.
    fn exit_signal(&mut self) -> Option<CancellationToken> {
        None
    }
}
