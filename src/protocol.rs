//! Wire protocol: opcodes, message kinds and typed message records.
//!
//! Field names mirror what Calibre puts on the wire, so most structs
//! carry serde renames. Records that never cross the crate boundary are
//! kept `pub(crate)`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::metadata::columns::ColumnDatatype;
use crate::metadata::{CalibreBookMeta, CalibreTime};

/// Protocol version advertised to Calibre.
pub const PROTOCOL_VERSION: u32 = 391;

/// Fixed path-length hint reported for every supported extension.
pub(crate) const EXTENSION_PATH_LEN: u32 = 38;

/// Largest book-content packet the device accepts.
pub(crate) const BOOK_PACKET_LEN: u32 = 4096;

/// Calibre wireless-protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Acknowledgement; also carries most device replies.
    Ok = 0,
    /// New drive info for the device to persist.
    SetCalibreDeviceInfo = 1,
    /// New display name for the device.
    SetCalibreDeviceName = 2,
    /// Request for the device's drive info record.
    GetDeviceInformation = 3,
    /// Request for total storage space.
    TotalSpace = 4,
    /// Request for free storage space.
    FreeSpace = 5,
    /// Request for the on-device book list.
    GetBookCount = 6,
    /// Updated metadata is about to stream in.
    SendBooklists = 7,
    /// A book binary is about to stream in.
    SendBook = 8,
    /// Capability negotiation request.
    GetInitializationInfo = 9,
    /// A book transfer finished.
    BookDone = 11,
    /// Keep-alive, or a request for more book metadata.
    Noop = 12,
    /// Books to delete from the device.
    DeleteBook = 13,
    /// Request to stream a book back to Calibre.
    GetBookFileSegment = 14,
    /// Request for one book's metadata.
    GetBookMetadata = 15,
    /// One metadata record inside a `SendBooklists` exchange.
    SendBookMetadata = 16,
    /// User-facing message (password errors, toasts).
    DisplayMessage = 17,
    /// Calibre is busy; wait.
    CalibreBusy = 18,
    /// Information about the connected library.
    SetLibraryInfo = 19,
}

impl Opcode {
    /// Numeric wire value.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Map a wire value back to an opcode, if it is one we know.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            1 => Self::SetCalibreDeviceInfo,
            2 => Self::SetCalibreDeviceName,
            3 => Self::GetDeviceInformation,
            4 => Self::TotalSpace,
            5 => Self::FreeSpace,
            6 => Self::GetBookCount,
            7 => Self::SendBooklists,
            8 => Self::SendBook,
            9 => Self::GetInitializationInfo,
            11 => Self::BookDone,
            12 => Self::Noop,
            13 => Self::DeleteBook,
            14 => Self::GetBookFileSegment,
            15 => Self::GetBookMetadata,
            16 => Self::SendBookMetadata,
            17 => Self::DisplayMessage,
            18 => Self::CalibreBusy,
            19 => Self::SetLibraryInfo,
            _ => return None,
        })
    }
}

/// Kinds of `DisplayMessage` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// The password hash was rejected.
    PasswordError = 1,
    /// The client software is too old for this Calibre.
    UpdateNeeded = 2,
    /// Informational toast for the user.
    ShowToast = 3,
}

impl MessageKind {
    /// Map a wire value back to a message kind.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::PasswordError),
            2 => Some(Self::UpdateNeeded),
            3 => Some(Self::ShowToast),
            _ => None,
        }
    }
}

/// Initial information Calibre sends when establishing a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibreInitInfo {
    /// Whether the server tolerates the device renaming incoming lpaths.
    #[serde(rename = "canSupportLpathChanges")]
    pub can_support_lpath_changes: bool,

    /// Whether the server can update books in place.
    #[serde(rename = "canSupportUpdateBooks")]
    pub can_support_update_books: bool,

    /// Calibre release, e.g. `[6, 11, 0]`.
    pub calibre_version: Vec<u32>,

    /// strftime pattern Calibre uses for publication dates.
    #[serde(rename = "pubdateFormat")]
    pub pubdate_format: String,

    /// Wire protocol version of the server.
    #[serde(rename = "serverProtocolVersion")]
    pub server_protocol_version: u32,

    /// Challenge to hash with the password; empty when no password is set.
    #[serde(rename = "passwordChallenge")]
    pub password_challenge: String,

    /// Name of the currently open library.
    #[serde(rename = "currentLibraryName")]
    pub current_library_name: String,

    /// strftime pattern for timestamps.
    #[serde(rename = "timestampFormat")]
    pub timestamp_format: String,

    /// Extensions the server is willing to send.
    #[serde(rename = "validExtensions")]
    pub valid_extensions: Vec<String>,

    /// strftime pattern for last-modified times.
    #[serde(rename = "lastModifiedFormat")]
    pub last_modified_format: String,

    /// UUID of the currently open library.
    #[serde(rename = "currentLibraryUUID")]
    pub current_library_uuid: String,
}

/// Capability object the device answers opcode 9 with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct CalibreInit {
    pub will_ask_for_update_books: bool,
    #[serde(rename = "versionOK")]
    pub version_ok: bool,
    pub max_book_content_packet_len: u32,
    pub accepted_extensions: Vec<String>,
    pub extension_path_lengths: HashMap<String, u32>,
    pub password_hash: String,
    pub cc_version_number: u32,
    pub can_stream_books: bool,
    pub can_stream_metadata: bool,
    pub can_receive_book_binary: bool,
    pub can_delete_multiple_books: bool,
    pub can_use_cached_metadata: bool,
    pub device_kind: String,
    pub use_uuid_file_names: bool,
    pub cover_height: u32,
    pub device_name: String,
    pub app_name: String,
    pub cache_uses_lpaths: bool,
    pub can_send_ok_to_sendbook: bool,
    pub can_accept_library_info: bool,
    pub set_temp_mark_when_read_info_synced: bool,
}

/// Device identity and drive info exchanged with opcodes 1 and 3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// Model string of the device.
    pub device_version: String,

    /// Protocol version string, `"391"`.
    pub version: String,

    /// The persisted drive record.
    #[serde(rename = "device_info")]
    pub dev_info: DevInfo,
}

/// Drive-level record persisted on the device as `.driveinfo.calibre`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevInfo {
    /// Path prefix of the storage location.
    pub prefix: String,

    /// Calibre release the device last talked to.
    pub calibre_version: String,

    /// UUID of the library the device last synced with.
    pub last_library_uuid: String,

    /// Display name of the device.
    pub device_name: String,

    /// When the device last connected.
    pub date_last_connected: CalibreTime,

    /// Calibre location code, e.g. `"main"`.
    pub location_code: String,

    /// Stable UUID for this storage location.
    pub device_store_uuid: String,
}

/// Library description sent with opcode 19.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalibreLibraryInfo {
    /// Per-field column metadata of the library.
    pub field_metadata: HashMap<String, CalibreColumnInfo>,

    /// UUID of the library.
    pub library_uuid: String,

    /// Display name of the library.
    pub library_name: String,

    /// Anything else the server attached.
    pub other_info: Value,
}

/// Simplified description of one library column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibreColumnInfo {
    /// Column number within the library database.
    pub colnum: Option<i64>,
    /// Record index of the column.
    pub rec_index: Option<i64>,
    /// Lookup label, e.g. `#read`.
    pub label: String,
    /// Data type the column holds.
    pub datatype: ColumnDatatype,
    /// Display name of the column.
    pub name: String,
    /// Category sort key.
    pub category_sort: Option<String>,
    /// Whether the column is a colon-separated-pairs column.
    pub is_csp: bool,
    /// Kind of field (`field`, `category`, ...).
    pub kind: Option<String>,
    /// Whether the column is user defined.
    pub is_custom: bool,
    /// Whether the column may be edited.
    pub is_editable: bool,
    /// Backing column name.
    pub column: Option<String>,
    /// Search terms that resolve to this column.
    pub search_terms: Vec<String>,
    /// Whether the column forms a browsing category.
    pub is_category: bool,
    /// Backing table name.
    pub table: Option<String>,
    /// Datatype-specific display hints, kept raw.
    pub display: Value,
    /// Linked column name, if any.
    pub link_column: Option<String>,
}

/// Header of an incoming book transfer (opcode 8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct SendBook {
    pub total_books: u32,
    pub lpath: String,
    pub this_book: u32,
    pub will_stream_binary: bool,
    pub can_support_lpath_changes: bool,
    pub length: u64,
    pub will_stream_books: bool,
    pub metadata: CalibreBookMeta,
    pub wants_send_ok_to_sendbook: bool,
}

/// Lpaths Calibre wants removed (opcode 13).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct DeleteBooks {
    pub lpaths: Vec<String>,
}

/// Per-book confirmation inside a delete exchange.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DeleteConfirmation {
    pub uuid: String,
}

/// Free-space report (opcode 5 reply).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct FreeSpace {
    pub free_space_on_device: u64,
}

/// One updated metadata record inside a `SendBooklists` exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct MetadataUpdate {
    pub count: usize,
    pub supports_sync: bool,
    pub data: CalibreBookMeta,
    pub index: usize,
}

/// Book-count header the device streams before its list (opcode 6 reply).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct BookCountSend {
    pub count: usize,
    pub will_stream: bool,
    pub will_scan: bool,
}

/// Options Calibre sends with a book-count request (opcode 6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct BookCountReceive {
    pub can_stream: bool,
    pub can_scan: bool,
    pub will_use_cached_metadata: bool,
    pub supports_sync: bool,
    pub can_support_book_format_sync: bool,
}

/// Header the device sends before streaming a book out (opcode 14 reply).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct GetBookSend {
    pub will_stream: bool,
    pub will_stream_binary: bool,
    pub file_length: u64,
}

/// Settings Calibre sends when requesting a book (opcode 14).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct GetBookReceive {
    pub lpath: String,
    pub position: u64,
    pub this_book: u32,
    pub total_books: u32,
    pub can_stream: bool,
    pub can_stream_binary: bool,
}

/// Tells Calibre an incoming book was stored under a different lpath.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct NewLpath {
    pub lpath: String,
}

/// Header of a metadata update batch (opcode 7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct BookListsDetails {
    pub count: usize,
    pub collections: Value,
    pub will_stream_metadata: bool,
    pub supports_sync: bool,
}

/// Payload of a noop frame: empty for keep-alive, `count` to announce a
/// metadata request, `priKey` inside the request itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct NoopPayload {
    pub count: Option<u64>,
    #[serde(rename = "priKey")]
    pub pri_key: Option<u64>,
}

/// Payload of a display-message frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct DisplayMessage {
    #[serde(rename = "messageKind")]
    pub message_kind: i64,
}
