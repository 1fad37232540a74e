//! Book metadata as Calibre exchanges it.
//!
//! Calibre transmits metadata as one JSON object per book. The known
//! fields are typed below; anything unrecognized is preserved verbatim in
//! the `extra` map so round trips through the device never lose data.

pub mod columns;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use columns::{format_rating, CustomColumn};

/// Full metadata record for one book.
///
/// Map- and sequence-valued fields are concrete containers (not
/// `Option`s) so that empty ones serialize as `{}`/`[]` rather than
/// `null`, which is what Calibre expects on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibreBookMeta {
    /// Book title.
    pub title: String,

    /// Ordered author list.
    pub authors: Vec<String>,

    /// Device-relative logical path; the book's identity on the device.
    pub lpath: String,

    /// Calibre book UUID; may be empty.
    pub uuid: String,

    /// File size in bytes.
    pub size: u64,

    /// Language codes.
    pub languages: Vec<String>,

    /// Subject tags.
    pub tags: Vec<String>,

    /// Sort form of the author list.
    pub author_sort: String,

    /// Sort form of the title.
    pub title_sort: String,

    /// Author name to sort-form mapping.
    pub author_sort_map: HashMap<String, String>,

    /// Author name to link mapping.
    pub author_link_map: HashMap<String, String>,

    /// Identifier scheme to value mapping (isbn, doi, ...).
    pub identifiers: HashMap<String, String>,

    /// User-defined columns, keyed by lookup label.
    pub user_metadata: HashMap<String, CustomColumn>,

    /// User-defined tag categories.
    pub user_categories: HashMap<String, Value>,

    /// Long-form description.
    pub comments: Option<String>,

    /// Publisher name.
    pub publisher: Option<String>,

    /// Series name.
    pub series: Option<String>,

    /// Position within the series.
    pub series_index: Option<f64>,

    /// Rating from 0 to 10; two points per star.
    pub rating: Option<f64>,

    /// Publication date.
    pub pubdate: Option<CalibreTime>,

    /// Date the book entered the library.
    pub timestamp: Option<CalibreTime>,

    /// Last metadata change.
    pub last_modified: Option<CalibreTime>,

    /// Local path hint for the cover image.
    pub cover: Option<String>,

    /// Cover thumbnail pushed with the book.
    pub thumbnail: Option<Thumbnail>,

    /// Publication type.
    pub publication_type: Option<String>,

    /// MIME type of the book file.
    pub mime: Option<String>,

    /// Rights statement.
    pub rights: Option<String>,

    /// Producer of the book file.
    pub book_producer: Option<String>,

    /// Calibre database id, when the server includes one.
    pub db_id: Option<Value>,

    /// Application-specific id, when the server includes one.
    pub application_id: Option<Value>,

    /// Fields this library does not model, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CalibreBookMeta {
    /// Languages joined as a comma-separated string.
    pub fn lang_string(&self) -> String {
        self.languages.join(",")
    }

    /// Tags joined as a comma-separated string.
    pub fn tag_string(&self) -> String {
        self.tags.join(",")
    }

    /// Publisher, or the empty string when unset.
    pub fn publisher_string(&self) -> String {
        self.publisher.clone().unwrap_or_default()
    }

    /// Rating rendered as whole stars.
    pub fn rating_string(&self) -> String {
        match self.rating {
            Some(rating) => format_rating(rating as i64, false),
            None => String::new(),
        }
    }
}

/// RFC3339 timestamp kept in the string form Calibre transmitted.
///
/// Calibre's timestamps carry microseconds and offsets that a round trip
/// through a parsed representation would not reproduce byte for byte.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibreTime(String);

impl CalibreTime {
    /// Wrap a raw timestamp string, if it parses as RFC3339.
    pub fn parse(raw: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(raw).ok()?;
        Some(Self(raw.to_owned()))
    }

    /// Build from a chrono datetime.
    pub fn from_datetime(datetime: &DateTime<Utc>) -> Self {
        Self(datetime.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    /// The parsed time, or `None` when the string is not valid RFC3339.
    pub fn as_datetime(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.0).ok()
    }

    /// Raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cover thumbnail as transmitted: width, height and base64 image bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail(pub u32, pub u32, pub String);

impl Thumbnail {
    /// Width and height in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.0, self.1)
    }

    /// Base64-encoded image bytes.
    pub fn image_base64(&self) -> &str {
        &self.2
    }
}
