//! In-memory index of the books currently on the device.
//!
//! The catalog lives for one session. It is seeded from the device's
//! persistent store, mutated as Calibre pushes and deletes books, and
//! iterated in insertion order when Calibre asks for a cached listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::metadata::CalibreBookMeta;

/// Abridged per-book record used for cached-metadata listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDetails {
    /// Session-local primary key, assigned by the catalog.
    #[serde(rename = "priKey")]
    pub pri_key: u64,

    /// Calibre book UUID; may be empty.
    pub uuid: String,

    /// Dot-prefixed lowercase file extension, derived from the lpath.
    pub extension: String,

    /// Device-relative logical path; the book's identity.
    pub lpath: String,

    /// When the book's metadata last changed.
    pub last_modified: DateTime<Utc>,
}

impl BookDetails {
    /// Build an entry from a full metadata record. The primary key is
    /// assigned on insertion.
    pub fn from_meta(meta: &CalibreBookMeta) -> Self {
        let last_modified = meta
            .last_modified
            .as_ref()
            .and_then(|time| time.as_datetime())
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Self {
            pri_key: 0,
            uuid: meta.uuid.clone(),
            extension: extension_of(&meta.lpath),
            lpath: meta.lpath.clone(),
            last_modified,
        }
    }
}

/// Dot-prefixed lowercase extension of an lpath, or `""` when it has none.
pub(crate) fn extension_of(lpath: &str) -> String {
    match lpath.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && !ext.contains('/') => {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}

/// Catalog of on-device books with lookups by lpath and primary key.
#[derive(Debug, Default)]
pub struct Catalog {
    books: Vec<BookDetails>,
    by_lpath: HashMap<String, usize>,
    by_key: HashMap<u64, usize>,
    next_key: u64,
}

impl Catalog {
    /// Build a catalog from the device's book list, assigning fresh
    /// primary keys in order.
    pub fn new(books: Vec<BookDetails>) -> Self {
        let mut catalog = Self::default();
        for book in books {
            catalog.insert(book);
        }
        catalog
    }

    /// Insert a record, or replace the record sharing its lpath. A
    /// replaced record keeps its primary key. Returns the record's key.
    pub fn insert(&mut self, mut book: BookDetails) -> u64 {
        if let Some(&index) = self.by_lpath.get(&book.lpath) {
            book.pri_key = self.books[index].pri_key;
            let key = book.pri_key;
            self.books[index] = book;
            return key;
        }
        let key = self.next_key;
        self.next_key += 1;
        book.pri_key = key;
        self.by_lpath.insert(book.lpath.clone(), self.books.len());
        self.by_key.insert(key, self.books.len());
        self.books.push(book);
        key
    }

    /// Look up a record by lpath.
    pub fn find_by_lpath(&self, lpath: &str) -> Option<&BookDetails> {
        self.by_lpath.get(lpath).map(|&index| &self.books[index])
    }

    /// Look up a record by primary key.
    pub fn find_by_pri_key(&self, key: u64) -> Option<&BookDetails> {
        self.by_key.get(&key).map(|&index| &self.books[index])
    }

    /// Remove a record by lpath.
    pub fn remove_by_lpath(&mut self, lpath: &str) -> Option<BookDetails> {
        let index = self.by_lpath.get(lpath).copied()?;
        Some(self.remove_at(index))
    }

    /// Remove a record by primary key.
    pub fn remove_by_pri_key(&mut self, key: u64) -> Option<BookDetails> {
        let index = self.by_key.get(&key).copied()?;
        Some(self.remove_at(index))
    }

    fn remove_at(&mut self, index: usize) -> BookDetails {
        let book = self.books.remove(index);
        self.by_lpath.remove(&book.lpath);
        self.by_key.remove(&book.pri_key);
        // Slots after the removed record shifted down by one.
        for slot in self.by_lpath.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        for slot in self.by_key.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        book
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.books.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &BookDetails> {
        self.books.iter()
    }
}
