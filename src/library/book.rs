//! Book item model.

use crate::config::BookFormat;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use uuid::Uuid;

static TRAILING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_]\d+$").expect("valid regex"));
static FORMAT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[-_](epub|mobi|kindle|ebook)$").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Processing status of a book in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookStatus {
    /// Needs conversion.
    Pending,
    /// Already an EPUB, nothing to convert.
    Ready,
    /// Conversion in progress.
    Converting,
    /// Converted successfully.
    Done,
    /// Conversion failed.
    Failed,
    /// Delivery in progress.
    Sending,
    /// Delivered to Kindle.
    Sent,
    /// Delivery failed.
    SendFailed,
}

impl BookStatus {
    /// Whether the item has an EPUB that can be sent.
    pub fn is_sendable(&self) -> bool {
        matches!(self, BookStatus::Done | BookStatus::Ready)
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BookStatus::Pending => "Pending",
            BookStatus::Ready => "Ready",
            BookStatus::Converting => "Converting...",
            BookStatus::Done => "Done",
            BookStatus::Failed => "Failed",
            BookStatus::Sending => "Sending...",
            BookStatus::Sent => "Sent!",
            BookStatus::SendFailed => "Send failed",
        };
        f.write_str(label)
    }
}

/// Title and author read from a book file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookMetadata {
    /// Title, if the file declares one.
    pub title: Option<String>,
    /// Author, if the file declares one.
    pub author: Option<String>,
}

/// One input file tracked through a batch.
#[derive(Debug, Clone)]
pub struct BookItem {
    /// Identity of the item within its batch.
    pub id: Uuid,

    /// File the item was created from.
    pub source_path: PathBuf,

    /// Title shown to the user and sent to Kindle.
    pub display_title: String,

    /// Author shown to the user (may be empty).
    pub display_author: String,

    /// Input format.
    pub format: BookFormat,

    /// Current status.
    pub status: BookStatus,

    /// EPUB produced for this item by the orchestrator.
    pub output_path: Option<PathBuf>,

    /// Last failure message.
    pub error: Option<String>,
}

impl BookItem {
    /// Create an item for a file, with a title derived from its name.
    ///
    /// Returns `None` for extensions that are neither EPUB nor Kindle formats.
    pub fn new(path: PathBuf) -> Option<Self> {
        let format = BookFormat::from_extension(extension_of(&path).as_str())?;
        Some(Self::with_format(path, format))
    }

    /// Create an item with an explicit format.
    pub fn with_format(path: PathBuf, format: BookFormat) -> Self {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Untitled");

        let status = match format {
            BookFormat::Epub => BookStatus::Ready,
            BookFormat::Mobi => BookStatus::Pending,
        };

        Self {
            id: Uuid::new_v4(),
            display_title: cleanup_title(stem),
            display_author: String::new(),
            format,
            status,
            output_path: None,
            error: None,
            source_path: path,
        }
    }

    /// Overlay metadata read from the file, keeping filename-derived values
    /// where the file declares nothing.
    pub fn apply_metadata(&mut self, metadata: BookMetadata) {
        if let Some(title) = metadata.title.filter(|t| !t.is_empty()) {
            self.display_title = title;
        }
        if let Some(author) = metadata.author.filter(|a| !a.is_empty()) {
            self.display_author = author;
        }
    }

    /// Get the filename of the source file.
    pub fn filename(&self) -> &str {
        self.source_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
    }

    /// The EPUB this item would deliver, if any.
    pub fn sendable_path(&self) -> Option<&Path> {
        match self.format {
            BookFormat::Epub => Some(self.source_path.as_path()),
            BookFormat::Mobi => self.output_path.as_deref(),
        }
    }
}

/// Immutable description of one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    /// Book title.
    pub title: String,
    /// Book author (may be empty).
    pub author: String,
    /// File to convert.
    pub input_path: PathBuf,
    /// EPUB to produce.
    pub output_path: PathBuf,
}

/// Lowercased extension with leading dot, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

/// Turn a filename stem into a readable title.
pub fn cleanup_title(stem: &str) -> String {
    let title = TRAILING_NUMBER.replace(stem, "");
    let title = FORMAT_SUFFIX.replace(&title, "");
    let title = title.replace(['_', '-'], " ");
    WHITESPACE.replace_all(&title, " ").trim().to_string()
}

/// Replace characters that are not allowed in file names.
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// EPUB file name for a title and author.
pub fn output_file_name(title: &str, author: &str) -> String {
    let title = safe_filename(title);
    if author.is_empty() {
        format!("{}.epub", title)
    } else {
        format!("{} - {}.epub", safe_filename(author), title)
    }
}
