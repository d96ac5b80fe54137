//! EPUB 3 assembly from extracted MOBI sources.

pub mod markup;
pub mod package;
mod writer;

pub use package::{ManifestItem, PackageBuilder, PackageIdentity};
pub use writer::{EpubAssembler, media_type_for};

use std::collections::BTreeMap;

/// HTML and images pulled out of a source dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedContent {
    /// Markup blobs, in filename order.
    pub html_fragments: Vec<String>,
    /// Image bytes keyed by file name.
    pub images: BTreeMap<String, Vec<u8>>,
}
