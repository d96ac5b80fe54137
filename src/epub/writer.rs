//! EPUB container writer.

use crate::epub::ExtractedContent;
use crate::epub::markup::merge_fragments;
use crate::epub::package::{
    ManifestItem, PackageBuilder, PackageIdentity, generate_content, generate_nav,
};
use crate::error::Result;
use std::io::{Seek, Write};
use std::path::Path;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

const STYLESHEET: &str = r#"body {
  font-family: Georgia, "Times New Roman", serif;
  line-height: 1.6;
  margin: 1em;
  text-align: justify;
}
h1 {
  font-size: 1.8em;
  margin-top: 1em;
  margin-bottom: 0.5em;
  text-align: center;
}
h2 {
  font-size: 1.4em;
  margin-top: 1em;
  margin-bottom: 0.4em;
}
h3 {
  font-size: 1.2em;
  margin-top: 0.8em;
  margin-bottom: 0.3em;
}
p {
  margin-top: 0.5em;
  margin-bottom: 0.5em;
  text-indent: 1.5em;
}
img {
  max-width: 100%;
  height: auto;
}
"#;

/// Media type of an image from its file name.
pub fn media_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Builds single-spine EPUB 3 containers.
#[derive(Debug, Clone)]
pub struct EpubAssembler {
    title: String,
    author: String,
}

impl EpubAssembler {
    /// Create an assembler for a book.
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
        }
    }

    /// Assemble `content` into an EPUB at `output_path`.
    ///
    /// The archive is written to a temporary file in the target directory
    /// and renamed into place, so a failed write never leaves a partial file.
    pub fn assemble(&self, content: &ExtractedContent, output_path: &Path) -> Result<()> {
        self.assemble_with(content, output_path, &PackageIdentity::generate())
    }

    /// Assemble with a caller-provided identifier and timestamp.
    pub fn assemble_with(
        &self,
        content: &ExtractedContent,
        output_path: &Path,
        identity: &PackageIdentity,
    ) -> Result<()> {
        let parent = match output_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".booky-")
            .suffix(".epub.part")
            .tempfile_in(parent)?;

        self.write_to(tmp.as_file_mut(), content, identity)?;
        tmp.as_file().sync_all()?;
        tmp.persist(output_path).map_err(|e| e.error)?;

        tracing::info!(
            output = %output_path.display(),
            images = content.images.len(),
            fragments = content.html_fragments.len(),
            "EPUB written"
        );
        Ok(())
    }

    /// Write the EPUB entries, in reader-required order, to `writer`.
    pub fn write_to<W: Write + Seek>(
        &self,
        writer: W,
        content: &ExtractedContent,
        identity: &PackageIdentity,
    ) -> Result<W> {
        let mut zip = ZipWriter::new(writer);
        let stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::default());
        let deflated = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default());

        // 1. mimetype (must be first, stored uncompressed)
        zip.start_file("mimetype", stored)?;
        zip.write_all(b"application/epub+zip")?;

        // 2. META-INF/container.xml
        zip.start_file("META-INF/container.xml", deflated)?;
        zip.write_all(CONTAINER_XML.as_bytes())?;

        // 3. Package document
        let mut package = PackageBuilder::new(identity.clone(), self.title.as_str())
            .author(&self.author)
            .spine_item(ManifestItem::new(
                "content",
                "content.xhtml",
                "application/xhtml+xml",
            ))
            .item(ManifestItem::new("nav", "nav.xhtml", "application/xhtml+xml").properties("nav"))
            .item(ManifestItem::new("style", "style.css", "text/css"));
        for (i, name) in content.images.keys().enumerate() {
            package = package.item(ManifestItem::new(
                format!("img{}", i),
                format!("images/{}", name),
                media_type_for(name),
            ));
        }
        zip.start_file("OEBPS/content.opf", deflated)?;
        zip.write_all(package.build().as_bytes())?;

        // 4. Navigation document
        zip.start_file("OEBPS/nav.xhtml", deflated)?;
        zip.write_all(generate_nav(&self.title, "content.xhtml", "style.css").as_bytes())?;

        // 5. Stylesheet
        zip.start_file("OEBPS/style.css", deflated)?;
        zip.write_all(STYLESHEET.as_bytes())?;

        // 6. Content
        let body = merge_fragments(
            &content.html_fragments,
            content.images.keys().map(String::as_str),
        );
        zip.start_file("OEBPS/content.xhtml", deflated)?;
        zip.write_all(generate_content(&self.title, &body, "style.css").as_bytes())?;

        // 7. Images, byte for byte
        for (name, data) in &content.images {
            zip.start_file(format!("OEBPS/images/{}", name), deflated)?;
            zip.write_all(data)?;
        }

        Ok(zip.finish()?)
    }
}
