//! EPUB input reader.

use crate::error::{AppError, Result};
use crate::library::book::BookMetadata;
use roxmltree::{Document, Node, ParsingOptions};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

const COVER_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png"];

/// Reads metadata and covers from EPUB files.
pub struct EpubReader;

impl EpubReader {
    /// Read `dc:title` and `dc:creator` from the package document.
    pub fn read_metadata(path: &Path) -> Result<BookMetadata> {
        let mut archive = Self::open(path)?;
        let (_, opf) = Self::read_opf(&mut archive)?;
        parse_metadata(&opf)
    }

    /// Extract the cover image bytes, if the book has one.
    pub fn extract_cover(path: &Path) -> Result<Option<Vec<u8>>> {
        let mut archive = Self::open(path)?;
        let (opf_path, opf) = Self::read_opf(&mut archive)?;
        let opf_dir = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");

        let names: Vec<String> = archive.file_names().map(String::from).collect();

        let entry = match find_cover_href(&opf)? {
            Some(href) => resolve_entry(&names, opf_dir, &href),
            None => fallback_cover_entry(&names),
        };

        let Some(entry) = entry else {
            return Ok(None);
        };

        tracing::debug!(book = %path.display(), entry = %entry, "Found EPUB cover");

        let mut data = Vec::new();
        archive.by_name(&entry)?.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    fn open(path: &Path) -> Result<ZipArchive<File>> {
        if !path.is_file() {
            return Err(AppError::FileNotFound(path.display().to_string()));
        }
        Ok(ZipArchive::new(File::open(path)?)?)
    }

    /// Locate and read the OPF, via container.xml or the first `.opf` entry.
    fn read_opf(archive: &mut ZipArchive<File>) -> Result<(String, String)> {
        let opf_path = match Self::find_opf_path(archive) {
            Ok(path) => path,
            Err(e) => archive
                .file_names()
                .find(|n| n.to_lowercase().ends_with(".opf"))
                .map(String::from)
                .ok_or(e)?,
        };

        let mut content = String::new();
        archive.by_name(&opf_path)?.read_to_string(&mut content)?;
        Ok((opf_path, content))
    }

    /// Find the OPF file path from container.xml.
    fn find_opf_path(archive: &mut ZipArchive<File>) -> Result<String> {
        let mut container = archive.by_name("META-INF/container.xml")?;
        let mut content = String::new();
        container.read_to_string(&mut content)?;

        let doc = parse(&content)?;

        doc.descendants()
            .find(|n| n.has_tag_name("rootfile"))
            .and_then(|n| n.attribute("full-path"))
            .map(String::from)
            .ok_or_else(|| AppError::InvalidFormat("No rootfile in container.xml".into()))
    }
}

fn parse(content: &str) -> Result<Document<'_>> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    Ok(Document::parse_with_options(content, options)?)
}

fn parse_metadata(opf: &str) -> Result<BookMetadata> {
    let doc = parse(opf)?;
    let first_text = |tag: &str| {
        doc.descendants()
            .filter(|n| n.tag_name().name() == tag)
            .filter_map(|n| n.text())
            .map(str::trim)
            .find(|t| !t.is_empty())
            .map(String::from)
    };

    Ok(BookMetadata {
        title: first_text("title"),
        author: first_text("creator"),
    })
}

fn manifest_items<'a, 'input>(doc: &'a Document<'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    doc.descendants().filter(|n| n.tag_name().name() == "item")
}

fn is_image_item(node: &Node) -> bool {
    let media_image = node
        .attribute("media-type")
        .is_some_and(|m| m.starts_with("image/"));
    let href_image = node
        .attribute("href")
        .map(str::to_lowercase)
        .is_some_and(|h| COVER_EXTENSIONS.iter().any(|ext| h.ends_with(ext)));
    media_image || href_image
}

/// Cover href from the manifest: `cover-image` property, then the
/// `<meta name="cover">` idref, then an image item whose id starts with "cover".
fn find_cover_href(opf: &str) -> Result<Option<String>> {
    let doc = parse(opf)?;

    let by_property = manifest_items(&doc).find(|n| {
        n.attribute("properties")
            .is_some_and(|p| p.split_whitespace().any(|t| t == "cover-image"))
    });
    if let Some(href) = by_property.and_then(|n| n.attribute("href")) {
        return Ok(Some(href.to_string()));
    }

    let meta_id = doc
        .descendants()
        .filter(|n| n.tag_name().name() == "meta")
        .find(|n| n.attribute("name").is_some_and(|v| v.eq_ignore_ascii_case("cover")))
        .and_then(|n| n.attribute("content"));
    if let Some(id) = meta_id
        && let Some(href) = manifest_items(&doc)
            .find(|n| n.attribute("id") == Some(id))
            .and_then(|n| n.attribute("href"))
    {
        return Ok(Some(href.to_string()));
    }

    let by_id = manifest_items(&doc).find(|n| {
        is_image_item(n)
            && n.attribute("id")
                .is_some_and(|id| id.to_lowercase().starts_with("cover"))
    });

    Ok(by_id.and_then(|n| n.attribute("href")).map(String::from))
}

/// Archive entry for an OPF-relative href.
fn resolve_entry(names: &[String], opf_dir: &str, href: &str) -> Option<String> {
    let full = if opf_dir.is_empty() {
        href.to_string()
    } else {
        format!("{}/{}", opf_dir, href)
    };
    let full = full.replace('\\', "/");
    let full = full.trim_start_matches('/');

    names
        .iter()
        .find(|n| n.eq_ignore_ascii_case(full))
        .or_else(|| {
            let href = href.to_lowercase();
            names.iter().find(|n| n.to_lowercase().ends_with(&href))
        })
        .cloned()
}

/// Any `cover*` image in the archive, then any image under a cover or images folder.
fn fallback_cover_entry(names: &[String]) -> Option<String> {
    let has_cover_ext = |name: &str| COVER_EXTENSIONS.iter().any(|ext| name.ends_with(ext));

    names
        .iter()
        .find(|n| {
            let file = n.rsplit('/').next().unwrap_or(n).to_lowercase();
            file.starts_with("cover") && has_cover_ext(&file)
        })
        .or_else(|| {
            names.iter().find(|n| {
                let lower = n.to_lowercase();
                (lower.contains("cover") || lower.contains("images")) && has_cover_ext(&lower)
            })
        })
        .cloned()
}
