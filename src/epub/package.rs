//! OPF package and navigation document generation.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Writer;
use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::io::Cursor;
use uuid::Uuid;

/// Language tag written into every package.
pub const LANGUAGE: &str = "en";

/// Fields that change on every assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageIdentity {
    /// `dc:identifier` value.
    pub identifier: String,
    /// `dcterms:modified` timestamp.
    pub modified: DateTime<Utc>,
}

impl PackageIdentity {
    /// A fresh identifier stamped with the current time.
    pub fn generate() -> Self {
        Self {
            identifier: format!("urn:uuid:{}", Uuid::new_v4()),
            modified: Utc::now(),
        }
    }
}

/// OPF manifest item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestItem {
    /// Item id.
    pub id: String,
    /// Path relative to the package document.
    pub href: String,
    /// MIME type.
    pub media_type: String,
    /// EPUB 3 item properties (e.g. "nav").
    pub properties: Option<String>,
}

impl ManifestItem {
    /// Create a manifest item without properties.
    pub fn new(
        id: impl Into<String>,
        href: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            href: href.into(),
            media_type: media_type.into(),
            properties: None,
        }
    }

    /// Set the item properties.
    pub fn properties(mut self, properties: impl Into<String>) -> Self {
        self.properties = Some(properties.into());
        self
    }
}

/// OPF package document builder.
pub struct PackageBuilder {
    identity: PackageIdentity,
    title: String,
    author: String,
    items: Vec<ManifestItem>,
    spine: Vec<String>,
}

impl PackageBuilder {
    /// Create a new package builder.
    pub fn new(identity: PackageIdentity, title: impl Into<String>) -> Self {
        Self {
            identity,
            title: title.into(),
            author: "Unknown".to_string(),
            items: Vec::new(),
            spine: Vec::new(),
        }
    }

    /// Set the creator. Empty authors keep the "Unknown" default.
    pub fn author(mut self, author: &str) -> Self {
        if !author.trim().is_empty() {
            self.author = author.to_string();
        }
        self
    }

    /// Add a manifest item.
    pub fn item(mut self, item: ManifestItem) -> Self {
        self.items.push(item);
        self
    }

    /// Add a manifest item and reference it from the spine.
    pub fn spine_item(mut self, item: ManifestItem) -> Self {
        self.spine.push(item.id.clone());
        self.items.push(item);
        self
    }

    /// Build the package document.
    pub fn build(self) -> String {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

        // Writing to Vec can't fail
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));

        let mut package = BytesStart::new("package");
        package.push_attribute(("xmlns", "http://www.idpf.org/2007/opf"));
        package.push_attribute(("unique-identifier", "bookid"));
        package.push_attribute(("version", "3.0"));
        let _ = writer.write_event(Event::Start(package));

        let mut metadata = BytesStart::new("metadata");
        metadata.push_attribute(("xmlns:dc", "http://purl.org/dc/elements/1.1/"));
        let _ = writer.write_event(Event::Start(metadata));

        let mut identifier = BytesStart::new("dc:identifier");
        identifier.push_attribute(("id", "bookid"));
        write_text_element(&mut writer, identifier, &self.identity.identifier);
        write_text_element(&mut writer, BytesStart::new("dc:title"), &self.title);
        write_text_element(&mut writer, BytesStart::new("dc:creator"), &self.author);
        write_text_element(&mut writer, BytesStart::new("dc:language"), LANGUAGE);

        let mut modified = BytesStart::new("meta");
        modified.push_attribute(("property", "dcterms:modified"));
        write_text_element(
            &mut writer,
            modified,
            &self
                .identity
                .modified
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        let _ = writer.write_event(Event::End(BytesEnd::new("metadata")));

        let _ = writer.write_event(Event::Start(BytesStart::new("manifest")));
        for item in &self.items {
            let mut elem = BytesStart::new("item");
            elem.push_attribute(("id", item.id.as_str()));
            elem.push_attribute(("href", item.href.as_str()));
            elem.push_attribute(("media-type", item.media_type.as_str()));
            if let Some(properties) = &item.properties {
                elem.push_attribute(("properties", properties.as_str()));
            }
            let _ = writer.write_event(Event::Empty(elem));
        }
        let _ = writer.write_event(Event::End(BytesEnd::new("manifest")));

        let _ = writer.write_event(Event::Start(BytesStart::new("spine")));
        for idref in &self.spine {
            let mut elem = BytesStart::new("itemref");
            elem.push_attribute(("idref", idref.as_str()));
            let _ = writer.write_event(Event::Empty(elem));
        }
        let _ = writer.write_event(Event::End(BytesEnd::new("spine")));

        let _ = writer.write_event(Event::End(BytesEnd::new("package")));

        String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
    }
}

/// Write an element holding escaped text.
fn write_text_element<W: std::io::Write>(writer: &mut Writer<W>, start: BytesStart, text: &str) {
    let end = BytesEnd::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    let _ = writer.write_event(Event::Start(start));
    let _ = writer.write_event(Event::Text(BytesText::new(text)));
    let _ = writer.write_event(Event::End(end));
}

/// Generate the navigation document with a single entry for `content_href`.
pub fn generate_nav(title: &str, content_href: &str, stylesheet_href: &str) -> String {
    let title = escape(title);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
  <title>{title}</title>
  <link rel="stylesheet" type="text/css" href="{css}"/>
</head>
<body>
  <nav epub:type="toc">
    <h1>Contents</h1>
    <ol>
      <li><a href="{href}">{title}</a></li>
    </ol>
  </nav>
</body>
</html>
"#,
        title = title,
        css = escape(stylesheet_href),
        href = escape(content_href),
    )
}

/// Wrap body markup in a minimal XHTML document.
pub fn generate_content(title: &str, body: &str, stylesheet_href: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <title>{}</title>
  <link rel="stylesheet" type="text/css" href="{}"/>
</head>
<body>
{}
</body>
</html>
"#,
        escape(title),
        escape(stylesheet_href),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn identity() -> PackageIdentity {
        PackageIdentity {
            identifier: "urn:uuid:fixed".to_string(),
            modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_opf_metadata() {
        let opf = PackageBuilder::new(identity(), "Tom & Jerry <1>")
            .author("")
            .spine_item(ManifestItem::new("content", "content.xhtml", "application/xhtml+xml"))
            .item(ManifestItem::new("nav", "nav.xhtml", "application/xhtml+xml").properties("nav"))
            .build();

        assert!(opf.contains(r#"<dc:identifier id="bookid">urn:uuid:fixed</dc:identifier>"#));
        assert!(opf.contains("Tom &amp; Jerry &lt;1&gt;"));
        assert!(opf.contains("<dc:creator>Unknown</dc:creator>"));
        assert!(opf.contains("<dc:language>en</dc:language>"));
        assert!(opf.contains("2024-05-01T12:00:00Z"));
        assert!(opf.contains(r#"properties="nav""#));
        assert_eq!(opf.matches("<itemref ").count(), 1);
        assert!(opf.contains(r#"<itemref idref="content"/>"#));
    }

    #[test]
    fn test_generated_identity_is_fresh() {
        let a = PackageIdentity::generate();
        let b = PackageIdentity::generate();
        assert_ne!(a.identifier, b.identifier);
        assert!(a.identifier.starts_with("urn:uuid:"));
    }

    #[test]
    fn test_nav_links_content() {
        let nav = generate_nav("A <Story>", "content.xhtml", "style.css");
        assert!(nav.contains(r#"<a href="content.xhtml">A &lt;Story&gt;</a>"#));
        assert!(nav.contains(r#"epub:type="toc""#));
    }
}
