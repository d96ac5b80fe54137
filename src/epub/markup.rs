//! HTML normalization for dumped MOBI markup.

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;

static BODY_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<body[\s>/]").expect("valid regex"));
static DOCTYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<!DOCTYPE[^>]*>").expect("valid regex"));
static XML_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\?xml[^>]*\?>").expect("valid regex"));
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?html[^>]*>").expect("valid regex"));
static HEAD_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<head[\s>].*?</head>").expect("valid regex"));
static BODY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?body[^>]*>").expect("valid regex"));
static VOID_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)<(area|base|br|col|embed|hr|img|input|link|meta|param|source|track|wbr)\b([^>]*?)\s*/?>",
    )
    .expect("valid regex")
});
static BODY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid selector"));

/// Strip document wrappers from a fragment, keeping the body's inner markup.
///
/// Fragments with a `<body>` element go through the HTML parser; anything
/// else has its doctype, `html`, `head` and `body` tags removed textually.
pub fn strip_document_wrappers(html: &str) -> String {
    if BODY_OPEN.is_match(html) {
        let document = Html::parse_document(html);
        if let Some(body) = document.select(&BODY_SELECTOR).next() {
            return body.inner_html().trim().to_string();
        }
    }

    let content = XML_DECL.replace_all(html, "");
    let content = DOCTYPE.replace_all(&content, "");
    let content = HTML_TAG.replace_all(&content, "");
    let content = HEAD_BLOCK.replace_all(&content, "");
    let content = BODY_TAG.replace_all(&content, "");
    content.trim().to_string()
}

/// Make parser-serialized markup acceptable to XHTML readers.
pub fn to_xhtml(markup: &str) -> String {
    VOID_ELEMENT
        .replace_all(markup, "<$1$2 />")
        .replace("&nbsp;", "&#160;")
}

/// Point `src` attributes naming an extracted image at the `images/` folder.
pub fn rewrite_image_sources<'a>(markup: &str, names: impl IntoIterator<Item = &'a str>) -> String {
    let mut content = markup.to_string();
    for name in names {
        content = content
            .replace(
                &format!("src=\"{}\"", name),
                &format!("src=\"images/{}\"", name),
            )
            .replace(&format!("src='{}'", name), &format!("src='images/{}'", name));
    }
    content
}

/// Normalize all fragments into one body, in the given order.
pub fn merge_fragments<'a>(
    fragments: &[String],
    image_names: impl IntoIterator<Item = &'a str>,
) -> String {
    let body = fragments
        .iter()
        .map(|f| to_xhtml(&strip_document_wrappers(f)))
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    rewrite_image_sources(&body, image_names)
}
