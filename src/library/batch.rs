//! Multi-file conversion and delivery.

use crate::config::BookFormat;
use crate::convert::Converter;
use crate::formats::FormatProbe;
use crate::kindle::KindleClient;
use crate::library::book::{BookItem, BookStatus, ConversionRequest, output_file_name};
use crate::plugins::PluginRegistry;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Callback invoked with an item after each status change.
pub type StatusObserver = Arc<dyn Fn(&BookItem) + Send + Sync>;

/// Counts from [`Batch::convert_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionSummary {
    /// Items converted to EPUB.
    pub converted: usize,
    /// Items that failed.
    pub failed: usize,
    /// Items that needed no conversion.
    pub skipped: usize,
}

/// Counts from [`Batch::send_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendSummary {
    /// Items delivered.
    pub sent: usize,
    /// Items whose delivery failed.
    pub failed: usize,
}

/// A set of books processed one at a time.
///
/// Items are shared behind a lock so a UI or logger can read them while the
/// batch runs; each status change is applied atomically and then reported to
/// the observer.
#[derive(Clone, Default)]
pub struct Batch {
    items: Arc<RwLock<Vec<BookItem>>>,
    observer: Option<StatusObserver>,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("items", &self.items.read().len())
            .finish_non_exhaustive()
    }
}

impl Batch {
    /// Create a batch from prepared items.
    pub fn new(items: Vec<BookItem>) -> Self {
        Self {
            items: Arc::new(RwLock::new(items)),
            observer: None,
        }
    }

    /// Create items for `paths`, reading titles and authors where possible.
    ///
    /// Unsupported files are left out. Metadata read failures keep the
    /// filename-derived title.
    pub async fn from_paths(
        paths: &[PathBuf],
        probe: &FormatProbe,
        plugins: &PluginRegistry,
        cancel: &CancellationToken,
    ) -> Self {
        let mut items = Vec::with_capacity(paths.len());

        for path in paths {
            if !plugins.is_supported_file(path) {
                tracing::warn!(path = %path.display(), "Unsupported file, skipping");
                continue;
            }

            items.push(inspect_file(path, probe, cancel).await);
        }

        Self::new(items)
    }

    /// Report every status change to `observer`.
    pub fn with_observer(mut self, observer: impl Fn(&BookItem) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Copy of the current items.
    pub fn snapshot(&self) -> Vec<BookItem> {
        self.items.read().clone()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the batch has no items.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut BookItem)) {
        let updated = {
            let mut items = self.items.write();
            items.iter_mut().find(|i| i.id == id).map(|item| {
                apply(item);
                item.clone()
            })
        };

        if let (Some(item), Some(observer)) = (updated, &self.observer) {
            observer(&item);
        }
    }

    /// Convert every item that needs it, continuing past failures.
    pub async fn convert_all(
        &self,
        converter: &Converter,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> ConversionSummary {
        let mut summary = ConversionSummary::default();
        let mut used_names = HashSet::new();

        for item in self.snapshot() {
            if cancel.is_cancelled() {
                break;
            }

            if !matches!(item.status, BookStatus::Pending | BookStatus::Failed) {
                summary.skipped += 1;
                continue;
            }

            if item.display_title.trim().is_empty() {
                self.update(item.id, |i| {
                    i.status = BookStatus::Failed;
                    i.error = Some("No title".to_string());
                });
                summary.failed += 1;
                continue;
            }

            let request = ConversionRequest {
                title: item.display_title.clone(),
                author: item.display_author.clone(),
                input_path: item.source_path.clone(),
                output_path: unique_output_path(output_dir, &item, &mut used_names),
            };

            self.update(item.id, |i| {
                i.status = BookStatus::Converting;
                i.error = None;
            });

            match converter.convert(&request, cancel).await {
                Ok(output) => {
                    self.update(item.id, |i| {
                        i.status = BookStatus::Done;
                        i.output_path = Some(output);
                    });
                    summary.converted += 1;
                }
                Err(e) => {
                    tracing::warn!(file = item.filename(), error = %e, "Conversion failed");
                    self.update(item.id, |i| {
                        i.status = BookStatus::Failed;
                        i.error = Some(e.to_string());
                    });
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            converted = summary.converted,
            failed = summary.failed,
            skipped = summary.skipped,
            "Batch conversion finished"
        );
        summary
    }

    /// Send every item that has an EPUB, continuing past failures.
    pub async fn send_all(&self, client: &KindleClient, cancel: &CancellationToken) -> SendSummary {
        let mut summary = SendSummary::default();

        for item in self.snapshot() {
            if cancel.is_cancelled() {
                break;
            }

            let eligible = item.status.is_sendable() || item.status == BookStatus::SendFailed;
            let Some(path) = item.sendable_path().filter(|_| eligible).map(Path::to_path_buf)
            else {
                continue;
            };

            self.update(item.id, |i| i.status = BookStatus::Sending);

            let result = client
                .send_file(&path, &item.display_title, &item.display_author, cancel)
                .await;

            if result.success {
                self.update(item.id, |i| {
                    i.status = BookStatus::Sent;
                    i.error = None;
                });
                summary.sent += 1;
            } else {
                self.update(item.id, |i| {
                    i.status = BookStatus::SendFailed;
                    i.error = result.error_message.clone();
                });
                summary.failed += 1;
            }
        }

        tracing::info!(sent = summary.sent, failed = summary.failed, "Batch send finished");
        summary
    }
}

/// Item for `path` with the title and author the file declares.
///
/// Read failures are logged and leave the filename-derived title and an
/// empty author in place. Extensions outside the built-in formats are treated
/// as needing conversion.
pub async fn inspect_file(path: &Path, formats: &FormatProbe, cancel: &CancellationToken) -> BookItem {
    let mut item = BookItem::new(path.to_path_buf())
        .unwrap_or_else(|| BookItem::with_format(path.to_path_buf(), BookFormat::Mobi));

    match formats.read_metadata(path, cancel).await {
        Ok(metadata) => item.apply_metadata(metadata),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Metadata read failed, using filename");
        }
    }

    item
}

/// Output path for `item`, suffixed " (2)", " (3)", ... when an earlier item
/// in the same batch already claimed the name.
fn unique_output_path(output_dir: &Path, item: &BookItem, used: &mut HashSet<PathBuf>) -> PathBuf {
    let name = output_file_name(&item.display_title, &item.display_author);
    let mut candidate = output_dir.join(&name);

    let stem = name.trim_end_matches(".epub");
    let mut n = 2;
    while used.contains(&candidate) {
        candidate = output_dir.join(format!("{} ({}).epub", stem, n));
        n += 1;
    }

    used.insert(candidate.clone());
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn item(path: &str) -> BookItem {
        BookItem::new(PathBuf::from(path)).unwrap()
    }

    #[test]
    fn test_unique_output_path() {
        let mut used = HashSet::new();
        let dir = Path::new("/out");
        let a = item("/in/Same.mobi");
        let b = item("/other/Same.mobi");
        let c = item("/third/Same.mobi");

        assert_eq!(unique_output_path(dir, &a, &mut used), PathBuf::from("/out/Same.epub"));
        assert_eq!(unique_output_path(dir, &b, &mut used), PathBuf::from("/out/Same (2).epub"));
        assert_eq!(unique_output_path(dir, &c, &mut used), PathBuf::from("/out/Same (3).epub"));
    }

    #[tokio::test]
    async fn test_convert_all_skips_ready_and_fails_untitled() {
        let dir = tempfile::tempdir().unwrap();
        let epub = dir.path().join("ready.epub");
        let untitled = dir.path().join("_1.mobi");
        let bare = dir.path().join("bare.mobi");
        for p in [&epub, &untitled, &bare] {
            std::fs::write(p, b"x").unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = seen.clone();
        let batch = Batch::new(vec![
            BookItem::new(epub).unwrap(),
            BookItem::new(untitled).unwrap(),
            BookItem::new(bare).unwrap(),
        ])
        .with_observer(move |i| observed.lock().push((i.filename().to_string(), i.status)));

        let converter = Converter::new(Arc::new(PluginRegistry::new()), None);
        let summary = batch
            .convert_all(&converter, dir.path(), &CancellationToken::new())
            .await;

        assert_eq!(
            summary,
            ConversionSummary {
                converted: 0,
                failed: 2,
                skipped: 1
            }
        );

        let items = batch.snapshot();
        assert_eq!(items[0].status, BookStatus::Ready);
        assert_eq!(items[1].status, BookStatus::Failed);
        assert_eq!(items[1].error.as_deref(), Some("No title"));
        assert_eq!(items[2].status, BookStatus::Failed);
        assert!(items[2].error.as_deref().unwrap().contains("not found"));

        assert_eq!(
            seen.lock().as_slice(),
            &[
                ("_1.mobi".to_string(), BookStatus::Failed),
                ("bare.mobi".to_string(), BookStatus::Converting),
                ("bare.mobi".to_string(), BookStatus::Failed),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_batch_stops() {
        let dir = tempfile::tempdir().unwrap();
        let batch = Batch::new(vec![item("/in/a.mobi")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let converter = Converter::new(Arc::new(PluginRegistry::new()), None);
        let summary = batch.convert_all(&converter, dir.path(), &cancel).await;

        assert_eq!(summary, ConversionSummary::default());
        assert_eq!(batch.snapshot()[0].status, BookStatus::Pending);
    }

    #[tokio::test]
    async fn test_inspect_file_falls_back_without_tool() {
        let item = inspect_file(
            Path::new("/nonexistent/My_Great_Book-2.mobi"),
            &FormatProbe::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(item.display_title, "My Great Book");
        assert_eq!(item.display_author, "");
        assert_eq!(item.status, BookStatus::Pending);
    }

    #[tokio::test]
    async fn test_from_paths_filters_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mobi = dir.path().join("Some_Book-3.mobi");
        std::fs::write(&mobi, b"x").unwrap();
        let paths = vec![mobi.clone(), dir.path().join("notes.txt")];

        let batch = Batch::from_paths(
            &paths,
            &FormatProbe::default(),
            &PluginRegistry::new(),
            &CancellationToken::new(),
        )
        .await;

        let items = batch.snapshot();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source_path, mobi);
        assert_eq!(items[0].display_title, "Some Book");
        assert_eq!(items[0].status, BookStatus::Pending);
    }
}
