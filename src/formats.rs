pub mod epub;
pub mod mobi;

pub use epub::EpubReader;
pub use mobi::{ExtractionOutput, MobiTool};

use crate::config::BookFormat;
use crate::error::{AppError, Result};
use crate::library::book::{BookMetadata, extension_of};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Reads metadata and covers from any supported input format.
#[derive(Debug, Clone, Default)]
pub struct FormatProbe {
    mobitool: Option<MobiTool>,
}

impl FormatProbe {
    /// Create a probe. MOBI inputs need a located `mobitool`.
    pub fn new(mobitool: Option<MobiTool>) -> Self {
        Self { mobitool }
    }

    fn format_of(path: &Path) -> Result<BookFormat> {
        let ext = extension_of(path);
        BookFormat::from_extension(&ext).ok_or(AppError::UnsupportedFormat(ext))
    }

    fn tool(&self) -> Result<&MobiTool> {
        self.mobitool
            .as_ref()
            .ok_or_else(|| AppError::ToolNotFound("mobitool is not configured".to_string()))
    }

    /// Read title and author declared by the file.
    pub async fn read_metadata(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<BookMetadata> {
        match Self::format_of(path)? {
            BookFormat::Mobi => self.tool()?.read_metadata(path, cancel).await,
            BookFormat::Epub => {
                let path = path.to_path_buf();
                tokio::task::spawn_blocking(move || EpubReader::read_metadata(&path)).await?
            }
        }
    }

    /// Extract the cover image bytes.
    pub async fn extract_cover(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        match Self::format_of(path)? {
            BookFormat::Mobi => self.tool()?.extract_cover(path, cancel).await,
            BookFormat::Epub => {
                let path = path.to_path_buf();
                tokio::task::spawn_blocking(move || EpubReader::extract_cover(&path)).await?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_extension() {
        let probe = FormatProbe::default();
        let res = probe
            .read_metadata(Path::new("notes.txt"), &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(AppError::UnsupportedFormat(ext)) if ext == ".txt"));
    }

    #[tokio::test]
    async fn test_mobi_without_tool() {
        let probe = FormatProbe::default();
        let res = probe
            .extract_cover(Path::new("book.mobi"), &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(AppError::ToolNotFound(_))));
    }
}
