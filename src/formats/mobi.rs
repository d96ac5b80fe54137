//! MOBI support through the external `mobitool` extraction tool.
//!
//! `mobitool -s <file>` dumps the book's sources into `<stem>_markup/` next to
//! the input and ignores any output flag, so every run stages the input under
//! a fresh temporary directory with a fixed name. The staging directory is a
//! [`TempDir`] and is removed on every exit path, including timeouts and
//! cancellation.

use crate::cancel::until_cancelled;
use crate::config::ToolsConfig;
use crate::epub::ExtractedContent;
use crate::error::{AppError, Result};
use crate::library::book::BookMetadata;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Name the input is staged under.
const STAGED_NAME: &str = "input.mobi";

/// Directory mobitool derives from [`STAGED_NAME`].
const MARKUP_DIR: &str = "input_markup";

/// Image files collected from a source dump.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "svg"];

/// Handle to a located `mobitool` executable.
#[derive(Debug, Clone)]
pub struct MobiTool {
    path: PathBuf,
    probe_timeout: Duration,
    conversion_timeout: Duration,
    staging_root: Option<PathBuf>,
}

/// Source dump produced by one extraction run.
///
/// Dropping it deletes the staging directory.
#[derive(Debug)]
pub struct ExtractionOutput {
    staging: TempDir,
    markup_dir: PathBuf,
}

impl ExtractionOutput {
    /// Directory holding the dumped HTML and images.
    pub fn markup_dir(&self) -> &Path {
        &self.markup_dir
    }

    /// Staging directory root.
    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Read the dumped HTML fragments and images, then clean up.
    pub fn into_content(self) -> Result<ExtractedContent> {
        let content = read_markup_dir(&self.markup_dir)?;
        if content.html_fragments.is_empty() {
            return Err(AppError::NoContentExtracted(
                self.markup_dir.display().to_string(),
            ));
        }
        Ok(content)
    }
}

impl MobiTool {
    /// Use the tool at `path` with default timeouts.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let defaults = ToolsConfig::default();
        Self {
            path: path.into(),
            probe_timeout: defaults.probe_timeout(),
            conversion_timeout: defaults.conversion_timeout(),
            staging_root: None,
        }
    }

    /// Override the probe and conversion timeouts.
    pub fn with_timeouts(mut self, probe: Duration, conversion: Duration) -> Self {
        self.probe_timeout = probe;
        self.conversion_timeout = conversion;
        self
    }

    /// Create staging directories under `root` instead of the system temp dir.
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// Path to the executable.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Install locations probed, in order.
    pub fn candidates(config: &ToolsConfig) -> Vec<PathBuf> {
        let exe_name = format!("mobitool{}", std::env::consts::EXE_SUFFIX);
        let mut candidates = Vec::new();

        if let Some(explicit) = &config.mobitool {
            candidates.push(explicit.clone());
        }

        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf));
        let cwd = std::env::current_dir().ok();

        for base in [exe_dir, cwd].into_iter().flatten() {
            candidates.push(base.join("Tools").join(&exe_name));
            candidates.push(base.join(&exe_name));
        }

        candidates
    }

    /// Find the tool in the configured or default locations.
    pub fn locate(config: &ToolsConfig) -> Result<Self> {
        let candidates = Self::candidates(config);

        let path = candidates.iter().find(|p| p.is_file()).cloned().ok_or_else(|| {
            let looked = candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            AppError::ToolNotFound(looked)
        })?;

        tracing::debug!(path = %path.display(), "Found mobitool");

        Ok(Self::new(path).with_timeouts(config.probe_timeout(), config.conversion_timeout()))
    }

    /// Dump the sources of `input` for conversion.
    ///
    /// A non-zero exit surfaces the tool's stderr.
    pub async fn extract(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutput> {
        let (staging, output) = self.dump_sources(input, self.conversion_timeout, cancel).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::ToolExecution(format!(
                "mobitool exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let markup_dir = staging.path().join(MARKUP_DIR);
        if !markup_dir.is_dir() {
            return Err(AppError::ToolExecution(
                "mobitool did not create expected output folder".to_string(),
            ));
        }

        Ok(ExtractionOutput {
            staging,
            markup_dir,
        })
    }

    /// Extract the cover image of `input`, bounded by the probe timeout.
    pub async fn extract_cover(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        let (staging, _output) = self.dump_sources(input, self.probe_timeout, cancel).await?;

        // The exit status is not checked: a partial dump may still hold the cover.
        let markup_dir = staging.path().join(MARKUP_DIR);
        if !markup_dir.is_dir() {
            return Ok(None);
        }

        let cover = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&markup_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            files.sort();

            match pick_cover(&files) {
                Some(path) => Ok(Some(std::fs::read(path)?)),
                None => Ok(None),
            }
        })
        .await??;

        drop(staging);
        Ok(cover)
    }

    /// Read title and author from the tool's plain (flagless) output.
    pub async fn read_metadata(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<BookMetadata> {
        let mut command = Command::new(&self.path);
        command.arg(input);

        let output = self.run(command, self.probe_timeout, cancel).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::ToolExecution(stderr.trim().to_string()));
        }

        Ok(parse_metadata_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    /// Stage `input` and run `mobitool -s` on the staged copy.
    async fn dump_sources(
        &self,
        input: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(TempDir, Output)> {
        if !input.is_file() {
            return Err(AppError::FileNotFound(input.display().to_string()));
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("booky_");
        let staging = match &self.staging_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let staged = staging.path().join(STAGED_NAME);
        tokio::fs::copy(input, &staged).await?;

        tracing::debug!(
            input = %input.display(),
            staging = %staging.path().display(),
            "Dumping MOBI sources"
        );

        let mut command = Command::new(&self.path);
        command.arg("-s").arg(&staged);

        let output = self.run(command, timeout, cancel).await?;
        Ok((staging, output))
    }

    /// Run the tool with captured output, killing it on timeout or cancellation.
    async fn run(
        &self,
        mut command: Command,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Output> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                AppError::ToolNotFound(self.path.display().to_string())
            }
            _ => AppError::ToolExecution(format!("Failed to start mobitool: {}", e)),
        })?;

        until_cancelled(cancel, async {
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(output) => Ok(output?),
                Err(_) => {
                    tracing::warn!(tool = %self.path.display(), ?timeout, "mobitool timed out");
                    Err(AppError::ToolTimeout(timeout))
                }
            }
        })
        .await
    }
}

/// Parse `Key: value` lines, keeping `Title:` and `Author:`.
pub fn parse_metadata_output(output: &str) -> BookMetadata {
    let mut metadata = BookMetadata::default();

    for line in output.lines() {
        let line = line.trim_start();
        if let Some(value) = strip_prefix_ignore_case(line, "Title:") {
            metadata.title = non_empty(value);
        } else if let Some(value) = strip_prefix_ignore_case(line, "Author:") {
            metadata.author = non_empty(value);
        }
    }

    metadata
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Choose the cover among dumped files: a named cover, else the first image.
pub fn pick_cover(files: &[PathBuf]) -> Option<&PathBuf> {
    let raster = |p: &&PathBuf| is_image(p) && !has_extension(p, "svg");

    files
        .iter()
        .filter(raster)
        .find(|p| {
            let stem = p
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_lowercase();
            stem.contains("cover") || stem == "image00000" || stem == "image00001"
        })
        .or_else(|| files.iter().find(raster))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Collect HTML fragments (recursively, sorted by path) and top-level images.
fn read_markup_dir(markup_dir: &Path) -> Result<ExtractedContent> {
    let mut html_files: Vec<PathBuf> = WalkDir::new(markup_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| has_extension(p, "html") || has_extension(p, "htm"))
        .collect();
    html_files.sort();

    let mut html_fragments = Vec::with_capacity(html_files.len());
    for path in &html_files {
        let bytes = std::fs::read(path)?;
        html_fragments.push(String::from_utf8_lossy(&bytes).into_owned());
    }

    let mut images = BTreeMap::new();
    for entry in WalkDir::new(markup_dir).max_depth(1).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_image(path) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            images.insert(name.to_string(), std::fs::read(path)?);
        }
    }

    tracing::debug!(
        html = html_fragments.len(),
        images = images.len(),
        "Collected extracted content"
    );

    Ok(ExtractedContent {
        html_fragments,
        images,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_output() {
        let output = "Full name: something\r\ntitle:  Dune  \r\nAUTHOR: Frank Herbert\n";
        let metadata = parse_metadata_output(output);
        assert_eq!(metadata.title.as_deref(), Some("Dune"));
        assert_eq!(metadata.author.as_deref(), Some("Frank Herbert"));
    }

    #[test]
    fn test_parse_metadata_missing_lines() {
        let metadata = parse_metadata_output("Language: en\nPublisher: Ace\n");
        assert_eq!(metadata, BookMetadata::default());

        let metadata = parse_metadata_output("Title:\n");
        assert!(metadata.title.is_none());
    }

    #[test]
    fn test_pick_cover_prefers_named_cover() {
        let files = vec![
            PathBuf::from("a/image00005.jpg"),
            PathBuf::from("a/my_cover.png"),
            PathBuf::from("a/part0000.html"),
        ];
        assert_eq!(pick_cover(&files), Some(&files[1]));
    }

    #[test]
    fn test_pick_cover_falls_back_to_first_image() {
        let files = vec![
            PathBuf::from("a/part0000.html"),
            PathBuf::from("a/image00007.gif"),
        ];
        assert_eq!(pick_cover(&files), Some(&files[1]));
        assert!(pick_cover(&files[..1]).is_none());
    }

    #[test]
    fn test_read_markup_dir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part0001.html"), "<p>two</p>").unwrap();
        std::fs::write(dir.path().join("part0000.html"), "<p>one</p>").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("x.htm"), "<p>three</p>").unwrap();
        std::fs::write(dir.path().join("nested").join("deep.png"), b"png").unwrap();
        std::fs::write(dir.path().join("image00001.jpg"), b"jpg").unwrap();
        std::fs::write(dir.path().join("style.css"), "p {}").unwrap();

        let content = read_markup_dir(dir.path()).unwrap();
        assert_eq!(
            content.html_fragments,
            vec!["<p>three</p>", "<p>one</p>", "<p>two</p>"]
        );
        assert_eq!(content.images.len(), 1);
        assert_eq!(content.images["image00001.jpg"], b"jpg");
    }

    #[test]
    fn test_locate_reports_candidates() {
        let config = ToolsConfig {
            mobitool: Some(PathBuf::from("/definitely/not/here/mobitool")),
            ..ToolsConfig::default()
        };

        let candidates = MobiTool::candidates(&config);
        assert_eq!(candidates[0], PathBuf::from("/definitely/not/here/mobitool"));

        // Only meaningful when no mobitool sits next to the test binary or cwd.
        if candidates.iter().all(|p| !p.is_file()) {
            match MobiTool::locate(&config) {
                Err(AppError::ToolNotFound(looked)) => {
                    assert!(looked.contains("/definitely/not/here/mobitool"))
                }
                other => panic!("expected ToolNotFound, got {:?}", other),
            }
        }
    }
    #[cfg(unix)]
    mod tool {
        use super::*;
        use crate::testing::fake_mobitool;
        use std::time::Instant;

        struct Fixture {
            dir: tempfile::TempDir,
            staging: tempfile::TempDir,
            tool: MobiTool,
        }

        impl Fixture {
            fn new(timeout: Duration) -> Self {
                let dir = tempfile::tempdir().unwrap();
                let staging = tempfile::tempdir().unwrap();
                let tool = MobiTool::new(fake_mobitool(dir.path()))
                    .with_timeouts(timeout, timeout)
                    .with_staging_root(staging.path());
                Self {
                    dir,
                    staging,
                    tool,
                }
            }

            fn input(&self, name: &str, body: &str) -> PathBuf {
                let path = self.dir.path().join(name);
                std::fs::write(&path, body).unwrap();
                path
            }

            fn leftover_staging(&self) -> usize {
                std::fs::read_dir(self.staging.path()).unwrap().count()
            }
        }

        #[tokio::test]
        async fn test_extract_timeout_kills_tool_and_cleans_up() {
            let fx = Fixture::new(Duration::from_millis(300));
            let input = fx.input("slow.mobi", "SLEEP");

            let started = Instant::now();
            let res = fx.tool.extract(&input, &CancellationToken::new()).await;

            assert!(
                matches!(res, Err(AppError::ToolTimeout(d)) if d == Duration::from_millis(300)),
                "got {:?}",
                res
            );
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(fx.leftover_staging(), 0);
        }

        #[tokio::test]
        async fn test_cover_timeout_removes_staging() {
            let fx = Fixture::new(Duration::from_millis(200));
            let input = fx.input("slow.mobi", "SLEEP");

            let res = fx.tool.extract_cover(&input, &CancellationToken::new()).await;

            assert!(matches!(res, Err(AppError::ToolTimeout(_))), "got {:?}", res);
            assert_eq!(fx.leftover_staging(), 0);
        }

        #[tokio::test]
        async fn test_failed_extraction_removes_staging() {
            let fx = Fixture::new(Duration::from_secs(10));
            let input = fx.input("bad.mobi", "FAIL");

            match fx.tool.extract(&input, &CancellationToken::new()).await {
                Err(AppError::ToolExecution(msg)) => assert!(msg.contains("corrupt input")),
                other => panic!("expected ToolExecution, got {:?}", other),
            }
            assert_eq!(fx.leftover_staging(), 0);
        }

        #[tokio::test]
        async fn test_staging_lives_until_content_is_read() {
            let fx = Fixture::new(Duration::from_secs(10));
            let input = fx.input("good.mobi", "ok");

            let output = fx.tool.extract(&input, &CancellationToken::new()).await.unwrap();
            assert!(output.staging_dir().starts_with(fx.staging.path()));
            assert!(output.markup_dir().join("part0000.html").is_file());
            assert_eq!(fx.leftover_staging(), 1);

            let content = output.into_content().unwrap();
            assert_eq!(content.html_fragments.len(), 1);
            assert_eq!(content.images["cover.jpg"], b"JPEGDATA");
            assert_eq!(fx.leftover_staging(), 0);
        }

        #[tokio::test]
        async fn test_cover_extracted_and_staging_removed() {
            let fx = Fixture::new(Duration::from_secs(10));
            let input = fx.input("good.mobi", "ok");

            let cover = fx.tool.extract_cover(&input, &CancellationToken::new()).await.unwrap();
            assert_eq!(cover.as_deref(), Some(&b"JPEGDATA"[..]));
            assert_eq!(fx.leftover_staging(), 0);
        }
    }
}
