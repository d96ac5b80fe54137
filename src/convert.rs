//! Conversion orchestration.
//!
//! One request moves through
//! `Requested → PreProcessed → PluginConverted | BuiltinConverted → PostProcessed → Done`,
//! or stops at `Failed`. Pre-conversion hooks may substitute the working input;
//! any substitute is deleted when the request finishes, however it finishes.

use crate::epub::EpubAssembler;
use crate::error::{AppError, Result};
use crate::formats::MobiTool;
use crate::library::book::{ConversionRequest, extension_of};
use crate::plugins::PluginRegistry;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Progress of one conversion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStage {
    /// Accepted, nothing run yet.
    Requested,
    /// Pre-conversion hooks finished.
    PreProcessed,
    /// A format plugin produced the EPUB.
    PluginConverted,
    /// The built-in MOBI path produced the EPUB.
    BuiltinConverted,
    /// Post-conversion hooks finished.
    PostProcessed,
    /// Conversion complete.
    Done,
    /// Conversion failed.
    Failed,
}

impl fmt::Display for ConversionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConversionStage::Requested => "requested",
            ConversionStage::PreProcessed => "pre-processed",
            ConversionStage::PluginConverted => "plugin-converted",
            ConversionStage::BuiltinConverted => "builtin-converted",
            ConversionStage::PostProcessed => "post-processed",
            ConversionStage::Done => "done",
            ConversionStage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Working input of a request. Deletes any hook-produced substitute on drop.
struct WorkingInput {
    original: PathBuf,
    current: PathBuf,
}

impl WorkingInput {
    fn new(original: &Path) -> Self {
        Self {
            original: original.to_path_buf(),
            current: original.to_path_buf(),
        }
    }

    fn path(&self) -> &Path {
        &self.current
    }

    fn is_substituted(&self) -> bool {
        self.current != self.original
    }

    /// Replace the working file, deleting the previous substitute.
    fn substitute(&mut self, path: PathBuf) {
        if path == self.current {
            return;
        }
        let previous = std::mem::replace(&mut self.current, path);
        if previous != self.original {
            remove_quietly(&previous);
        }
    }
}

impl Drop for WorkingInput {
    fn drop(&mut self) {
        if self.is_substituted() {
            remove_quietly(&self.current);
        }
    }
}

fn remove_quietly(path: &Path) {
    if path.exists()
        && let Err(e) = std::fs::remove_file(path)
    {
        tracing::debug!(path = %path.display(), error = %e, "Failed to remove temporary input");
    }
}

/// Runs conversion requests through hooks and the built-in MOBI path.
#[derive(Debug, Clone)]
pub struct Converter {
    plugins: Arc<PluginRegistry>,
    mobitool: Option<MobiTool>,
}

impl Converter {
    /// Create a converter. Without a `mobitool`, only plugin conversions work.
    pub fn new(plugins: Arc<PluginRegistry>, mobitool: Option<MobiTool>) -> Self {
        Self { plugins, mobitool }
    }

    /// Plugins used by this converter.
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Convert one request and return the EPUB it produced.
    pub async fn convert(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let span = tracing::info_span!("convert", input = %request.input_path.display());
        tracing::debug!(
            parent: &span,
            stage = %ConversionStage::Requested,
            "Conversion requested"
        );

        match self.run(request, cancel).instrument(span.clone()).await {
            Ok(output) => {
                tracing::info!(
                    parent: &span,
                    stage = %ConversionStage::Done,
                    output = %output.display(),
                    "Conversion complete"
                );
                Ok(output)
            }
            Err(e) => {
                tracing::warn!(
                    parent: &span,
                    stage = %ConversionStage::Failed,
                    error = %e,
                    "Conversion failed"
                );
                Err(e)
            }
        }
    }

    async fn run(&self, request: &ConversionRequest, cancel: &CancellationToken) -> Result<PathBuf> {
        if !request.input_path.is_file() {
            return Err(AppError::FileNotFound(request.input_path.display().to_string()));
        }

        let working = self.run_pre_hooks(&request.input_path, cancel).await?;
        tracing::debug!(
            stage = %ConversionStage::PreProcessed,
            substituted = working.is_substituted(),
            "Pre-conversion hooks finished"
        );

        let stage = self.produce(request, working.path(), cancel).await?;
        drop(working);
        tracing::debug!(stage = %stage, "EPUB produced");

        self.run_post_hooks(&request.output_path, cancel).await;
        tracing::debug!(stage = %ConversionStage::PostProcessed, "Post-conversion hooks finished");

        Ok(request.output_path.clone())
    }

    /// Run every matching pre-conversion hook in order. Failing hooks are skipped.
    async fn run_pre_hooks(&self, input: &Path, cancel: &CancellationToken) -> Result<WorkingInput> {
        let ext = extension_of(input);
        let mut working = WorkingInput::new(input);

        for hook in self.plugins.pre_hooks_for(&ext) {
            let temp_output = std::env::temp_dir().join(format!("booky_pre_{}{}", Uuid::new_v4(), ext));

            match hook.process(working.path(), &temp_output, cancel).await {
                Ok(result) if result.success => match result.output_path {
                    Some(path) => {
                        tracing::info!(plugin = hook.name(), substitute = %path.display(), "Pre-conversion hook substituted input");
                        if path != temp_output {
                            remove_quietly(&temp_output);
                        }
                        working.substitute(path);
                    }
                    None => remove_quietly(&temp_output),
                },
                Ok(result) => {
                    tracing::warn!(
                        plugin = hook.name(),
                        error = result.error_message.as_deref().unwrap_or("unknown"),
                        "Pre-conversion hook failed"
                    );
                    remove_quietly(&temp_output);
                }
                Err(AppError::Cancelled) => {
                    remove_quietly(&temp_output);
                    return Err(AppError::Cancelled);
                }
                Err(e) => {
                    tracing::warn!(plugin = hook.name(), error = %e, "Pre-conversion hook failed");
                    remove_quietly(&temp_output);
                }
            }
        }

        Ok(working)
    }

    /// Produce the EPUB through a format plugin or the built-in MOBI path.
    async fn produce(
        &self,
        request: &ConversionRequest,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<ConversionStage> {
        let ext = extension_of(input);

        if let Some(plugin) = self.plugins.format_plugin_for(&ext) {
            tracing::info!(plugin = plugin.name(), "Converting with format plugin");
            let result = plugin
                .convert_to_epub(
                    input,
                    &request.output_path,
                    &request.title,
                    &request.author,
                    cancel,
                )
                .await?;

            if !result.success {
                return Err(AppError::PluginConversionFailed(
                    result
                        .error_message
                        .unwrap_or_else(|| "Plugin conversion failed".to_string()),
                ));
            }
            return Ok(ConversionStage::PluginConverted);
        }

        let original_ext = extension_of(&request.input_path);
        if original_ext != ".mobi" {
            return Err(AppError::UnsupportedFormat(format!(
                "{}. Only MOBI files are supported",
                original_ext
            )));
        }

        let tool = self.mobitool.as_ref().ok_or_else(|| {
            AppError::ToolNotFound("no mobitool configured or installed".to_string())
        })?;

        let extraction = tool.extract(input, cancel).await?;
        let content = tokio::task::spawn_blocking(move || extraction.into_content()).await??;

        let assembler = EpubAssembler::new(request.title.as_str(), request.author.as_str());
        let output = request.output_path.clone();
        tokio::task::spawn_blocking(move || assembler.assemble(&content, &output)).await??;

        Ok(ConversionStage::BuiltinConverted)
    }

    /// Run every post-conversion hook. Failures are logged only.
    async fn run_post_hooks(&self, epub: &Path, cancel: &CancellationToken) {
        for hook in self.plugins.post_hooks() {
            match hook.process(epub, cancel).await {
                Ok(result) if result.success => {
                    tracing::debug!(plugin = hook.name(), "Post-conversion hook finished");
                }
                Ok(result) => tracing::warn!(
                    plugin = hook.name(),
                    error = result.error_message.as_deref().unwrap_or("unknown"),
                    "Post-conversion hook failed"
                ),
                Err(e) => {
                    tracing::warn!(plugin = hook.name(), error = %e, "Post-conversion hook failed")
                }
            }
        }
    }
}
