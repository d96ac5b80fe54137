//! Conversion hooks.
//!
//! Three capabilities plug into the conversion pipeline, each matched by the
//! input's extension:
//!
//! - [`PreConversionHook`] rewrites the input before conversion and may
//!   substitute a new working file.
//! - [`FormatPlugin`] converts an input format to EPUB on its own.
//! - [`PostConversionHook`] processes every produced EPUB.
//!
//! Hooks are trait objects held by a [`PluginRegistry`]. The only shipped
//! implementation is [`CommandHook`], which runs an external program.

mod command;

pub use command::CommandHook;

use crate::config::{BookFormat, PluginConfig, PluginStage};
use crate::error::Result;
use crate::library::book::extension_of;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by hook methods.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome reported by a hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginResult {
    /// Whether the hook succeeded.
    pub success: bool,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// File produced by the hook, if it produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl PluginResult {
    /// Success, optionally with a produced file.
    pub fn ok(output_path: Option<PathBuf>) -> Self {
        Self {
            success: true,
            error_message: None,
            output_path,
        }
    }

    /// Failure with a message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(error.into()),
            output_path: None,
        }
    }

    /// Success without touching the file.
    pub fn skip() -> Self {
        Self::ok(None)
    }
}

fn matches_extension(extensions: &[String], ext: &str) -> bool {
    extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

/// Processes an input before conversion.
pub trait PreConversionHook: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Extensions handled, with leading dot.
    fn extensions(&self) -> &[String];

    /// Process `input`, writing any substitute to `output`.
    fn process<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a, Result<PluginResult>>;
}

/// Converts an input format to EPUB.
pub trait FormatPlugin: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Extensions handled, with leading dot.
    fn extensions(&self) -> &[String];

    /// Human-readable file type for `extension`.
    fn file_type_description(&self, extension: &str) -> String;

    /// Convert `input` into an EPUB at `output`.
    fn convert_to_epub<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        title: &'a str,
        author: &'a str,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a, Result<PluginResult>>;
}

/// Processes a produced EPUB.
pub trait PostConversionHook: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Process the EPUB at `epub`.
    fn process<'a>(
        &'a self,
        epub: &'a Path,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a, Result<PluginResult>>;
}

/// Hooks available to the conversion pipeline.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    pre: Vec<Arc<dyn PreConversionHook>>,
    format: Vec<Arc<dyn FormatPlugin>>,
    post: Vec<Arc<dyn PostConversionHook>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("pre", &self.pre.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("format", &self.format.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("post", &self.post.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command hooks from `[[plugins]]` entries.
    pub fn from_config(plugins: &[PluginConfig], timeout: std::time::Duration) -> Self {
        let mut registry = Self::new();
        for config in plugins {
            let hook = Arc::new(CommandHook::from_config(config).with_timeout(timeout));
            match config.stage {
                PluginStage::Pre => registry.register_pre(hook),
                PluginStage::Format => registry.register_format(hook),
                PluginStage::Post => registry.register_post(hook),
            }
            tracing::debug!(plugin = %config.name, stage = ?config.stage, "Registered plugin");
        }
        registry
    }

    /// Add a pre-conversion hook.
    pub fn register_pre(&mut self, hook: Arc<dyn PreConversionHook>) {
        self.pre.push(hook);
    }

    /// Add a format plugin.
    pub fn register_format(&mut self, plugin: Arc<dyn FormatPlugin>) {
        self.format.push(plugin);
    }

    /// Add a post-conversion hook.
    pub fn register_post(&mut self, hook: Arc<dyn PostConversionHook>) {
        self.post.push(hook);
    }

    /// Pre-conversion hooks for `extension`, in registration order.
    pub fn pre_hooks_for<'a>(
        &'a self,
        extension: &'a str,
    ) -> impl Iterator<Item = &'a Arc<dyn PreConversionHook>> + 'a {
        self.pre
            .iter()
            .filter(move |h| matches_extension(h.extensions(), extension))
    }

    /// First format plugin handling `extension`.
    pub fn format_plugin_for(&self, extension: &str) -> Option<&Arc<dyn FormatPlugin>> {
        self.format
            .iter()
            .find(|p| matches_extension(p.extensions(), extension))
    }

    /// Every post-conversion hook.
    pub fn post_hooks(&self) -> &[Arc<dyn PostConversionHook>] {
        &self.post
    }

    /// Whether any hook claims `path` by extension.
    pub fn is_plugin_supported_file(&self, path: &Path) -> bool {
        let ext = extension_of(path);
        self.pre_hooks_for(&ext).next().is_some() || self.format_plugin_for(&ext).is_some()
    }

    /// Whether `path` can enter the pipeline, built in or through a hook.
    pub fn is_supported_file(&self, path: &Path) -> bool {
        matches!(extension_of(path).as_str(), ".mobi" | ".epub") || self.is_plugin_supported_file(path)
    }

    /// Human-readable file type for `extension`.
    pub fn file_type_description(&self, extension: &str) -> String {
        let ext = extension.to_lowercase();
        match ext.as_str() {
            ".mobi" => return BookFormat::Mobi.description().to_string(),
            ".epub" => return BookFormat::Epub.description().to_string(),
            _ => {}
        }

        self.format_plugin_for(&ext)
            .map(|p| p.file_type_description(&ext))
            .unwrap_or_else(|| "Unknown File".to_string())
    }

    /// One line per hook, for listing.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for hook in &self.pre {
            lines.push(format!("pre     {} [{}]", hook.name(), hook.extensions().join(", ")));
        }
        for plugin in &self.format {
            lines.push(format!("format  {} [{}]", plugin.name(), plugin.extensions().join(", ")));
        }
        for hook in &self.post {
            lines.push(format!("post    {}", hook.name()));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Azw3;

    impl FormatPlugin for Azw3 {
        fn name(&self) -> &str {
            "azw3"
        }

        fn extensions(&self) -> &[String] {
            static EXTS: std::sync::LazyLock<Vec<String>> =
                std::sync::LazyLock::new(|| vec![".azw3".to_string()]);
            &EXTS
        }

        fn file_type_description(&self, _extension: &str) -> String {
            "Kindle AZW3 File".to_string()
        }

        fn convert_to_epub<'a>(
            &'a self,
            _input: &'a Path,
            _output: &'a Path,
            _title: &'a str,
            _author: &'a str,
            _cancel: &'a CancellationToken,
        ) -> HookFuture<'a, Result<PluginResult>> {
            Box::pin(async { Ok(PluginResult::ok(None)) })
        }
    }

    #[test]
    fn test_supported_files() {
        let mut registry = PluginRegistry::new();
        assert!(registry.is_supported_file(Path::new("a.MOBI")));
        assert!(registry.is_supported_file(Path::new("a.epub")));
        assert!(!registry.is_supported_file(Path::new("a.azw3")));

        registry.register_format(Arc::new(Azw3));
        assert!(registry.is_supported_file(Path::new("a.azw3")));
        assert!(registry.is_plugin_supported_file(Path::new("a.AZW3")));
        assert!(!registry.is_supported_file(Path::new("a.pdf")));
    }

    #[test]
    fn test_file_type_description() {
        let mut registry = PluginRegistry::new();
        registry.register_format(Arc::new(Azw3));

        assert_eq!(registry.file_type_description(".mobi"), "Kindle MOBI File");
        assert_eq!(registry.file_type_description(".EPUB"), "EPUB File");
        assert_eq!(registry.file_type_description(".azw3"), "Kindle AZW3 File");
        assert_eq!(registry.file_type_description(".pdf"), "Unknown File");
    }

    #[test]
    fn test_from_config_sorts_stages() {
        let plugins: Vec<PluginConfig> = toml::from_str::<crate::config::Config>(
            r#"
[[plugins]]
name = "clean"
stage = "pre"
command = "/bin/true"
extensions = [".mobi"]

[[plugins]]
name = "stamp"
stage = "post"
command = "/bin/true"
"#,
        )
        .unwrap()
        .plugins;

        let registry = PluginRegistry::from_config(&plugins, std::time::Duration::from_secs(5));
        assert_eq!(registry.pre_hooks_for(".mobi").count(), 1);
        assert_eq!(registry.pre_hooks_for(".epub").count(), 0);
        assert_eq!(registry.post_hooks().len(), 1);
        assert_eq!(registry.describe(), vec!["pre     clean [.mobi]", "post    stamp"]);
    }

    #[test]
    fn test_result_json_shape() {
        let result: PluginResult =
            serde_json::from_str(r#"{"success":true,"output_path":"/tmp/x.mobi"}"#).unwrap();
        assert_eq!(result, PluginResult::ok(Some(PathBuf::from("/tmp/x.mobi"))));

        let result: PluginResult = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert!(!result.success && result.error_message.is_none());
    }
}
