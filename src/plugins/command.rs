//! Out-of-process hooks.
//!
//! The hook program receives one JSON request on stdin and answers with one
//! [`PluginResult`] JSON object on stdout:
//!
//! ```text
//! {"stage":"pre","input":"/books/a.mobi","output":"/tmp/booky_pre_....mobi"}
//! {"stage":"format","input":"/books/a.azw3","output":"/out/a.epub","title":"A","author":""}
//! {"stage":"post","epub":"/out/a.epub"}
//! ```
//!
//! A non-zero exit is reported as a failed result carrying the program's stderr.

use crate::cancel::until_cancelled;
use crate::config::PluginConfig;
use crate::error::{AppError, Result};
use crate::plugins::{FormatPlugin, HookFuture, PluginResult, PostConversionHook, PreConversionHook};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
enum HookRequest<'a> {
    Pre {
        input: &'a Path,
        output: &'a Path,
    },
    Format {
        input: &'a Path,
        output: &'a Path,
        title: &'a str,
        author: &'a str,
    },
    Post {
        epub: &'a Path,
    },
}

/// Hook backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandHook {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    extensions: Vec<String>,
    description: Option<String>,
    timeout: Duration,
}

impl CommandHook {
    /// Create a hook running `program` for the given extensions.
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
            description: None,
            timeout: Duration::from_secs(300),
        }
    }

    /// Create a hook from a `[[plugins]]` entry.
    pub fn from_config(config: &PluginConfig) -> Self {
        let mut hook = Self::new(&config.name, &config.command, config.extensions.clone());
        hook.args = config.args.clone();
        hook.description = config.description.clone();
        hook
    }

    /// Override how long one invocation may run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn invoke(&self, request: HookRequest<'_>, cancel: &CancellationToken) -> Result<PluginResult> {
        let payload = serde_json::to_vec(&request)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Plugin(format!("{} failed to start: {}", self.name, e)))?;

        tracing::debug!(plugin = %self.name, program = %self.program.display(), "Running plugin");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Internal("plugin stdin unavailable".to_string()))?;

        let timeout = self.timeout;
        let name = &self.name;
        let output = until_cancelled(cancel, async move {
            let run = async {
                stdin.write_all(&payload).await?;
                drop(stdin);
                Ok::<_, AppError>(child.wait_with_output().await?)
            };
            tokio::time::timeout(timeout, run)
                .await
                .map_err(|_| AppError::Plugin(format!("{} timed out after {:?}", name, timeout)))?
        })
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(PluginResult::fail(format!(
                "{} exited with {}: {}",
                self.name,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(PluginResult::skip());
        }
        Ok(serde_json::from_str(stdout.trim())?)
    }
}

impl PreConversionHook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn process<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a, Result<PluginResult>> {
        Box::pin(self.invoke(HookRequest::Pre { input, output }, cancel))
    }
}

impl FormatPlugin for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn file_type_description(&self, extension: &str) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("{} File", extension.trim_start_matches('.').to_uppercase()))
    }

    fn convert_to_epub<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        title: &'a str,
        author: &'a str,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a, Result<PluginResult>> {
        Box::pin(self.invoke(
            HookRequest::Format {
                input,
                output,
                title,
                author,
            },
            cancel,
        ))
    }
}

impl PostConversionHook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn process<'a>(
        &'a self,
        epub: &'a Path,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a, Result<PluginResult>> {
        Box::pin(self.invoke(HookRequest::Post { epub }, cancel))
    }
}
