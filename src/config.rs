use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Convert MOBI ebooks to EPUB and send them to Kindle.
#[derive(Parser, Debug, Clone)]
#[command(name = "booky")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "BOOKY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Convert books to EPUB (EPUB inputs are left as they are).
    Convert {
        /// Input files.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output directory for converted EPUBs.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Convert books as needed, then send them to Kindle.
    Send {
        /// Input files.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output directory for converted EPUBs.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import Amazon session cookies captured by the login helper.
    Login {
        /// JSON file with cookie records.
        #[arg(long)]
        cookies: PathBuf,
    },

    /// Forget the stored Amazon session.
    Logout,

    /// Show whether a Kindle session is configured.
    Status {
        /// Also check the session against Amazon.
        #[arg(long)]
        verify: bool,
    },

    /// Print title and author of a book.
    Info {
        /// Input file.
        file: PathBuf,
    },

    /// Extract the cover image of a book.
    Cover {
        /// Input file.
        file: PathBuf,

        /// Where to write the image.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List configured plugins.
    Plugins,

    /// Create a default config file.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// External tool configuration.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Send-to-Kindle configuration.
    #[serde(default)]
    pub kindle: KindleConfig,

    /// Session storage configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,

    /// Out-of-process plugins.
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// External tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Explicit path to mobitool, tried before the default locations.
    #[serde(default)]
    pub mobitool: Option<PathBuf>,

    /// Timeout for metadata and cover probes.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout for a full source dump during conversion.
    #[serde(default = "default_conversion_timeout")]
    pub conversion_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mobitool: None,
            probe_timeout_secs: default_probe_timeout(),
            conversion_timeout_secs: default_conversion_timeout(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_conversion_timeout() -> u64 {
    300
}

impl ToolsConfig {
    /// Probe timeout as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Conversion timeout as a duration.
    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory converted EPUBs are written to.
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Send-to-Kindle web endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindleConfig {
    /// Base URL of the Send to Kindle web API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Browser user agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Origin header.
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Referer header.
    #[serde(default = "default_referer")]
    pub referer: String,

    /// Extension name reported to the API.
    #[serde(default = "default_ext_name")]
    pub ext_name: String,

    /// Extension version reported to the API.
    #[serde(default = "default_ext_version")]
    pub ext_version: String,

    /// How long a fetched CSRF token is reused.
    #[serde(default = "default_csrf_ttl")]
    pub csrf_ttl_secs: u64,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Extra attempts for the presigned upload (0 = no retry).
    #[serde(default)]
    pub upload_retries: u32,
}

impl Default for KindleConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            origin: default_origin(),
            referer: default_referer(),
            ext_name: default_ext_name(),
            ext_version: default_ext_version(),
            csrf_ttl_secs: default_csrf_ttl(),
            request_timeout_secs: default_request_timeout(),
            upload_retries: 0,
        }
    }
}

fn default_base_url() -> String {
    "https://www.amazon.com/sendtokindle".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_origin() -> String {
    "https://www.amazon.com".to_string()
}

fn default_referer() -> String {
    "https://www.amazon.com/sendtokindle".to_string()
}

fn default_ext_name() -> String {
    "chrome_ocs".to_string()
}

fn default_ext_version() -> String {
    "2.1.1.7".to_string()
}

fn default_csrf_ttl() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    120
}

/// Session storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// JSON file holding the Amazon cookies.
    #[serde(default = "default_cookie_file")]
    pub cookie_file: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_file: default_cookie_file(),
        }
    }
}

fn default_cookie_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("booky")
        .join("kindle_web_cookies.json")
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append-only log of delivery protocol steps.
    #[serde(default = "default_delivery_log")]
    pub delivery_log: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            delivery_log: default_delivery_log(),
        }
    }
}

fn default_log_level() -> String {
    "booky_rs=info".to_string()
}

fn default_delivery_log() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("booky")
        .join("debug.log")
}

/// Stage an out-of-process plugin hooks into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStage {
    /// Runs on the input before conversion.
    Pre,
    /// Converts an input format to EPUB.
    Format,
    /// Runs on the EPUB after conversion.
    Post,
}

/// Out-of-process plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin name.
    pub name: String,

    /// Hook stage.
    pub stage: PluginStage,

    /// Executable to run.
    pub command: PathBuf,

    /// Extra arguments passed before the request is written to stdin.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extensions handled, with leading dot (e.g. ".azw3").
    #[serde(default)]
    pub extensions: Vec<String>,

    /// File type description for format plugins.
    #[serde(default)]
    pub description: Option<String>,
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("booky.toml"),
            dirs::config_dir()
                .map(|p| p.join("booky").join("config.toml"))
                .unwrap_or_default(),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# booky configuration

[tools]
# mobitool = "/usr/local/bin/mobitool"
# Timeout for metadata and cover probes
probe_timeout_secs = 5
# Timeout for a full MOBI source dump
conversion_timeout_secs = 300

[output]
dir = "."

[kindle]
# base_url = "https://www.amazon.com/sendtokindle"
csrf_ttl_secs = 60
request_timeout_secs = 120
# Extra attempts for the file upload step only
upload_retries = 0

[session]
# cookie_file = "/home/me/.config/booky/kindle_web_cookies.json"

[log]
level = "booky_rs=info"
# delivery_log = "/home/me/.local/share/booky/debug.log"

# Out-of-process plugins (optional)
# [[plugins]]
# name = "azw3"
# stage = "format"
# command = "/opt/booky/azw3-to-epub"
# extensions = [".azw3"]
# description = "Kindle AZW3 File"
"#
        .to_string()
    }
}

/// Supported book formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    /// Kindle-family input that needs conversion.
    Mobi,
    /// EPUB, ready to send as-is.
    Epub,
}

impl BookFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Epub => "application/epub+zip",
            BookFormat::Mobi => "application/x-mobipocket-ebook",
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            "mobi" | "azw" | "azw3" | "prc" => Some(BookFormat::Mobi),
            _ => None,
        }
    }

    /// Human-readable file type.
    pub fn description(&self) -> &'static str {
        match self {
            BookFormat::Epub => "EPUB File",
            BookFormat::Mobi => "Kindle MOBI File",
        }
    }
}
