//! booky command-line entry point.

use anyhow::Context;
use booky_rs::{
    Batch, BookItem, Converter,
    config::{Cli, Command, Config},
    formats::{FormatProbe, MobiTool},
    kindle::{AuthSession, KindleClient, SessionStore, session::parse_cookie_export},
    library::{book::extension_of, inspect_file},
    plugins::PluginRegistry,
};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{
    EnvFilter, Layer, filter::Targets, layer::SubscriberExt, util::SubscriberInitExt,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    if let Command::Init { force } = cli.command {
        return cmd_init(force);
    }

    init_logging(&config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });

    match cli.command {
        Command::Convert { files, output } => cmd_convert(&config, files, output, &cancel).await,
        Command::Send { files, output } => cmd_send(&config, files, output, &cancel).await,
        Command::Login { cookies } => cmd_login(&config, &cookies),
        Command::Logout => cmd_logout(&config),
        Command::Status { verify } => cmd_status(&config, verify, &cancel).await,
        Command::Info { file } => cmd_info(&config, &file, &cancel).await,
        Command::Cover { file, output } => cmd_cover(&config, &file, &output, &cancel).await,
        Command::Plugins => cmd_plugins(&config),
        Command::Init { .. } => Ok(()),
    }
}

/// Console logging plus an append-only delivery log.
fn init_logging(config: &Config) {
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log.level.as_str().into()),
        );

    let delivery_log = open_delivery_log(&config.log.delivery_log).map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(Targets::new().with_target("booky_rs::kindle", tracing::Level::DEBUG))
    });

    tracing_subscriber::registry()
        .with(console)
        .with(delivery_log)
        .init();
}

fn open_delivery_log(path: &Path) -> Option<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Cannot open delivery log {}: {}", path.display(), e);
            None
        }
    }
}

/// Write a default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    println!("\nEdit config.toml to point at your mobitool.");
    println!("Then run: booky login --cookies <exported-cookies.json>");
    println!("And: booky send <book.mobi>");

    Ok(())
}

fn registry(config: &Config) -> Arc<PluginRegistry> {
    Arc::new(PluginRegistry::from_config(
        &config.plugins,
        config.tools.conversion_timeout(),
    ))
}

fn locate_mobitool(config: &Config) -> Option<MobiTool> {
    match MobiTool::locate(&config.tools) {
        Ok(tool) => Some(tool),
        Err(e) => {
            tracing::warn!(error = %e, "mobitool unavailable, MOBI inputs cannot be converted");
            None
        }
    }
}

fn load_session(config: &Config) -> (SessionStore, AuthSession) {
    let store = SessionStore::new(&config.session.cookie_file);
    let session = store.load().unwrap_or_else(|e| {
        tracing::warn!(path = %store.path().display(), error = %e, "Unreadable session file, ignoring");
        AuthSession::default()
    });
    (store, session)
}

fn print_item(item: &BookItem) {
    match &item.error {
        Some(error) => println!("  [{}] {}: {}", item.status, item.filename(), error),
        None => println!("  [{}] {}", item.status, item.filename()),
    }
}

/// Probe inputs and convert those that need it.
async fn convert_batch(
    config: &Config,
    files: Vec<PathBuf>,
    output: Option<PathBuf>,
    cancel: &CancellationToken,
) -> anyhow::Result<Batch> {
    let plugins = registry(config);
    let mobitool = locate_mobitool(config);
    let probe = FormatProbe::new(mobitool.clone());

    let batch = Batch::from_paths(&files, &probe, &plugins, cancel)
        .await
        .with_observer(print_item);
    if batch.is_empty() {
        anyhow::bail!("No supported files given");
    }

    let output_dir = output.unwrap_or_else(|| config.output.dir.clone());
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Cannot create output directory {}", output_dir.display()))?;

    let converter = Converter::new(plugins, mobitool);
    let summary = batch.convert_all(&converter, &output_dir, cancel).await;
    println!(
        "Converted {}, failed {}, unchanged {}",
        summary.converted, summary.failed, summary.skipped
    );

    Ok(batch)
}

async fn cmd_convert(
    config: &Config,
    files: Vec<PathBuf>,
    output: Option<PathBuf>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let batch = convert_batch(config, files, output, cancel).await?;

    let failed = batch.snapshot().iter().filter(|i| i.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{} book(s) failed to convert", failed);
    }
    Ok(())
}

async fn cmd_send(
    config: &Config,
    files: Vec<PathBuf>,
    output: Option<PathBuf>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (_, session) = load_session(config);
    if !session.is_configured() {
        anyhow::bail!("No Kindle session. Run: booky login --cookies <file>");
    }
    let client = KindleClient::new(&config.kindle, &session)?;

    let batch = convert_batch(config, files, output, cancel).await?;
    let summary = batch.send_all(&client, cancel).await;
    println!("Sent {}, failed {}", summary.sent, summary.failed);

    if summary.failed > 0 {
        anyhow::bail!("{} book(s) failed to send", summary.failed);
    }
    Ok(())
}

fn cmd_login(config: &Config, cookies: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(cookies)
        .with_context(|| format!("Cannot read {}", cookies.display()))?;
    let records = parse_cookie_export(&content)?;

    let store = SessionStore::new(&config.session.cookie_file);
    let session = store.import(records)?;

    println!(
        "Stored {} cookie(s) in {}",
        session.cookies().len(),
        store.path().display()
    );
    if !session.is_configured() {
        println!("Warning: no Amazon session cookie found, delivery will fail.");
    }
    Ok(())
}

fn cmd_logout(config: &Config) -> anyhow::Result<()> {
    let store = SessionStore::new(&config.session.cookie_file);
    store.clear()?;
    println!("Logged out.");
    Ok(())
}

async fn cmd_status(config: &Config, verify: bool, cancel: &CancellationToken) -> anyhow::Result<()> {
    let (store, session) = load_session(config);

    if !session.is_configured() {
        println!("Not logged in.");
        return Ok(());
    }
    println!(
        "Logged in ({} cookie(s) in {})",
        session.cookies().len(),
        store.path().display()
    );

    if verify {
        let client = KindleClient::new(&config.kindle, &session)?;
        if client.verify_session(cancel).await {
            println!("Session is valid.");
        } else {
            println!("Session expired. Please log in again.");
        }
    }
    Ok(())
}

async fn cmd_info(config: &Config, file: &Path, cancel: &CancellationToken) -> anyhow::Result<()> {
    let plugins = registry(config);
    let probe = FormatProbe::new(locate_mobitool(config));

    println!("Type:   {}", plugins.file_type_description(&extension_of(file)));
    let item = inspect_file(file, &probe, cancel).await;
    println!("Title:  {}", item.display_title);
    println!("Author: {}", item.display_author);
    Ok(())
}

async fn cmd_cover(
    config: &Config,
    file: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let probe = FormatProbe::new(locate_mobitool(config));

    let Some(bytes) = probe.extract_cover(file, cancel).await? else {
        anyhow::bail!("No cover found in {}", file.display());
    };
    std::fs::write(output, &bytes)?;
    println!("Wrote {} ({} bytes)", output.display(), bytes.len());
    Ok(())
}

fn cmd_plugins(config: &Config) -> anyhow::Result<()> {
    let lines = registry(config).describe();
    if lines.is_empty() {
        println!("No plugins configured.");
    } else {
        for line in lines {
            println!("{}", line);
        }
    }
    Ok(())
}
