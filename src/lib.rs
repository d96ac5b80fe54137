//! booky-rs: convert MOBI ebooks to EPUB and deliver them to a Kindle library.
//!
//! MOBI files are dumped with the external `mobitool` and reassembled as
//! EPUB 3 packages. Books that are already EPUB pass through untouched.
//! Delivery uses the Send-to-Kindle web endpoints with cookies captured
//! from a browser login.
//!
//! # Features
//!
//! - MOBI to EPUB 3 conversion through `mobitool`
//! - Out-of-process pre-conversion, format and post-conversion plugins
//! - Title, author and cover probing for MOBI and EPUB inputs
//! - Persistent Amazon session cookies
//! - Four-step Send-to-Kindle delivery with a cached CSRF token
//! - Batch conversion and delivery with per-item status

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Cancellation helpers.
pub mod cancel;
/// Configuration and CLI.
pub mod config;
/// Conversion orchestration.
pub mod convert;
/// EPUB 3 assembly.
pub mod epub;
/// Error types.
pub mod error;
/// Input format readers.
pub mod formats;
/// Kindle session and delivery.
pub mod kindle;
/// Book items and batches.
pub mod library;
/// Conversion plugins.
pub mod plugins;

#[cfg(test)]
mod testing;

pub use config::{Cli, Command, Config};
pub use convert::Converter;
pub use error::{AppError, Result};
pub use kindle::{AuthSession, KindleClient, SessionStore};
pub use library::{Batch, BookItem, BookStatus};
