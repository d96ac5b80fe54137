//! Books tracked through conversion and delivery.

pub mod batch;
pub mod book;

pub use batch::{Batch, ConversionSummary, SendSummary, StatusObserver, inspect_file};
pub use book::{BookItem, BookMetadata, BookStatus, ConversionRequest};
