//! Toolbelt Library
//!
//! Three independent helpers: tar/gzip extraction, HTTP downloads and
//! subprocess execution with an optional timeout.

pub mod core;
pub mod error;
pub mod utils;

pub use crate::core::archive::{
    extract_archive, extract_reader, extract_stream, is_gzip, is_gzip_buffered, EntryKind,
    Extractor,
};
pub use crate::core::download::{client_builder, download, Downloader};
pub use crate::core::process::{run_captured, run_wired, run_with_timeout, Completion, Streams};
pub use crate::error::{Result, ToolbeltError};
