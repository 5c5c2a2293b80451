//! Media library core: index, scanner, derived-artifact cache and byte
//! streaming for one media root.

pub mod cache;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod library;
pub mod logging;
pub mod scanner;
pub mod stats;
pub mod stream;
pub mod thumbs;
pub mod watcher;

pub use error::{CoreError, DerivationError, Result};
pub use library::Library;
