//! Configuration parsing and types.
//!
//! - `types` - `Config` and its accessors with built-in defaults
//! - `parser` - YAML discovery and parsing
//! - `duration` - duration strings (`30s`, `500ms`)
//! - `validation` - range and value checks

mod duration;
mod parser;
mod types;
mod validation;

pub use duration::*;
pub use parser::*;
pub use types::*;
