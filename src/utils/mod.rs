//! Utility modules for the Rollgate SDK.

pub mod version;

pub use version::{compare_versions, parse_version, ParsedVersion};
