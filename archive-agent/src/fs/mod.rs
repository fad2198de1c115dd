//! Source tree traversal and exclusion matching.

pub mod matcher;
pub mod walker;

pub use matcher::PathMatcher;
pub use walker::{ArchiveEntry, TreeWalker};
