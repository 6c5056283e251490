//! Utility modules for Yari.

pub mod varint;

// Re-export commonly used types
pub use varint::*;
