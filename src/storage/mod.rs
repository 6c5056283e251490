//! Storage abstraction layer for Yari.
//!
//! This module provides a pluggable storage system. The BKD core reads and
//! writes its per-segment artifacts and sort-engine scratch files through
//! these traits, so backends like file system or memory storage can be
//! swapped freely.

pub mod file;
pub mod memory;
pub mod traits;

// Re-export commonly used types
pub use file::*;
pub use memory::*;
pub use traits::*;
