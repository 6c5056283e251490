//! # Yari
//!
//! A disk-resident BKD tree library for multi-dimensional point indexing.
//!
//! Yari indexes fixed-width, multi-dimensional byte keys (points) associated
//! with document identifiers so that range and spatial queries can be answered
//! without scanning every document.
//!
//! ## Features
//!
//! - Pure Rust implementation
//! - Sort-based bulk loading with in-heap / external sort selection
//! - Checksummed two-file binary format (data + index)
//! - Bounding-box pruned query traversal
//! - Segment merging with a streaming fast path for 1-D trees
//! - Pluggable storage backends

pub mod bkd;
pub mod codec;
pub mod error;
pub mod field;
pub mod points;
pub mod storage;
pub mod util;

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::bkd::{
        BkdConfig, BkdStats, BkdTreeIndex, BkdWriter, IntersectVisitor, PointValues, Relation,
    };
    pub use crate::error::{Result, YariError};
    pub use crate::field::{FieldInfo, FieldInfos};
    pub use crate::points::{
        DocIdMap, MergeSource, MergeState, PointsReader, PointsWriter, SegmentReadState,
        SegmentWriteState,
    };
    pub use crate::storage::{FileStorage, MemoryStorage, Storage, StorageConfig};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
