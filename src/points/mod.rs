//! Per-segment point index: write, read, and merge.
//!
//! A segment's point index pairs a data file (leaf blocks and tree
//! structures, extension `ptd`) with an index file (field number to tree
//! offset directory, extension `pti`). [`PointsWriter`] produces the pair,
//! [`PointsReader`] opens it with checksum verification, and merging runs
//! through the writer against a [`MergeState`].

pub mod format;
pub mod merge;
pub mod reader;
pub mod writer;

pub use merge::{DocIdMap, MergeSource, MergeState, PointsProvider};
pub use reader::{BkdPointValues, PointsReader};
pub use writer::PointsWriter;

use std::sync::Arc;

use crate::bkd::BkdConfig;
use crate::codec::SEGMENT_ID_LEN;
use crate::field::FieldInfos;
use crate::storage::Storage;

/// Generate a fresh segment identity token.
pub fn random_segment_id() -> [u8; SEGMENT_ID_LEN] {
    *uuid::Uuid::new_v4().as_bytes()
}

/// Everything a segment write needs: where to write, how the segment is
/// identified, and the field registry.
#[derive(Debug, Clone)]
pub struct SegmentWriteState {
    pub storage: Arc<dyn Storage>,
    pub segment_name: String,
    pub segment_id: [u8; SEGMENT_ID_LEN],
    pub segment_suffix: String,
    pub field_infos: FieldInfos,
    pub bkd_config: BkdConfig,
}

impl SegmentWriteState {
    /// Create a write state with a fresh segment id and default tuning.
    pub fn new(
        storage: Arc<dyn Storage>,
        segment_name: impl Into<String>,
        field_infos: FieldInfos,
    ) -> Self {
        SegmentWriteState {
            storage,
            segment_name: segment_name.into(),
            segment_id: random_segment_id(),
            segment_suffix: String::new(),
            field_infos,
            bkd_config: BkdConfig::default(),
        }
    }
}

/// Everything a segment read needs. The segment id and suffix must match the
/// ones the segment was written with.
#[derive(Debug, Clone)]
pub struct SegmentReadState {
    pub storage: Arc<dyn Storage>,
    pub segment_name: String,
    pub segment_id: [u8; SEGMENT_ID_LEN],
    pub segment_suffix: String,
    pub field_infos: FieldInfos,
}

impl SegmentReadState {
    /// Read state for a segment just written with the given write state.
    pub fn from_write_state(state: &SegmentWriteState) -> Self {
        SegmentReadState {
            storage: Arc::clone(&state.storage),
            segment_name: state.segment_name.clone(),
            segment_id: state.segment_id,
            segment_suffix: state.segment_suffix.clone(),
            field_infos: state.field_infos.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_segment_ids_are_distinct() {
        let a = random_segment_id();
        let b = random_segment_id();
        assert_eq!(a.len(), SEGMENT_ID_LEN);
        assert_ne!(a, b);
    }
}
