//! Disk-resident BKD tree: bulk construction, traversal, and merging.
//!
//! A BKD tree is a balanced, bulk-loaded k-dimensional tree over fixed-width
//! byte keys, built by sorting and recursive median partitioning rather than
//! incremental insertion. Leaves hold bounded point blocks written once,
//! sequentially; inner nodes carry a split dimension, a split value, and a
//! tight per-dimension bounding box used to prune queries.

pub mod reader;
pub mod sort;
pub mod writer;

pub use reader::{BkdStats, BkdTreeIndex, LeafStream};
pub use sort::Point;
pub use writer::BkdWriter;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default maximum number of points in a leaf block.
pub const DEFAULT_MAX_POINTS_IN_LEAF_NODE: usize = 1024;

/// Default heap budget for sorting, in megabytes.
pub const DEFAULT_MAX_MB_SORT_IN_HEAP: f64 = 16.0;

/// Tuning parameters for BKD tree construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BkdConfig {
    /// Maximum number of points stored in one leaf block.
    pub max_points_in_leaf_node: usize,

    /// Heap budget for sorting points, in megabytes. Inputs that exceed the
    /// budget are spilled and sorted externally.
    pub max_mb_sort_in_heap: f64,
}

impl Default for BkdConfig {
    fn default() -> Self {
        BkdConfig {
            max_points_in_leaf_node: DEFAULT_MAX_POINTS_IN_LEAF_NODE,
            max_mb_sort_in_heap: DEFAULT_MAX_MB_SORT_IN_HEAP,
        }
    }
}

impl BkdConfig {
    /// Number of points that fit in the heap budget for a given record width.
    pub(crate) fn max_points_in_heap(&self, bytes_per_point: usize) -> usize {
        let budget = (self.max_mb_sort_in_heap * 1024.0 * 1024.0) as usize;
        (budget / bytes_per_point.max(1)).max(1)
    }
}

/// How a cell's bounding box relates to the current query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Every point in the cell satisfies the query.
    CellInsideQuery,
    /// No point in the cell satisfies the query.
    CellOutsideQuery,
    /// The cell partially overlaps the query; points must be inspected.
    CellCrossesQuery,
}

/// Callback object driving a tree traversal.
///
/// The traversal calls [`compare`](IntersectVisitor::compare) on each cell's
/// bounding box. Cells fully inside the query are visited through the
/// identifier-only [`visit`](IntersectVisitor::visit) without fetching packed
/// values; this two-mode callback is part of the performance contract, not an
/// optional optimization. Implementations that require the value must return
/// an internal error from `visit` so the fast path cannot be silently
/// bypassed.
pub trait IntersectVisitor {
    /// Visit a document whose value is known to satisfy the query.
    fn visit(&mut self, doc_id: u32) -> Result<()>;

    /// Visit a document with its packed value for an exact check.
    fn visit_with_value(&mut self, doc_id: u32, packed_value: &[u8]) -> Result<()>;

    /// Relate a cell's bounding box to the query.
    fn compare(&self, min_packed_value: &[u8], max_packed_value: &[u8]) -> Relation;
}

/// A read-only view over one field's indexed point values.
pub trait PointValues {
    /// Number of indexed dimensions.
    fn num_dims(&self) -> u32;

    /// Byte width of each dimension sub-key.
    fn bytes_per_dim(&self) -> u32;

    /// Total number of indexed points.
    fn size(&self) -> u64;

    /// Minimum packed value across all points, per dimension.
    fn min_packed_value(&self) -> &[u8];

    /// Maximum packed value across all points, per dimension.
    fn max_packed_value(&self) -> &[u8];

    /// Traverse the tree, pruning by bounding box.
    fn intersect(&self, visitor: &mut dyn IntersectVisitor) -> Result<()>;
}

/// Compare one dimension's sub-key of two packed values.
///
/// Dimension bytes are unsigned-lexicographically comparable, so a plain
/// slice comparison is the dimension order.
pub(crate) fn compare_dim(
    a: &[u8],
    b: &[u8],
    dim: usize,
    bytes_per_dim: usize,
) -> std::cmp::Ordering {
    let start = dim * bytes_per_dim;
    let end = start + bytes_per_dim;
    a[start..end].cmp(&b[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BkdConfig::default();
        assert_eq!(config.max_points_in_leaf_node, 1024);
        assert_eq!(config.max_mb_sort_in_heap, 16.0);
    }

    #[test]
    fn test_max_points_in_heap() {
        let config = BkdConfig {
            max_points_in_leaf_node: 1024,
            max_mb_sort_in_heap: 1.0,
        };
        // 1 MB budget, 8-byte records
        assert_eq!(config.max_points_in_heap(8), 131072);

        // The budget never rounds down to zero points
        let tiny = BkdConfig {
            max_points_in_leaf_node: 4,
            max_mb_sort_in_heap: 0.000001,
        };
        assert_eq!(tiny.max_points_in_heap(1024), 1);
    }

    #[test]
    fn test_compare_dim() {
        let a = [0x00, 0x01, 0xFF, 0x00];
        let b = [0x00, 0x01, 0x00, 0xFF];
        assert_eq!(compare_dim(&a, &b, 0, 2), std::cmp::Ordering::Equal);
        assert_eq!(compare_dim(&a, &b, 1, 2), std::cmp::Ordering::Greater);
        assert_eq!(compare_dim(&b, &a, 1, 2), std::cmp::Ordering::Less);
    }
}
