//! BKD tree construction.
//!
//! Points are accumulated through [`BkdWriter::add`] and bulk-built into a
//! balanced tree by [`BkdWriter::finish`]: leaves are written depth-first to
//! the data output (left subtree before right), and the serialized tree
//! structure follows them, its offset returned as the field entry value.
//! [`BkdWriter::merge`] is the single-dimension fast path that k-way merges
//! already-sorted source trees without re-sorting.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::Write;
use std::sync::Arc;

use crate::bkd::reader::{BkdTreeIndex, TreeNode};
use crate::bkd::sort::{
    self, Point, PointBuffer, PointRun, PointSet, TempFileGuard, dim_order, read_record,
    write_record,
};
use crate::bkd::BkdConfig;
use crate::codec::ChecksumOutput;
use crate::error::{Result, YariError};
use crate::points::merge::DocIdMap;
use crate::storage::{Storage, StorageOutput};

/// Maximum number of indexed dimensions.
pub const MAX_DIMS: u32 = 8;

/// Builds one field's BKD tree from an unordered stream of points.
pub struct BkdWriter {
    storage: Arc<dyn Storage>,
    num_dims: u32,
    bytes_per_dim: u32,
    packed_len: usize,
    config: BkdConfig,
    max_heap_points: usize,
    temp_prefix: String,
    guard: TempFileGuard,
    buffer: Option<PointBuffer>,
    point_count: u64,
    finished: bool,
}

impl BkdWriter {
    /// Create a writer for a field with the given dimension shape.
    pub fn new(
        storage: Arc<dyn Storage>,
        temp_prefix: impl Into<String>,
        num_dims: u32,
        bytes_per_dim: u32,
        config: BkdConfig,
    ) -> Result<Self> {
        if num_dims == 0 || num_dims > MAX_DIMS {
            return Err(YariError::index(format!(
                "dimension count must be in [1..{MAX_DIMS}], got {num_dims}"
            )));
        }
        if bytes_per_dim == 0 {
            return Err(YariError::index("bytes per dimension must be positive"));
        }
        if config.max_points_in_leaf_node == 0 {
            return Err(YariError::index("leaf size must be positive"));
        }

        let packed_len = (num_dims * bytes_per_dim) as usize;
        let max_heap_points = config.max_points_in_heap(sort::record_len(packed_len));
        let temp_prefix = temp_prefix.into();
        let buffer = PointBuffer::new(
            Arc::clone(&storage),
            temp_prefix.clone(),
            packed_len,
            max_heap_points,
        );
        let guard = TempFileGuard::new(Arc::clone(&storage));

        Ok(BkdWriter {
            storage,
            num_dims,
            bytes_per_dim,
            packed_len,
            config,
            max_heap_points,
            temp_prefix,
            guard,
            buffer: Some(buffer),
            point_count: 0,
            finished: false,
        })
    }

    /// Number of points added so far.
    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    /// Add one point.
    pub fn add(&mut self, packed_value: &[u8], doc_id: u32) -> Result<()> {
        if self.finished {
            return Err(YariError::invalid_operation(
                "cannot add points after finish",
            ));
        }
        if packed_value.len() != self.packed_len {
            return Err(YariError::index(format!(
                "packed value length {} does not match {} dims x {} bytes",
                packed_value.len(),
                self.num_dims,
                self.bytes_per_dim
            )));
        }

        let point = Point::new(packed_value.to_vec(), doc_id);
        let buffer = self
            .buffer
            .as_mut()
            .ok_or_else(|| YariError::internal("point buffer missing before finish"))?;
        buffer.push(point, &mut self.guard)?;
        self.point_count += 1;
        Ok(())
    }

    /// Build the tree and write it to the data output.
    ///
    /// Returns the offset of the serialized tree structure, or `None` when
    /// no points were added. All scratch files are released before
    /// returning, on success and on failure alike.
    pub fn finish<W: Write>(&mut self, out: &mut ChecksumOutput<W>) -> Result<Option<u64>> {
        if self.finished {
            return Err(YariError::invalid_operation("finish called twice"));
        }
        self.finished = true;

        let point_set = self
            .buffer
            .take()
            .ok_or_else(|| YariError::internal("point buffer missing before finish"))?
            .finish()?;
        if self.point_count == 0 {
            return Ok(None);
        }

        let mut nodes = Vec::new();
        let root = match point_set {
            PointSet::Heap(mut points) => self.build_in_heap(&mut points, 0, out, &mut nodes)?,
            PointSet::Offline(run) => self.build_offline(run, 0, out, &mut nodes)?,
        };

        let index = BkdTreeIndex {
            num_dims: self.num_dims,
            bytes_per_dim: self.bytes_per_dim,
            max_points_in_leaf_node: self.config.max_points_in_leaf_node as u32,
            point_count: self.point_count,
            nodes,
            root,
        };

        let offset = out.position();
        index.write_to(out)?;
        Ok(Some(offset))
    }

    /// Recursive in-memory build over a mutable point slice.
    fn build_in_heap<W: Write>(
        &mut self,
        points: &mut [Point],
        depth: u32,
        out: &mut ChecksumOutput<W>,
        nodes: &mut Vec<TreeNode>,
    ) -> Result<u32> {
        if points.len() <= self.config.max_points_in_leaf_node {
            return self.write_leaf(points, out, nodes);
        }

        let split_dim = (depth % self.num_dims) as usize;
        let bytes_per_dim = self.bytes_per_dim as usize;
        let mid = points.len() / 2;
        points.select_nth_unstable_by(mid, |a, b| dim_order(a, b, split_dim, bytes_per_dim));
        let split_value = points[mid].dim_bytes(split_dim, bytes_per_dim).to_vec();

        let (left_points, right_points) = points.split_at_mut(mid);
        let left = self.build_in_heap(left_points, depth + 1, out, nodes)?;
        let right = self.build_in_heap(right_points, depth + 1, out, nodes)?;

        Ok(self.push_inner(split_dim as u32, split_value, left, right, nodes))
    }

    /// Recursive build over an on-disk point run.
    fn build_offline<W: Write>(
        &mut self,
        run: PointRun,
        depth: u32,
        out: &mut ChecksumOutput<W>,
        nodes: &mut Vec<TreeNode>,
    ) -> Result<u32> {
        if run.count as usize <= self.max_heap_points {
            // Small enough now: load and continue in memory.
            let mut points = sort::load_run(self.storage.as_ref(), &run, self.packed_len)?;
            self.guard.delete_now(&run.name);
            return self.build_in_heap(&mut points, depth, out, nodes);
        }

        let split_dim = (depth % self.num_dims) as usize;
        let sorted = sort::external_sort_run(
            &self.storage,
            &mut self.guard,
            &self.temp_prefix,
            &run,
            self.packed_len,
            split_dim,
            self.bytes_per_dim as usize,
            self.max_heap_points,
        )?;

        let (left_run, right_run, split_value) = self.split_sorted_run(&sorted, split_dim)?;
        self.guard.delete_now(&sorted.name);

        let left = self.build_offline(left_run, depth + 1, out, nodes)?;
        let right = self.build_offline(right_run, depth + 1, out, nodes)?;

        Ok(self.push_inner(split_dim as u32, split_value, left, right, nodes))
    }

    /// Stream a dimension-sorted run into balanced left/right child runs.
    ///
    /// The split value is the split dimension's sub-key of the first record
    /// routed right.
    fn split_sorted_run(
        &mut self,
        sorted: &PointRun,
        split_dim: usize,
    ) -> Result<(PointRun, PointRun, Vec<u8>)> {
        let mid = sorted.count / 2;
        let mut input = self.storage.open_input(&sorted.name)?;

        let (left_name, mut left_out) = self.storage.create_temp_output(&self.temp_prefix)?;
        self.guard.register(left_name.clone());
        let (right_name, mut right_out) = self.storage.create_temp_output(&self.temp_prefix)?;
        self.guard.register(right_name.clone());

        let mut split_value = Vec::new();
        for i in 0..sorted.count {
            let point = read_record(&mut input, self.packed_len)?;
            if i < mid {
                write_record(&mut left_out, &point)?;
            } else {
                if i == mid {
                    split_value = point
                        .dim_bytes(split_dim, self.bytes_per_dim as usize)
                        .to_vec();
                }
                write_record(&mut right_out, &point)?;
            }
        }
        left_out.close()?;
        right_out.close()?;

        Ok((
            PointRun {
                name: left_name,
                count: mid,
            },
            PointRun {
                name: right_name,
                count: sorted.count - mid,
            },
            split_value,
        ))
    }

    /// Write one leaf block and append its node to the arena.
    fn write_leaf<W: Write>(
        &mut self,
        points: &mut [Point],
        out: &mut ChecksumOutput<W>,
        nodes: &mut Vec<TreeNode>,
    ) -> Result<u32> {
        debug_assert!(!points.is_empty());
        debug_assert!(points.len() <= self.config.max_points_in_leaf_node);

        // Reproducible leaf order: full packed value, then doc id.
        points.sort_unstable_by(|a, b| {
            a.packed
                .cmp(&b.packed)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });

        let fp = out.position();
        out.write_vu32(points.len() as u32)?;
        for point in points.iter() {
            out.write_u32(point.doc_id)?;
        }
        for point in points.iter() {
            out.write_raw(&point.packed)?;
        }

        let (min_packed, max_packed) = self.bounding_box(points);
        nodes.push(TreeNode::Leaf {
            fp,
            count: points.len() as u32,
            min_packed,
            max_packed,
        });
        Ok((nodes.len() - 1) as u32)
    }

    fn push_inner(
        &self,
        split_dim: u32,
        split_value: Vec<u8>,
        left: u32,
        right: u32,
        nodes: &mut Vec<TreeNode>,
    ) -> u32 {
        let (min_packed, max_packed) = union_boxes(
            nodes[left as usize].bounds(),
            nodes[right as usize].bounds(),
            self.num_dims as usize,
            self.bytes_per_dim as usize,
        );
        nodes.push(TreeNode::Inner {
            split_dim,
            split_value,
            left,
            right,
            min_packed,
            max_packed,
        });
        (nodes.len() - 1) as u32
    }

    /// Tightest per-dimension bounding box over a set of points.
    fn bounding_box(&self, points: &[Point]) -> (Vec<u8>, Vec<u8>) {
        let bytes_per_dim = self.bytes_per_dim as usize;
        let mut min = points[0].packed.clone();
        let mut max = points[0].packed.clone();

        for point in &points[1..] {
            for dim in 0..self.num_dims as usize {
                let start = dim * bytes_per_dim;
                let end = start + bytes_per_dim;
                let sub = &point.packed[start..end];
                if sub < &min[start..end] {
                    min[start..end].copy_from_slice(sub);
                }
                if sub > &max[start..end] {
                    max[start..end].copy_from_slice(sub);
                }
            }
        }
        (min, max)
    }

    /// Single-dimension fast-path merge.
    ///
    /// Performs one k-way merge across the sources' value-sorted leaf
    /// streams, remapping document ids and dropping deleted points, then
    /// builds the inner structure bottom-up over the emitted leaves. Only
    /// legal for 1-D trees; multi-dimension merges go through the generic
    /// rebuild instead.
    pub fn merge<W: Write>(
        &mut self,
        out: &mut ChecksumOutput<W>,
        sources: Vec<(crate::bkd::reader::LeafStream, DocIdMap)>,
    ) -> Result<Option<u64>> {
        if self.finished {
            return Err(YariError::invalid_operation("finish called twice"));
        }
        if self.point_count > 0 {
            return Err(YariError::invalid_operation(
                "cannot merge into a writer that already has points",
            ));
        }
        if self.num_dims != 1 {
            return Err(YariError::internal(
                "streaming merge is only defined for single-dimension trees",
            ));
        }
        self.finished = true;
        self.buffer = None;

        let mut streams: Vec<(crate::bkd::reader::LeafStream, DocIdMap)> = sources;
        let mut heap = BinaryHeap::with_capacity(streams.len());
        for (ordinal, (stream, _)) in streams.iter_mut().enumerate() {
            if let Some((value, doc_id)) = stream.next()? {
                heap.push(MergeHead {
                    value,
                    doc_id,
                    source: ordinal,
                });
            }
        }

        let mut nodes: Vec<TreeNode> = Vec::new();
        let mut leaf_nodes: Vec<u32> = Vec::new();
        let mut leaf_points: Vec<Point> = Vec::new();
        let mut total = 0u64;

        while let Some(head) = heap.pop() {
            let (stream, doc_map) = &mut streams[head.source];
            if let Some(new_doc) = doc_map.remap(head.doc_id) {
                leaf_points.push(Point::new(head.value, new_doc));
                total += 1;
                if leaf_points.len() == self.config.max_points_in_leaf_node {
                    let leaf = self.write_merged_leaf(&mut leaf_points, out, &mut nodes)?;
                    leaf_nodes.push(leaf);
                }
            }

            if let Some((value, doc_id)) = stream.next()? {
                heap.push(MergeHead {
                    value,
                    doc_id,
                    source: head.source,
                });
            }
        }

        if !leaf_points.is_empty() {
            let leaf = self.write_merged_leaf(&mut leaf_points, out, &mut nodes)?;
            leaf_nodes.push(leaf);
        }

        if total == 0 {
            return Ok(None);
        }
        self.point_count = total;

        let root = self.build_over_leaves(&leaf_nodes, &mut nodes);
        let index = BkdTreeIndex {
            num_dims: self.num_dims,
            bytes_per_dim: self.bytes_per_dim,
            max_points_in_leaf_node: self.config.max_points_in_leaf_node as u32,
            point_count: total,
            nodes,
            root,
        };

        let offset = out.position();
        index.write_to(out)?;
        Ok(Some(offset))
    }

    /// Write one merged leaf block. The points arrive value-sorted from the
    /// k-way merge; no re-sort happens here.
    fn write_merged_leaf<W: Write>(
        &self,
        points: &mut Vec<Point>,
        out: &mut ChecksumOutput<W>,
        nodes: &mut Vec<TreeNode>,
    ) -> Result<u32> {
        let fp = out.position();
        out.write_vu32(points.len() as u32)?;
        for point in points.iter() {
            out.write_u32(point.doc_id)?;
        }
        for point in points.iter() {
            out.write_raw(&point.packed)?;
        }

        debug_assert!(!points.is_empty());
        let min_packed = points[0].packed.clone();
        let max_packed = points[points.len() - 1].packed.clone();
        nodes.push(TreeNode::Leaf {
            fp,
            count: points.len() as u32,
            min_packed,
            max_packed,
        });
        points.clear();
        Ok((nodes.len() - 1) as u32)
    }

    /// Build a balanced inner structure over a sequence of sorted leaves.
    fn build_over_leaves(&self, leaf_nodes: &[u32], nodes: &mut Vec<TreeNode>) -> u32 {
        if leaf_nodes.len() == 1 {
            return leaf_nodes[0];
        }

        let mid = leaf_nodes.len() / 2;
        let left = self.build_over_leaves(&leaf_nodes[..mid], nodes);
        let right = self.build_over_leaves(&leaf_nodes[mid..], nodes);

        // The right subtree's smallest key separates the halves.
        let split_value = nodes[leaf_nodes[mid] as usize].bounds().0[..self.bytes_per_dim as usize].to_vec();
        self.push_inner(0, split_value, left, right, nodes)
    }
}

impl TreeNode {
    /// (min, max) bounding box of this node.
    pub(crate) fn bounds(&self) -> (&[u8], &[u8]) {
        match self {
            TreeNode::Leaf {
                min_packed,
                max_packed,
                ..
            }
            | TreeNode::Inner {
                min_packed,
                max_packed,
                ..
            } => (min_packed, max_packed),
        }
    }
}

/// Union of two per-dimension bounding boxes.
fn union_boxes(
    a: (&[u8], &[u8]),
    b: (&[u8], &[u8]),
    num_dims: usize,
    bytes_per_dim: usize,
) -> (Vec<u8>, Vec<u8>) {
    let mut min = a.0.to_vec();
    let mut max = a.1.to_vec();
    for dim in 0..num_dims {
        let start = dim * bytes_per_dim;
        let end = start + bytes_per_dim;
        if &b.0[start..end] < &min[start..end] {
            min[start..end].copy_from_slice(&b.0[start..end]);
        }
        if &b.1[start..end] > &max[start..end] {
            max[start..end].copy_from_slice(&b.1[start..end]);
        }
    }
    (min, max)
}

/// Head of one source stream in the k-way merge.
struct MergeHead {
    value: Vec<u8>,
    doc_id: u32,
    source: usize,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the globally-smallest value first;
        // source ordinal keeps the order deterministic across equal values.
        self.value
            .cmp(&other.value)
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.doc_id.cmp(&other.doc_id))
            .reverse()
    }
}
