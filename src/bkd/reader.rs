//! BKD tree structure parsing and query traversal.
//!
//! The tree is represented as a flat arena of nodes addressed by integer
//! index, with child references as indices into that arena. The arena is
//! serialized as one contiguous block at the tree's root offset in the data
//! file; leaf point blocks precede it in depth-first order.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::bkd::{IntersectVisitor, Relation};
use crate::codec::ChecksumOutput;
use crate::error::{Result, YariError};
use crate::storage::StorageInput;
use crate::util::varint;

/// One node of the flat tree arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TreeNode {
    /// Terminal node referencing a leaf point block in the data file.
    Leaf {
        /// File offset of the leaf block.
        fp: u64,
        /// Number of points in the block.
        count: u32,
        min_packed: Vec<u8>,
        max_packed: Vec<u8>,
    },
    /// Internal split record.
    Inner {
        split_dim: u32,
        /// The split dimension's sub-key routing queries to the children.
        split_value: Vec<u8>,
        left: u32,
        right: u32,
        min_packed: Vec<u8>,
        max_packed: Vec<u8>,
    },
}

impl TreeNode {
    fn min_packed(&self) -> &[u8] {
        match self {
            TreeNode::Leaf { min_packed, .. } | TreeNode::Inner { min_packed, .. } => min_packed,
        }
    }

    fn max_packed(&self) -> &[u8] {
        match self {
            TreeNode::Leaf { max_packed, .. } | TreeNode::Inner { max_packed, .. } => max_packed,
        }
    }
}

const NODE_TAG_LEAF: u8 = 0;
const NODE_TAG_INNER: u8 = 1;

/// The in-memory structure of one field's BKD tree.
///
/// Immutable once read; traversal is read-only and safe for arbitrary
/// concurrent readers, each over its own input handle.
#[derive(Debug, Clone)]
pub struct BkdTreeIndex {
    pub(crate) num_dims: u32,
    pub(crate) bytes_per_dim: u32,
    pub(crate) max_points_in_leaf_node: u32,
    pub(crate) point_count: u64,
    pub(crate) nodes: Vec<TreeNode>,
    pub(crate) root: u32,
}

/// Statistics about one built tree.
#[derive(Debug, Clone)]
pub struct BkdStats {
    /// Total number of indexed points.
    pub point_count: u64,
    /// Number of leaf blocks.
    pub leaf_count: usize,
    /// Number of inner nodes.
    pub inner_count: usize,
    /// Minimum packed value across all points.
    pub min_packed: Vec<u8>,
    /// Maximum packed value across all points.
    pub max_packed: Vec<u8>,
}

impl BkdTreeIndex {
    /// Packed value length in bytes.
    pub fn packed_len(&self) -> usize {
        (self.num_dims * self.bytes_per_dim) as usize
    }

    /// Number of indexed dimensions.
    pub fn num_dims(&self) -> u32 {
        self.num_dims
    }

    /// Byte width of each dimension sub-key.
    pub fn bytes_per_dim(&self) -> u32 {
        self.bytes_per_dim
    }

    /// Total number of indexed points.
    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    /// Minimum packed value across all points.
    pub fn min_packed_value(&self) -> &[u8] {
        self.nodes[self.root as usize].min_packed()
    }

    /// Maximum packed value across all points.
    pub fn max_packed_value(&self) -> &[u8] {
        self.nodes[self.root as usize].max_packed()
    }

    /// Gather statistics about the tree.
    pub fn stats(&self) -> BkdStats {
        let leaf_count = self
            .nodes
            .iter()
            .filter(|n| matches!(n, TreeNode::Leaf { .. }))
            .count();
        BkdStats {
            point_count: self.point_count,
            leaf_count,
            inner_count: self.nodes.len() - leaf_count,
            min_packed: self.min_packed_value().to_vec(),
            max_packed: self.max_packed_value().to_vec(),
        }
    }

    /// Serialize the tree structure block.
    pub(crate) fn write_to<W: Write>(&self, out: &mut ChecksumOutput<W>) -> Result<()> {
        out.write_vu32(self.num_dims)?;
        out.write_vu32(self.bytes_per_dim)?;
        out.write_vu32(self.max_points_in_leaf_node)?;
        out.write_vu64(self.point_count)?;
        out.write_vu32(self.nodes.len() as u32)?;
        out.write_vu32(self.root)?;

        for node in &self.nodes {
            match node {
                TreeNode::Leaf {
                    fp,
                    count,
                    min_packed,
                    max_packed,
                } => {
                    out.write_u8(NODE_TAG_LEAF)?;
                    out.write_vu64(*fp)?;
                    out.write_vu32(*count)?;
                    out.write_raw(min_packed)?;
                    out.write_raw(max_packed)?;
                }
                TreeNode::Inner {
                    split_dim,
                    split_value,
                    left,
                    right,
                    min_packed,
                    max_packed,
                } => {
                    out.write_u8(NODE_TAG_INNER)?;
                    out.write_vu32(*split_dim)?;
                    out.write_raw(split_value)?;
                    out.write_vu32(*left)?;
                    out.write_vu32(*right)?;
                    out.write_raw(min_packed)?;
                    out.write_raw(max_packed)?;
                }
            }
        }
        Ok(())
    }

    /// Parse a tree structure block at the given data-file offset.
    pub fn read_from(input: &mut dyn StorageInput, offset: u64) -> Result<Self> {
        input.seek(SeekFrom::Start(offset))?;

        let num_dims = varint::read_u32(input)?;
        let bytes_per_dim = varint::read_u32(input)?;
        if num_dims == 0 || bytes_per_dim == 0 {
            return Err(YariError::corruption(format!(
                "invalid tree dimensions: {num_dims} x {bytes_per_dim} bytes"
            )));
        }
        let max_points_in_leaf_node = varint::read_u32(input)?;
        let point_count = varint::read_u64(input)?;
        let node_count = varint::read_u32(input)?;
        let root = varint::read_u32(input)?;
        if node_count == 0 || root >= node_count {
            return Err(YariError::corruption(format!(
                "invalid tree shape: {node_count} nodes, root {root}"
            )));
        }

        let packed_len = (num_dims * bytes_per_dim) as usize;
        let mut nodes = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            let tag = input.read_u8()?;
            let node = match tag {
                NODE_TAG_LEAF => {
                    let fp = varint::read_u64(input)?;
                    let count = varint::read_u32(input)?;
                    let mut min_packed = vec![0u8; packed_len];
                    input.read_exact(&mut min_packed)?;
                    let mut max_packed = vec![0u8; packed_len];
                    input.read_exact(&mut max_packed)?;
                    if count == 0 || count > max_points_in_leaf_node {
                        return Err(YariError::corruption(format!(
                            "leaf block count {count} out of range (max {max_points_in_leaf_node})"
                        )));
                    }
                    TreeNode::Leaf {
                        fp,
                        count,
                        min_packed,
                        max_packed,
                    }
                }
                NODE_TAG_INNER => {
                    let split_dim = varint::read_u32(input)?;
                    if split_dim >= num_dims {
                        return Err(YariError::corruption(format!(
                            "split dimension {split_dim} out of range ({num_dims} dims)"
                        )));
                    }
                    let mut split_value = vec![0u8; bytes_per_dim as usize];
                    input.read_exact(&mut split_value)?;
                    let left = varint::read_u32(input)?;
                    let right = varint::read_u32(input)?;
                    if left >= node_count || right >= node_count {
                        return Err(YariError::corruption(format!(
                            "child reference out of range: {left}/{right} of {node_count}"
                        )));
                    }
                    let mut min_packed = vec![0u8; packed_len];
                    input.read_exact(&mut min_packed)?;
                    let mut max_packed = vec![0u8; packed_len];
                    input.read_exact(&mut max_packed)?;
                    TreeNode::Inner {
                        split_dim,
                        split_value,
                        left,
                        right,
                        min_packed,
                        max_packed,
                    }
                }
                other => {
                    return Err(YariError::corruption(format!(
                        "unknown tree node tag {other}"
                    )));
                }
            };
            nodes.push(node);
        }

        Ok(BkdTreeIndex {
            num_dims,
            bytes_per_dim,
            max_points_in_leaf_node,
            point_count,
            nodes,
            root,
        })
    }

    /// Traverse the tree depth-first, pruning by bounding box.
    pub fn intersect(
        &self,
        input: &mut dyn StorageInput,
        visitor: &mut dyn IntersectVisitor,
    ) -> Result<()> {
        self.intersect_node(self.root, input, visitor)
    }

    fn intersect_node(
        &self,
        index: u32,
        input: &mut dyn StorageInput,
        visitor: &mut dyn IntersectVisitor,
    ) -> Result<()> {
        let node = &self.nodes[index as usize];
        match visitor.compare(node.min_packed(), node.max_packed()) {
            Relation::CellOutsideQuery => Ok(()),
            Relation::CellInsideQuery => self.visit_ids(index, input, visitor),
            Relation::CellCrossesQuery => match node {
                TreeNode::Leaf { fp, count, .. } => {
                    self.visit_leaf_with_values(*fp, *count, input, visitor)
                }
                TreeNode::Inner { left, right, .. } => {
                    self.intersect_node(*left, input, visitor)?;
                    self.intersect_node(*right, input, visitor)
                }
            },
        }
    }

    /// Visit every document beneath a node through the identifier-only
    /// callback. Leaf blocks store doc ids before packed values, so this
    /// path never reads value bytes.
    fn visit_ids(
        &self,
        index: u32,
        input: &mut dyn StorageInput,
        visitor: &mut dyn IntersectVisitor,
    ) -> Result<()> {
        match &self.nodes[index as usize] {
            TreeNode::Leaf { fp, count, .. } => {
                let doc_ids = self.read_leaf_doc_ids(input, *fp, *count)?;
                for doc_id in doc_ids {
                    visitor.visit(doc_id)?;
                }
                Ok(())
            }
            TreeNode::Inner { left, right, .. } => {
                self.visit_ids(*left, input, visitor)?;
                self.visit_ids(*right, input, visitor)
            }
        }
    }

    fn visit_leaf_with_values(
        &self,
        fp: u64,
        count: u32,
        input: &mut dyn StorageInput,
        visitor: &mut dyn IntersectVisitor,
    ) -> Result<()> {
        let (doc_ids, values) = self.read_leaf_block(input, fp, count)?;
        let packed_len = self.packed_len();
        for (i, doc_id) in doc_ids.into_iter().enumerate() {
            let value = &values[i * packed_len..(i + 1) * packed_len];
            visitor.visit_with_value(doc_id, value)?;
        }
        Ok(())
    }

    fn read_leaf_doc_ids(
        &self,
        input: &mut dyn StorageInput,
        fp: u64,
        count: u32,
    ) -> Result<Vec<u32>> {
        input.seek(SeekFrom::Start(fp))?;
        let stored = varint::read_u32(input)?;
        if stored != count {
            return Err(YariError::corruption(format!(
                "leaf block count mismatch: index says {count}, block says {stored}"
            )));
        }
        let mut doc_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            doc_ids.push(input.read_u32::<LittleEndian>()?);
        }
        Ok(doc_ids)
    }

    fn read_leaf_block(
        &self,
        input: &mut dyn StorageInput,
        fp: u64,
        count: u32,
    ) -> Result<(Vec<u32>, Vec<u8>)> {
        let doc_ids = self.read_leaf_doc_ids(input, fp, count)?;
        let mut values = vec![0u8; count as usize * self.packed_len()];
        input.read_exact(&mut values)?;
        Ok((doc_ids, values))
    }

    /// Leaf block references in depth-first (in-order) traversal order.
    pub(crate) fn leaves_in_order(&self) -> Vec<(u64, u32)> {
        let mut leaves = Vec::new();
        self.collect_leaves(self.root, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, index: u32, leaves: &mut Vec<(u64, u32)>) {
        match &self.nodes[index as usize] {
            TreeNode::Leaf { fp, count, .. } => leaves.push((*fp, *count)),
            TreeNode::Inner { left, right, .. } => {
                self.collect_leaves(*left, leaves);
                self.collect_leaves(*right, leaves);
            }
        }
    }

    /// Open a cursor over the tree's points in leaf order.
    ///
    /// For a single-dimension tree the stream is globally value-sorted,
    /// which the merge fast path relies on.
    pub fn leaf_stream(&self, input: Box<dyn StorageInput>) -> LeafStream {
        LeafStream {
            leaves: self.leaves_in_order(),
            next_leaf: 0,
            packed_len: self.packed_len(),
            doc_ids: Vec::new(),
            values: Vec::new(),
            position: 0,
            input,
        }
    }
}

/// A sequential cursor over a tree's points in leaf order.
#[derive(Debug)]
pub struct LeafStream {
    leaves: Vec<(u64, u32)>,
    next_leaf: usize,
    packed_len: usize,
    doc_ids: Vec<u32>,
    values: Vec<u8>,
    position: usize,
    input: Box<dyn StorageInput>,
}

impl LeafStream {
    /// Advance to the next point, returning its packed value and doc id.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, u32)>> {
        while self.position >= self.doc_ids.len() {
            if self.next_leaf >= self.leaves.len() {
                return Ok(None);
            }
            let (fp, count) = self.leaves[self.next_leaf];
            self.next_leaf += 1;
            self.load_leaf(fp, count)?;
        }

        let i = self.position;
        self.position += 1;
        let value = self.values[i * self.packed_len..(i + 1) * self.packed_len].to_vec();
        Ok(Some((value, self.doc_ids[i])))
    }

    fn load_leaf(&mut self, fp: u64, count: u32) -> Result<()> {
        self.input.seek(SeekFrom::Start(fp))?;
        let stored = varint::read_u32(&mut self.input)?;
        if stored != count {
            return Err(YariError::corruption(format!(
                "leaf block count mismatch: index says {count}, block says {stored}"
            )));
        }
        self.doc_ids.clear();
        for _ in 0..count {
            self.doc_ids.push(self.input.read_u32::<LittleEndian>()?);
        }
        self.values.resize(count as usize * self.packed_len, 0);
        self.input.read_exact(&mut self.values)?;
        self.position = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage, StorageOutput};

    fn sample_index() -> BkdTreeIndex {
        BkdTreeIndex {
            num_dims: 2,
            bytes_per_dim: 2,
            max_points_in_leaf_node: 4,
            point_count: 6,
            nodes: vec![
                TreeNode::Leaf {
                    fp: 100,
                    count: 3,
                    min_packed: vec![0, 0, 0, 0],
                    max_packed: vec![0, 5, 0, 9],
                },
                TreeNode::Leaf {
                    fp: 200,
                    count: 3,
                    min_packed: vec![0, 6, 0, 1],
                    max_packed: vec![0, 9, 0, 9],
                },
                TreeNode::Inner {
                    split_dim: 0,
                    split_value: vec![0, 6],
                    left: 0,
                    right: 1,
                    min_packed: vec![0, 0, 0, 0],
                    max_packed: vec![0, 9, 0, 9],
                },
            ],
            root: 2,
        }
    }

    fn write_index(storage: &MemoryStorage, name: &str, index: &BkdTreeIndex) -> u64 {
        let mut output = storage.create_output(name).unwrap();
        let mut out = ChecksumOutput::new(&mut output);
        out.write_raw(b"padding").unwrap(); // structures never start at offset 0
        let offset = out.position();
        index.write_to(&mut out).unwrap();
        out.finish().unwrap();
        output.close().unwrap();
        offset
    }

    #[test]
    fn test_structure_round_trip() {
        let storage = MemoryStorage::new_default();
        let index = sample_index();
        let offset = write_index(&storage, "tree.bin", &index);

        let mut input = storage.open_input("tree.bin").unwrap();
        let parsed = BkdTreeIndex::read_from(&mut input, offset).unwrap();

        assert_eq!(parsed.num_dims, 2);
        assert_eq!(parsed.bytes_per_dim, 2);
        assert_eq!(parsed.max_points_in_leaf_node, 4);
        assert_eq!(parsed.point_count, 6);
        assert_eq!(parsed.root, 2);
        assert_eq!(parsed.nodes, index.nodes);
        assert_eq!(parsed.min_packed_value(), &[0, 0, 0, 0]);
        assert_eq!(parsed.max_packed_value(), &[0, 9, 0, 9]);
    }

    #[test]
    fn test_leaves_in_order() {
        let index = sample_index();
        assert_eq!(index.leaves_in_order(), vec![(100, 3), (200, 3)]);
    }

    #[test]
    fn test_stats() {
        let index = sample_index();
        let stats = index.stats();
        assert_eq!(stats.point_count, 6);
        assert_eq!(stats.leaf_count, 2);
        assert_eq!(stats.inner_count, 1);
        assert_eq!(stats.min_packed, vec![0, 0, 0, 0]);
        assert_eq!(stats.max_packed, vec![0, 9, 0, 9]);
    }

    #[test]
    fn test_invalid_root_rejected() {
        let storage = MemoryStorage::new_default();
        let mut index = sample_index();
        index.root = 9;
        let offset = write_index(&storage, "tree.bin", &index);

        let mut input = storage.open_input("tree.bin").unwrap();
        let err = BkdTreeIndex::read_from(&mut input, offset).unwrap_err();
        assert!(matches!(err, YariError::Corruption(_)));
    }

    #[test]
    fn test_dangling_child_rejected() {
        let storage = MemoryStorage::new_default();
        let mut index = sample_index();
        index.nodes[2] = TreeNode::Inner {
            split_dim: 0,
            split_value: vec![0, 6],
            left: 0,
            right: 7,
            min_packed: vec![0, 0, 0, 0],
            max_packed: vec![0, 9, 0, 9],
        };
        let offset = write_index(&storage, "tree.bin", &index);

        let mut input = storage.open_input("tree.bin").unwrap();
        let err = BkdTreeIndex::read_from(&mut input, offset).unwrap_err();
        assert!(matches!(err, YariError::Corruption(_)));
    }

    #[test]
    fn test_split_dim_out_of_range_rejected() {
        let storage = MemoryStorage::new_default();
        let mut index = sample_index();
        index.nodes[2] = TreeNode::Inner {
            split_dim: 5,
            split_value: vec![0, 6],
            left: 0,
            right: 1,
            min_packed: vec![0, 0, 0, 0],
            max_packed: vec![0, 9, 0, 9],
        };
        let offset = write_index(&storage, "tree.bin", &index);

        let mut input = storage.open_input("tree.bin").unwrap();
        let err = BkdTreeIndex::read_from(&mut input, offset).unwrap_err();
        assert!(matches!(err, YariError::Corruption(_)));
    }
}
