//! Reading a segment's point index.
//!
//! Opening a segment verifies both files' checksum footers and headers before
//! any content is trusted, then loads every field's tree structure into
//! memory. Leaf point blocks stay on disk and are fetched during traversal.

use ahash::AHashMap;

use crate::bkd::{BkdTreeIndex, IntersectVisitor, LeafStream, PointValues};
use crate::codec;
use crate::error::{Result, YariError};
use crate::field::{FieldInfo, FieldInfos};
use crate::points::SegmentReadState;
use crate::points::format::{
    DATA_CODEC_NAME, DATA_EXTENSION, INDEX_CODEC_NAME, INDEX_EXTENSION, VERSION_CURRENT,
    VERSION_START, segment_file_name,
};
use crate::storage::StorageInput;
use crate::util::varint;

/// A read-only view over one segment's point index.
///
/// The reader is immutable after open. Each traversal clones its own input
/// handle, so any number of queries may run concurrently against one reader.
#[derive(Debug)]
pub struct PointsReader {
    field_infos: FieldInfos,
    data_input: Box<dyn StorageInput>,
    trees: AHashMap<u32, BkdTreeIndex>,
}

impl PointsReader {
    /// Open a segment's point index, verifying checksums and headers.
    pub fn open(state: &SegmentReadState) -> Result<Self> {
        let index_name =
            segment_file_name(&state.segment_name, &state.segment_suffix, INDEX_EXTENSION);
        let data_name =
            segment_file_name(&state.segment_name, &state.segment_suffix, DATA_EXTENSION);

        codec::verify_file_checksum(state.storage.as_ref(), &index_name)?;
        codec::verify_file_checksum(state.storage.as_ref(), &data_name)?;

        // Field directory from the index file.
        let mut index_input = state.storage.open_input(&index_name)?;
        codec::check_header(
            &mut index_input,
            INDEX_CODEC_NAME,
            VERSION_START,
            VERSION_CURRENT,
            &state.segment_id,
            &state.segment_suffix,
        )?;
        let field_count = varint::read_u32(&mut index_input)?;
        let mut offsets = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let number = varint::read_u32(&mut index_input)?;
            let offset = varint::read_u64(&mut index_input)?;
            let field = state.field_infos.field_by_number(number).ok_or_else(|| {
                YariError::corruption(format!(
                    "index file references unknown field number {number}"
                ))
            })?;
            if !field.has_points() {
                return Err(YariError::corruption(format!(
                    "index file references field \"{}\" which holds no points",
                    field.name
                )));
            }
            offsets.push((number, offset));
        }

        // Tree structures from the data file.
        let mut data_input = state.storage.open_input(&data_name)?;
        codec::check_header(
            &mut data_input,
            DATA_CODEC_NAME,
            VERSION_START,
            VERSION_CURRENT,
            &state.segment_id,
            &state.segment_suffix,
        )?;

        let mut trees = AHashMap::with_capacity(offsets.len());
        for (number, offset) in offsets {
            let tree = BkdTreeIndex::read_from(&mut data_input, offset)?;
            let field = state
                .field_infos
                .field_by_number(number)
                .ok_or_else(|| YariError::internal("field vanished during open"))?;
            if tree.num_dims() != field.dimension_count
                || tree.bytes_per_dim() != field.dimension_num_bytes
            {
                return Err(YariError::corruption(format!(
                    "tree shape {}x{} does not match field \"{}\" ({}x{})",
                    tree.num_dims(),
                    tree.bytes_per_dim(),
                    field.name,
                    field.dimension_count,
                    field.dimension_num_bytes
                )));
            }
            if trees.insert(number, tree).is_some() {
                return Err(YariError::corruption(format!(
                    "duplicate field number {number} in index file"
                )));
            }
        }

        Ok(PointsReader {
            field_infos: state.field_infos.clone(),
            data_input,
            trees,
        })
    }

    /// The point values of one field, or `None` when the field has no points
    /// in this segment.
    pub fn values(&self, field_name: &str) -> Result<Option<BkdPointValues<'_>>> {
        let Some(field) = self.field_infos.field_by_name(field_name) else {
            return Ok(None);
        };
        Ok(self.trees.get(&field.number).map(|tree| BkdPointValues {
            tree,
            input: self.data_input.as_ref(),
        }))
    }

    /// This segment's field registry.
    pub fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    /// The tree of one field by this reader's local registry, shape-checked
    /// against the merge target's field metadata.
    pub(crate) fn tree_for_merge(&self, target: &FieldInfo) -> Result<Option<&BkdTreeIndex>> {
        let Some(local) = self.field_infos.field_by_name(&target.name) else {
            return Ok(None);
        };
        let Some(tree) = self.trees.get(&local.number) else {
            return Ok(None);
        };
        if tree.num_dims() != target.dimension_count
            || tree.bytes_per_dim() != target.dimension_num_bytes
        {
            return Err(YariError::index(format!(
                "field \"{}\" has {}x{} byte dimensions in this segment, \
                 but the merge target expects {}x{}",
                target.name,
                tree.num_dims(),
                tree.bytes_per_dim(),
                target.dimension_count,
                target.dimension_num_bytes
            )));
        }
        Ok(Some(tree))
    }

    /// A leaf-order cursor over one field's points, for the merge fast path.
    pub(crate) fn leaf_stream_for_merge(&self, target: &FieldInfo) -> Result<Option<LeafStream>> {
        match self.tree_for_merge(target)? {
            None => Ok(None),
            Some(tree) => {
                let input = self.data_input.clone_input()?;
                Ok(Some(tree.leaf_stream(input)))
            }
        }
    }
}

impl crate::points::merge::PointsProvider for PointsReader {
    fn point_values(&self, field_name: &str) -> Result<Option<Box<dyn PointValues + '_>>> {
        let values = self.values(field_name)?;
        Ok(values.map(|v| Box::new(v) as Box<dyn PointValues + '_>))
    }
}

/// One field's point values inside an open segment.
#[derive(Debug)]
pub struct BkdPointValues<'a> {
    tree: &'a BkdTreeIndex,
    input: &'a dyn StorageInput,
}

impl PointValues for BkdPointValues<'_> {
    fn num_dims(&self) -> u32 {
        self.tree.num_dims()
    }

    fn bytes_per_dim(&self) -> u32 {
        self.tree.bytes_per_dim()
    }

    fn size(&self) -> u64 {
        self.tree.point_count()
    }

    fn min_packed_value(&self) -> &[u8] {
        self.tree.min_packed_value()
    }

    fn max_packed_value(&self) -> &[u8] {
        self.tree.max_packed_value()
    }

    fn intersect(&self, visitor: &mut dyn IntersectVisitor) -> Result<()> {
        // Each traversal owns an input handle with its own position.
        let mut input = self.input.clone_input()?;
        self.tree.intersect(input.as_mut(), visitor)
    }
}
