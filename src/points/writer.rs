//! Writing a segment's point index.
//!
//! The writer owns the data file for the lifetime of the segment write: each
//! [`write_field`](PointsWriter::write_field) call appends one field's leaf
//! blocks and tree structure, and [`close`](PointsWriter::close) seals the
//! data file and writes the field directory to the index file. Close is
//! idempotent; a failed close deletes both partial files.

use std::sync::Arc;

use crate::bkd::{BkdWriter, IntersectVisitor, PointValues, Relation};
use crate::codec::{ChecksumOutput, write_header};
use crate::error::{Result, YariError};
use crate::field::FieldInfo;
use crate::points::SegmentWriteState;
use crate::points::format::{
    DATA_CODEC_NAME, DATA_EXTENSION, INDEX_CODEC_NAME, INDEX_EXTENSION, VERSION_CURRENT,
    segment_file_name,
};
use crate::points::merge::{DocIdMap, MergeSource, MergeState};
use crate::storage::StorageOutput;

/// Writes one segment's point index.
pub struct PointsWriter {
    state: SegmentWriteState,
    data_name: String,
    index_name: String,
    out: Option<ChecksumOutput<Box<dyn StorageOutput>>>,
    field_offsets: Vec<(u32, u64)>,
    closed: bool,
}

impl PointsWriter {
    /// Create the data file and write its header.
    pub fn new(state: SegmentWriteState) -> Result<Self> {
        let data_name =
            segment_file_name(&state.segment_name, &state.segment_suffix, DATA_EXTENSION);
        let index_name =
            segment_file_name(&state.segment_name, &state.segment_suffix, INDEX_EXTENSION);

        let output = state.storage.create_output(&data_name)?;
        let mut out = ChecksumOutput::new(output);
        if let Err(err) = write_header(
            &mut out,
            DATA_CODEC_NAME,
            VERSION_CURRENT,
            &state.segment_id,
            &state.segment_suffix,
        ) {
            let _ = state.storage.delete_file(&data_name);
            return Err(err);
        }

        Ok(PointsWriter {
            state,
            data_name,
            index_name,
            out: Some(out),
            field_offsets: Vec::new(),
            closed: false,
        })
    }

    /// Build and append one field's tree from its point values.
    pub fn write_field(&mut self, field: &FieldInfo, values: &dyn PointValues) -> Result<()> {
        self.check_open()?;
        self.check_field(field)?;
        if values.num_dims() != field.dimension_count
            || values.bytes_per_dim() != field.dimension_num_bytes
        {
            return Err(YariError::index(format!(
                "point values shape {}x{} does not match field \"{}\" ({}x{})",
                values.num_dims(),
                values.bytes_per_dim(),
                field.name,
                field.dimension_count,
                field.dimension_num_bytes
            )));
        }

        let mut bkd = self.field_bkd_writer(field)?;
        let mut visitor = AddPointsVisitor { writer: &mut bkd };
        values.intersect(&mut visitor)?;

        let out = self.data_out()?;
        if let Some(offset) = bkd.finish(out)? {
            self.field_offsets.push((field.number, offset));
        }
        Ok(())
    }

    /// Merge the point indexes of several source segments into this one.
    ///
    /// When every source is native, single-dimension fields stream through a
    /// k-way merge of their already-sorted trees; everything else rebuilds
    /// through the normal add path. The source kind is inspected once per
    /// merge.
    pub fn merge(&mut self, merge_state: &MergeState) -> Result<()> {
        self.check_open()?;

        let all_native = merge_state
            .sources
            .iter()
            .all(|source| matches!(source, MergeSource::Native(_)));

        for field in merge_state.field_infos.iter().filter(|f| f.has_points()) {
            if all_native && field.dimension_count == 1 {
                self.merge_one_dim(field, merge_state)?;
            } else {
                self.merge_generic(field, merge_state)?;
            }
        }
        Ok(())
    }

    /// Streaming merge of single-dimension trees.
    fn merge_one_dim(&mut self, field: &FieldInfo, merge_state: &MergeState) -> Result<()> {
        self.check_field(field)?;

        let mut streams = Vec::new();
        for (source, doc_map) in merge_state.sources.iter().zip(&merge_state.doc_maps) {
            let MergeSource::Native(reader) = source else {
                return Err(YariError::internal(
                    "streaming merge reached with a non-native source",
                ));
            };
            if let Some(stream) = reader.leaf_stream_for_merge(field)? {
                streams.push((stream, doc_map.clone()));
            }
        }

        let mut bkd = self.field_bkd_writer(field)?;
        let out = self.data_out()?;
        if let Some(offset) = bkd.merge(out, streams)? {
            self.field_offsets.push((field.number, offset));
        }
        Ok(())
    }

    /// Rebuild merge: re-add every live point from every source.
    fn merge_generic(&mut self, field: &FieldInfo, merge_state: &MergeState) -> Result<()> {
        self.check_field(field)?;

        let mut bkd = self.field_bkd_writer(field)?;
        for (source, doc_map) in merge_state.sources.iter().zip(&merge_state.doc_maps) {
            let Some(values) = source.point_values(&field.name)? else {
                continue;
            };
            if values.num_dims() != field.dimension_count
                || values.bytes_per_dim() != field.dimension_num_bytes
            {
                return Err(YariError::index(format!(
                    "merge source shape {}x{} does not match field \"{}\" ({}x{})",
                    values.num_dims(),
                    values.bytes_per_dim(),
                    field.name,
                    field.dimension_count,
                    field.dimension_num_bytes
                )));
            }
            let mut visitor = RemapVisitor {
                writer: &mut bkd,
                doc_map,
            };
            values.intersect(&mut visitor)?;
        }

        let out = self.data_out()?;
        if let Some(offset) = bkd.finish(out)? {
            self.field_offsets.push((field.number, offset));
        }
        Ok(())
    }

    /// Seal the data file and write the index file. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.close_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                // Partial outputs must not survive a failed close.
                let _ = self.state.storage.delete_file(&self.data_name);
                let _ = self.state.storage.delete_file(&self.index_name);
                Err(err)
            }
        }
    }

    fn close_inner(&mut self) -> Result<()> {
        let out = self
            .out
            .take()
            .ok_or_else(|| YariError::internal("data output missing at close"))?;
        let mut data_file = out.finish()?;
        data_file.close()?;

        // Every written field must exist in the registry with points.
        for &(number, _) in &self.field_offsets {
            let known = self
                .state
                .field_infos
                .field_by_number(number)
                .is_some_and(|f| f.has_points());
            if !known {
                return Err(YariError::internal(format!(
                    "wrote points for field number {number}, \
                     which the field registry does not know as a point field"
                )));
            }
        }

        let output = self.state.storage.create_output(&self.index_name)?;
        let mut out = ChecksumOutput::new(output);
        write_header(
            &mut out,
            INDEX_CODEC_NAME,
            VERSION_CURRENT,
            &self.state.segment_id,
            &self.state.segment_suffix,
        )?;
        out.write_vu32(self.field_offsets.len() as u32)?;
        for &(number, offset) in &self.field_offsets {
            out.write_vu32(number)?;
            out.write_vu64(offset)?;
        }
        let mut index_file = out.finish()?;
        index_file.close()?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(YariError::invalid_operation(
                "points writer is already closed",
            ));
        }
        Ok(())
    }

    fn check_field(&self, field: &FieldInfo) -> Result<()> {
        if !field.has_points() {
            return Err(YariError::index(format!(
                "field \"{}\" holds no points",
                field.name
            )));
        }
        if self.field_offsets.iter().any(|&(n, _)| n == field.number) {
            return Err(YariError::invalid_operation(format!(
                "field \"{}\" was already written to this segment",
                field.name
            )));
        }
        Ok(())
    }

    fn field_bkd_writer(&self, field: &FieldInfo) -> Result<BkdWriter> {
        BkdWriter::new(
            Arc::clone(&self.state.storage),
            format!("{}_{}", self.state.segment_name, field.number),
            field.dimension_count,
            field.dimension_num_bytes,
            self.state.bkd_config.clone(),
        )
    }

    fn data_out(&mut self) -> Result<&mut ChecksumOutput<Box<dyn StorageOutput>>> {
        self.out
            .as_mut()
            .ok_or_else(|| YariError::internal("data output missing"))
    }
}

impl std::fmt::Debug for PointsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointsWriter")
            .field("data_name", &self.data_name)
            .field("index_name", &self.index_name)
            .field("fields_written", &self.field_offsets.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Feeds a source's points into a tree build. The build needs every packed
/// value, so the identifier-only callback is an invariant violation here.
struct AddPointsVisitor<'a> {
    writer: &'a mut BkdWriter,
}

impl IntersectVisitor for AddPointsVisitor<'_> {
    fn visit(&mut self, _doc_id: u32) -> Result<()> {
        Err(YariError::internal(
            "point writing requires packed values, got an identifier-only visit",
        ))
    }

    fn visit_with_value(&mut self, doc_id: u32, packed_value: &[u8]) -> Result<()> {
        self.writer.add(packed_value, doc_id)
    }

    fn compare(&self, _min_packed_value: &[u8], _max_packed_value: &[u8]) -> Relation {
        Relation::CellCrossesQuery
    }
}

/// Like [`AddPointsVisitor`], with document ids remapped and deleted
/// documents dropped.
struct RemapVisitor<'a> {
    writer: &'a mut BkdWriter,
    doc_map: &'a DocIdMap,
}

impl IntersectVisitor for RemapVisitor<'_> {
    fn visit(&mut self, _doc_id: u32) -> Result<()> {
        Err(YariError::internal(
            "merging requires packed values, got an identifier-only visit",
        ))
    }

    fn visit_with_value(&mut self, doc_id: u32, packed_value: &[u8]) -> Result<()> {
        match self.doc_map.remap(doc_id) {
            Some(new_doc) => self.writer.add(packed_value, new_doc),
            None => Ok(()),
        }
    }

    fn compare(&self, _min_packed_value: &[u8], _max_packed_value: &[u8]) -> Relation {
        Relation::CellCrossesQuery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldInfos;
    use crate::points::SegmentReadState;
    use crate::points::reader::PointsReader;
    use crate::storage::{MemoryStorage, Storage};

    /// In-memory point values used to feed the writer.
    #[derive(Debug)]
    struct VecPoints {
        num_dims: u32,
        bytes_per_dim: u32,
        points: Vec<(Vec<u8>, u32)>,
        min_packed: Vec<u8>,
        max_packed: Vec<u8>,
    }

    impl VecPoints {
        fn new(num_dims: u32, bytes_per_dim: u32, points: Vec<(Vec<u8>, u32)>) -> Self {
            let width = bytes_per_dim as usize;
            let mut min_packed = points[0].0.clone();
            let mut max_packed = points[0].0.clone();
            for (packed, _) in &points[1..] {
                for dim in 0..num_dims as usize {
                    let range = dim * width..(dim + 1) * width;
                    let sub = &packed[range.clone()];
                    if sub < &min_packed[range.clone()] {
                        min_packed[range.clone()].copy_from_slice(sub);
                    }
                    if sub > &max_packed[range.clone()] {
                        max_packed[range].copy_from_slice(sub);
                    }
                }
            }
            VecPoints {
                num_dims,
                bytes_per_dim,
                points,
                min_packed,
                max_packed,
            }
        }
    }

    impl PointValues for VecPoints {
        fn num_dims(&self) -> u32 {
            self.num_dims
        }

        fn bytes_per_dim(&self) -> u32 {
            self.bytes_per_dim
        }

        fn size(&self) -> u64 {
            self.points.len() as u64
        }

        fn min_packed_value(&self) -> &[u8] {
            &self.min_packed
        }

        fn max_packed_value(&self) -> &[u8] {
            &self.max_packed
        }

        fn intersect(&self, visitor: &mut dyn IntersectVisitor) -> Result<()> {
            for (packed, doc_id) in &self.points {
                visitor.visit_with_value(*doc_id, packed)?;
            }
            Ok(())
        }
    }

    fn write_state(storage: Arc<dyn Storage>, fields: Vec<FieldInfo>) -> SegmentWriteState {
        SegmentWriteState::new(storage, "_0", FieldInfos::new(fields).unwrap())
    }

    #[test]
    fn test_write_after_close_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let field = FieldInfo::new("price", 0, 1, 8);
        let state = write_state(Arc::clone(&storage), vec![field.clone()]);

        let mut writer = PointsWriter::new(state).unwrap();
        writer.close().unwrap();

        let values = VecPoints::new(1, 8, vec![(1u64.to_be_bytes().to_vec(), 0)]);
        let err = writer.write_field(&field, &values).unwrap_err();
        assert!(matches!(err, YariError::InvalidOperation(_)));
    }

    #[test]
    fn test_double_close_is_noop() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let state = write_state(Arc::clone(&storage), vec![FieldInfo::new("price", 0, 1, 8)]);

        let mut writer = PointsWriter::new(state).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();

        assert!(storage.file_exists("_0.ptd"));
        assert!(storage.file_exists("_0.pti"));
    }

    #[test]
    fn test_writing_same_field_twice_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let field = FieldInfo::new("price", 0, 1, 8);
        let state = write_state(Arc::clone(&storage), vec![field.clone()]);

        let mut writer = PointsWriter::new(state).unwrap();
        let values = VecPoints::new(1, 8, vec![(1u64.to_be_bytes().to_vec(), 0)]);
        writer.write_field(&field, &values).unwrap();
        let err = writer.write_field(&field, &values).unwrap_err();
        assert!(matches!(err, YariError::InvalidOperation(_)));
    }

    #[test]
    fn test_unregistered_field_fails_close_and_deletes_outputs() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        // The registry knows field 0 only, but field 7 gets written.
        let state = write_state(Arc::clone(&storage), vec![FieldInfo::new("price", 0, 1, 8)]);

        let mut writer = PointsWriter::new(state).unwrap();
        let rogue = FieldInfo::new("rogue", 7, 1, 8);
        let values = VecPoints::new(1, 8, vec![(1u64.to_be_bytes().to_vec(), 0)]);
        writer.write_field(&rogue, &values).unwrap();

        let err = writer.close().unwrap_err();
        assert!(matches!(err, YariError::Internal(_)));
        assert!(!storage.file_exists("_0.ptd"));
        assert!(!storage.file_exists("_0.pti"));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let field = FieldInfo::new("location", 0, 2, 4);
        let state = write_state(Arc::clone(&storage), vec![field.clone()]);

        let mut writer = PointsWriter::new(state).unwrap();
        let values = VecPoints::new(1, 8, vec![(1u64.to_be_bytes().to_vec(), 0)]);
        let err = writer.write_field(&field, &values).unwrap_err();
        assert!(matches!(err, YariError::Index(_)));
        writer.close().unwrap();
    }

    #[test]
    fn test_empty_field_writes_no_directory_entry() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let field = FieldInfo::new("price", 0, 1, 8);
        let state = write_state(Arc::clone(&storage), vec![field.clone()]);
        let read_state = SegmentReadState::from_write_state(&state);

        let mut writer = PointsWriter::new(state).unwrap();
        writer.close().unwrap();

        let reader = PointsReader::open(&read_state).unwrap();
        assert!(reader.values("price").unwrap().is_none());
    }
}
