//! Merge inputs: document id remapping and source segment handles.

use crate::bkd::PointValues;
use crate::error::{Result, YariError};
use crate::field::FieldInfos;
use crate::points::reader::PointsReader;

/// Maps one source segment's document ids into the merged segment's id space.
///
/// Deleted documents map to `None` and are dropped from the merged tree.
#[derive(Debug, Clone)]
pub struct DocIdMap {
    doc_base: u32,
    remap: Option<Vec<i32>>,
}

impl DocIdMap {
    /// A map with no deletions: every id shifts by `doc_base`.
    pub fn identity(doc_base: u32) -> Self {
        DocIdMap {
            doc_base,
            remap: None,
        }
    }

    /// A map with deletions. `remap[old]` is the segment-local new id, or a
    /// negative value when the document was deleted.
    pub fn with_deletes(doc_base: u32, remap: Vec<i32>) -> Self {
        DocIdMap {
            doc_base,
            remap: Some(remap),
        }
    }

    /// Remap one source-local document id, or `None` when deleted.
    pub fn remap(&self, old_doc: u32) -> Option<u32> {
        match &self.remap {
            None => Some(self.doc_base + old_doc),
            Some(map) => match map.get(old_doc as usize) {
                Some(&new_doc) if new_doc >= 0 => Some(self.doc_base + new_doc as u32),
                _ => None,
            },
        }
    }
}

/// Supplies per-field point values for a merge source that has no native
/// on-disk tree, so its points must be re-added one by one.
pub trait PointsProvider: std::fmt::Debug {
    /// The point values of one field, or `None` when the source has none.
    fn point_values(&self, field_name: &str) -> Result<Option<Box<dyn PointValues + '_>>>;
}

/// One merge input segment.
///
/// The variant set is closed: a source either exposes its native tree files,
/// enabling the streaming fast path, or it is an opaque provider that forces
/// the generic rebuild. The distinction is checked once per merge, not per
/// point.
#[derive(Debug)]
pub enum MergeSource {
    /// A segment written by this format, with readable tree structures.
    Native(PointsReader),
    /// Any other supplier of point values.
    Generic(Box<dyn PointsProvider>),
}

impl MergeSource {
    /// The point values of one field, regardless of variant.
    pub fn point_values(&self, field_name: &str) -> Result<Option<Box<dyn PointValues + '_>>> {
        match self {
            MergeSource::Native(reader) => {
                let values = reader.values(field_name)?;
                Ok(values.map(|v| Box::new(v) as Box<dyn PointValues + '_>))
            }
            MergeSource::Generic(provider) => provider.point_values(field_name),
        }
    }
}

/// Everything a merge needs: the target field registry and, per source, the
/// segment handle and its document id map.
#[derive(Debug)]
pub struct MergeState {
    pub field_infos: FieldInfos,
    pub sources: Vec<MergeSource>,
    pub doc_maps: Vec<DocIdMap>,
}

impl MergeState {
    /// Assemble a merge state, one doc map per source.
    pub fn new(
        field_infos: FieldInfos,
        sources: Vec<MergeSource>,
        doc_maps: Vec<DocIdMap>,
    ) -> Result<Self> {
        if sources.len() != doc_maps.len() {
            return Err(YariError::internal(format!(
                "merge state mismatch: {} sources but {} doc maps",
                sources.len(),
                doc_maps.len()
            )));
        }
        Ok(MergeState {
            field_infos,
            sources,
            doc_maps,
        })
    }
}
