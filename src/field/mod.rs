//! Field metadata registry for point-indexed fields.
//!
//! The registry supplies, per field, the dimension count and per-dimension
//! byte width used at both write and read time. These must match exactly
//! between the writer and the reader or the tree structure is unreadable.

use ahash::AHashMap;

use crate::error::{Result, YariError};

/// Metadata for one indexed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,

    /// Field number, consistent across the segments of one index.
    pub number: u32,

    /// Number of indexed dimensions; zero means the field holds no points.
    pub dimension_count: u32,

    /// Byte width of each dimension sub-key.
    pub dimension_num_bytes: u32,
}

impl FieldInfo {
    /// Create metadata for a point-indexed field.
    pub fn new(
        name: impl Into<String>,
        number: u32,
        dimension_count: u32,
        dimension_num_bytes: u32,
    ) -> Self {
        FieldInfo {
            name: name.into(),
            number,
            dimension_count,
            dimension_num_bytes,
        }
    }

    /// Whether this field carries point values.
    pub fn has_points(&self) -> bool {
        self.dimension_count > 0
    }

    /// Total packed value length: all dimension sub-keys concatenated.
    pub fn packed_bytes_len(&self) -> usize {
        (self.dimension_count * self.dimension_num_bytes) as usize
    }
}

/// An immutable registry of field metadata, indexed by name and number.
#[derive(Debug, Clone, Default)]
pub struct FieldInfos {
    fields: Vec<FieldInfo>,
    by_name: AHashMap<String, usize>,
    by_number: AHashMap<u32, usize>,
}

impl FieldInfos {
    /// Build a registry from a list of field infos.
    ///
    /// Duplicate names or numbers are rejected.
    pub fn new(fields: Vec<FieldInfo>) -> Result<Self> {
        let mut by_name = AHashMap::with_capacity(fields.len());
        let mut by_number = AHashMap::with_capacity(fields.len());

        for (index, field) in fields.iter().enumerate() {
            if by_name.insert(field.name.clone(), index).is_some() {
                return Err(YariError::index(format!(
                    "duplicate field name \"{}\"",
                    field.name
                )));
            }
            if by_number.insert(field.number, index).is_some() {
                return Err(YariError::index(format!(
                    "duplicate field number {}",
                    field.number
                )));
            }
        }

        Ok(FieldInfos {
            fields,
            by_name,
            by_number,
        })
    }

    /// Look up a field by name.
    pub fn field_by_name(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// Look up a field by number.
    pub fn field_by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.by_number.get(&number).map(|&i| &self.fields[i])
    }

    /// Whether any field carries point values.
    pub fn has_points(&self) -> bool {
        self.fields.iter().any(|f| f.has_points())
    }

    /// Iterate over all fields in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter()
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_info() {
        let field = FieldInfo::new("location", 3, 2, 4);
        assert!(field.has_points());
        assert_eq!(field.packed_bytes_len(), 8);

        let no_points = FieldInfo::new("title", 0, 0, 0);
        assert!(!no_points.has_points());
        assert_eq!(no_points.packed_bytes_len(), 0);
    }

    #[test]
    fn test_field_infos_lookup() {
        let infos = FieldInfos::new(vec![
            FieldInfo::new("price", 0, 1, 8),
            FieldInfo::new("location", 1, 2, 4),
        ])
        .unwrap();

        assert_eq!(infos.len(), 2);
        assert!(infos.has_points());
        assert_eq!(infos.field_by_name("price").unwrap().number, 0);
        assert_eq!(infos.field_by_number(1).unwrap().name, "location");
        assert!(infos.field_by_name("missing").is_none());
        assert!(infos.field_by_number(7).is_none());
    }

    #[test]
    fn test_duplicate_fields_rejected() {
        let result = FieldInfos::new(vec![
            FieldInfo::new("price", 0, 1, 8),
            FieldInfo::new("price", 1, 1, 8),
        ]);
        assert!(result.is_err());

        let result = FieldInfos::new(vec![
            FieldInfo::new("price", 0, 1, 8),
            FieldInfo::new("location", 0, 2, 4),
        ]);
        assert!(result.is_err());
    }
}
