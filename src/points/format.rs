//! Naming and versioning of the on-disk points format.
//!
//! One segment's point index is two files: the data file holds, per field,
//! the leaf point blocks followed by the serialized tree structure; the index
//! file maps field numbers to tree structure offsets in the data file. Both
//! carry a codec header and a checksum footer.

/// Codec name written into the data file header.
pub const DATA_CODEC_NAME: &str = "YariPointsFormatData";

/// Codec name written into the index file header.
pub const INDEX_CODEC_NAME: &str = "YariPointsFormatIndex";

/// File extension of the per-segment data file.
pub const DATA_EXTENSION: &str = "ptd";

/// File extension of the per-segment index file.
pub const INDEX_EXTENSION: &str = "pti";

/// Oldest readable format version.
pub const VERSION_START: u32 = 0;

/// Version written by this release.
pub const VERSION_CURRENT: u32 = VERSION_START;

/// Compose a per-segment file name from segment name, suffix, and extension.
pub fn segment_file_name(segment_name: &str, segment_suffix: &str, extension: &str) -> String {
    if segment_suffix.is_empty() {
        format!("{segment_name}.{extension}")
    } else {
        format!("{segment_name}_{segment_suffix}.{extension}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_file_name() {
        assert_eq!(segment_file_name("_0", "", DATA_EXTENSION), "_0.ptd");
        assert_eq!(segment_file_name("_0", "", INDEX_EXTENSION), "_0.pti");
        assert_eq!(segment_file_name("_3", "sorted", "ptd"), "_3_sorted.ptd");
    }
}
