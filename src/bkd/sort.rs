//! Sort engine for BKD tree construction.
//!
//! Points are accumulated in heap up to a configured memory budget; inputs
//! that exceed the budget are spilled to fixed-width run files in temporary
//! storage and sorted externally (chunk sort + k-way merge). All scratch
//! files are owned by a [`TempFileGuard`] so they are released on every exit
//! path, success or failure.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::bkd::compare_dim;
use crate::error::{Result, YariError};
use crate::storage::{Storage, StorageInput, StorageOutput};

/// One indexed point: a fixed-width packed value and its document id.
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    /// Concatenated per-dimension sub-keys.
    pub packed: Vec<u8>,
    /// Segment-local document id.
    pub doc_id: u32,
}

impl Point {
    /// Create a new point.
    pub fn new(packed: Vec<u8>, doc_id: u32) -> Self {
        Point { packed, doc_id }
    }

    /// The sub-key of one dimension.
    pub fn dim_bytes(&self, dim: usize, bytes_per_dim: usize) -> &[u8] {
        &self.packed[dim * bytes_per_dim..(dim + 1) * bytes_per_dim]
    }
}

/// A scoped guard over temporary files.
///
/// Dropping the guard deletes every registered file through the storage.
/// Secondary deletion errors are suppressed so they never mask the failure
/// that unwound the build.
#[derive(Debug)]
pub struct TempFileGuard {
    storage: Arc<dyn Storage>,
    names: Vec<String>,
}

impl TempFileGuard {
    /// Create an empty guard over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        TempFileGuard {
            storage,
            names: Vec::new(),
        }
    }

    /// Register a temporary file for deletion.
    pub fn register(&mut self, name: String) {
        self.names.push(name);
    }

    /// Delete one registered file now.
    pub fn delete_now(&mut self, name: &str) {
        if let Some(index) = self.names.iter().position(|n| n == name) {
            self.names.swap_remove(index);
        }
        let _ = self.storage.delete_file(name);
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        for name in self.names.drain(..) {
            let _ = self.storage.delete_file(name.as_str());
        }
    }
}

/// Byte width of one run-file record.
pub(crate) fn record_len(packed_len: usize) -> usize {
    packed_len + 4
}

/// Append one point to a run file (packed bytes, then u32 doc id).
pub(crate) fn write_record<W: Write>(out: &mut W, point: &Point) -> Result<()> {
    out.write_all(&point.packed)?;
    out.write_u32::<LittleEndian>(point.doc_id)?;
    Ok(())
}

/// Read one point from a run file.
pub(crate) fn read_record<R: Read>(input: &mut R, packed_len: usize) -> Result<Point> {
    let mut packed = vec![0u8; packed_len];
    input.read_exact(&mut packed)?;
    let doc_id = input.read_u32::<LittleEndian>()?;
    Ok(Point::new(packed, doc_id))
}

/// An on-disk run of fixed-width point records.
#[derive(Debug, Clone)]
pub(crate) struct PointRun {
    pub name: String,
    pub count: u64,
}

/// Write a sequence of points as a new temp run.
pub(crate) fn spill_run(
    storage: &dyn Storage,
    guard: &mut TempFileGuard,
    prefix: &str,
    points: &[Point],
) -> Result<PointRun> {
    let (name, mut output) = storage.create_temp_output(prefix)?;
    guard.register(name.clone());
    for point in points {
        write_record(&mut output, point)?;
    }
    output.close()?;
    Ok(PointRun {
        name,
        count: points.len() as u64,
    })
}

/// Load a slice of a run into memory.
pub(crate) fn load_run(
    storage: &dyn Storage,
    run: &PointRun,
    packed_len: usize,
) -> Result<Vec<Point>> {
    let mut input = storage.open_input(&run.name)?;
    let mut points = Vec::with_capacity(run.count as usize);
    for _ in 0..run.count {
        points.push(read_record(&mut input, packed_len)?);
    }
    Ok(points)
}

/// Ordering used when partitioning: split-dimension sub-key first, document
/// id as the deterministic tie-break, full packed value last so the order is
/// total even for multi-valued documents.
pub(crate) fn dim_order(a: &Point, b: &Point, dim: usize, bytes_per_dim: usize) -> Ordering {
    compare_dim(&a.packed, &b.packed, dim, bytes_per_dim)
        .then_with(|| a.doc_id.cmp(&b.doc_id))
        .then_with(|| a.packed.cmp(&b.packed))
}

/// A run reader head participating in the k-way merge.
struct RunHead {
    point: Point,
    dim_start: usize,
    dim_end: usize,
    run: usize,
}

impl RunHead {
    fn key(&self) -> &[u8] {
        &self.point.packed[self.dim_start..self.dim_end]
    }
}

impl PartialEq for RunHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RunHead {}

impl PartialOrd for RunHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunHead {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the smallest head first.
        self.key()
            .cmp(other.key())
            .then_with(|| self.point.doc_id.cmp(&other.point.doc_id))
            .then_with(|| self.point.packed.cmp(&other.point.packed))
            .reverse()
    }
}

/// Externally sort a run by one dimension.
///
/// Reads budget-sized chunks, sorts each in memory, spills the sorted chunks
/// as intermediate runs, then k-way merges them into one sorted output run.
/// The input run and all intermediate runs are deleted; only the sorted
/// output run survives (registered with the guard).
pub(crate) fn external_sort_run(
    storage: &Arc<dyn Storage>,
    guard: &mut TempFileGuard,
    prefix: &str,
    input_run: &PointRun,
    packed_len: usize,
    dim: usize,
    bytes_per_dim: usize,
    chunk_points: usize,
) -> Result<PointRun> {
    // Chunk phase: sorted intermediate runs.
    let mut chunks: Vec<PointRun> = Vec::new();
    {
        let mut input = storage.open_input(&input_run.name)?;
        let mut remaining = input_run.count;
        while remaining > 0 {
            let take = remaining.min(chunk_points as u64) as usize;
            let mut chunk = Vec::with_capacity(take);
            for _ in 0..take {
                chunk.push(read_record(&mut input, packed_len)?);
            }
            chunk.sort_unstable_by(|a, b| dim_order(a, b, dim, bytes_per_dim));
            chunks.push(spill_run(storage.as_ref(), guard, prefix, &chunk)?);
            remaining -= take as u64;
        }
    }
    guard.delete_now(&input_run.name);

    if chunks.len() == 1 {
        return Ok(chunks.into_iter().next().unwrap());
    }

    // Merge phase: k-way merge of the sorted chunks.
    let (out_name, mut output) = storage.create_temp_output(prefix)?;
    guard.register(out_name.clone());

    let mut readers: Vec<(Box<dyn StorageInput>, u64)> = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        readers.push((storage.open_input(&chunk.name)?, chunk.count));
    }

    let dim_start = dim * bytes_per_dim;
    let dim_end = dim_start + bytes_per_dim;
    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (run, (reader, count)) in readers.iter_mut().enumerate() {
        if *count > 0 {
            let point = read_record(reader, packed_len)?;
            *count -= 1;
            heap.push(RunHead {
                point,
                dim_start,
                dim_end,
                run,
            });
        }
    }

    let mut written = 0u64;
    while let Some(head) = heap.pop() {
        write_record(&mut output, &head.point)?;
        written += 1;

        let (reader, count) = &mut readers[head.run];
        if *count > 0 {
            let point = read_record(reader, packed_len)?;
            *count -= 1;
            heap.push(RunHead {
                point,
                dim_start,
                dim_end,
                run: head.run,
            });
        }
    }
    output.close()?;
    drop(readers);

    if written != input_run.count {
        return Err(YariError::internal(format!(
            "external sort lost points: expected {}, wrote {written}",
            input_run.count
        )));
    }

    for chunk in &chunks {
        guard.delete_now(&chunk.name);
    }

    Ok(PointRun {
        name: out_name,
        count: written,
    })
}

/// Accumulates added points, spilling to a temp run once the heap budget is
/// exceeded.
#[derive(Debug)]
pub(crate) struct PointBuffer {
    storage: Arc<dyn Storage>,
    prefix: String,
    packed_len: usize,
    max_heap_points: usize,
    heap: Vec<Point>,
    spill: Option<(String, Box<dyn StorageOutput>)>,
    count: u64,
}

/// The finished input of one tree build.
pub(crate) enum PointSet {
    /// Everything fits in heap.
    Heap(Vec<Point>),
    /// Points were spilled to an on-disk run.
    Offline(PointRun),
}

impl PointBuffer {
    pub fn new(
        storage: Arc<dyn Storage>,
        prefix: String,
        packed_len: usize,
        max_heap_points: usize,
    ) -> Self {
        PointBuffer {
            storage,
            prefix,
            packed_len,
            max_heap_points,
            heap: Vec::new(),
            spill: None,
            count: 0,
        }
    }

    /// Total number of points added.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Add one point, spilling to disk once the heap budget is exceeded.
    pub fn push(&mut self, point: Point, guard: &mut TempFileGuard) -> Result<()> {
        debug_assert_eq!(point.packed.len(), self.packed_len);
        self.count += 1;

        if self.spill.is_none() && self.heap.len() < self.max_heap_points {
            self.heap.push(point);
            return Ok(());
        }

        if self.spill.is_none() {
            // Budget exceeded: move everything buffered so far to disk.
            let (name, mut output) = self.storage.create_temp_output(&self.prefix)?;
            guard.register(name.clone());
            for buffered in self.heap.drain(..) {
                write_record(&mut output, &buffered)?;
            }
            self.spill = Some((name, output));
        }

        let (_, output) = self.spill.as_mut().unwrap();
        write_record(output, &point)
    }

    /// Finish accumulation and hand back the point set.
    pub fn finish(mut self) -> Result<PointSet> {
        match self.spill.take() {
            None => Ok(PointSet::Heap(std::mem::take(&mut self.heap))),
            Some((name, mut output)) => {
                output.close()?;
                Ok(PointSet::Offline(PointRun {
                    name,
                    count: self.count,
                }))
            }
        }
    }
}
