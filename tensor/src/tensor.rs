use std::{collections::BTreeMap, sync::Arc};

use half::f16;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    Dtype,
    error::{Result, SizeMismatchErr},
};

/// Storage layout of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Dense,
    /// Only a subset of rows is materialized, each identified by a row id.
    RowSparse,
}

/// The raw storage behind a tensor handle.
///
/// Dense tensors keep `rows` empty. Row-sparse tensors hold the ids of the
/// materialized rows in ascending order, and `bytes` holds exactly those
/// rows back to back.
#[derive(Debug)]
struct Buffer {
    bytes: Vec<u8>,
    rows: Vec<i64>,
}

/// Tracks write jobs the async engine has scheduled against a tensor.
///
/// Writes are counted in submission order: a reader that recorded the
/// registered count at submission time waits only for those writes, never
/// for ones scheduled after it.
#[derive(Debug, Default)]
struct WriteState {
    counts: Mutex<WriteCounts>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct WriteCounts {
    registered: u64,
    completed: u64,
}

impl WriteState {
    fn begin(&self) {
        self.counts.lock().registered += 1;
    }

    fn end(&self) {
        self.counts.lock().completed += 1;
        self.cv.notify_all();
    }

    fn registered(&self) -> u64 {
        self.counts.lock().registered
    }

    fn wait_completed(&self, epoch: u64) {
        let mut counts = self.counts.lock();
        while counts.completed < epoch {
            self.cv.wait(&mut counts);
        }
    }

    fn wait_all(&self) {
        let mut counts = self.counts.lock();
        while counts.completed < counts.registered {
            self.cv.wait(&mut counts);
        }
    }
}

#[derive(Debug)]
struct Inner {
    dtype: Dtype,
    shape: Vec<usize>,
    layout: Layout,
    data: RwLock<Buffer>,
    writes: WriteState,
}

/// A shared handle to a host-memory buffer with shape, dtype and layout.
///
/// Handles are cheap to clone and may be passed between threads; the data
/// itself sits behind a lock, and pending writes scheduled through
/// [`crate::engine`] are observed with [`Tensor::wait_to_read`].
#[derive(Debug, Clone)]
pub struct Tensor(Arc<Inner>);

impl Tensor {
    /// Allocates a zeroed dense tensor.
    pub fn dense(dtype: Dtype, shape: &[usize]) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size();
        Self::build(dtype, shape, Layout::Dense, vec![0; len], Vec::new())
    }

    /// Wraps an owned byte buffer as a dense tensor, adopting it without a
    /// copy.
    ///
    /// # Panics
    /// If the buffer length does not match `shape` and `dtype`.
    pub fn dense_from_bytes(dtype: Dtype, shape: &[usize], bytes: Vec<u8>) -> Self {
        let expected = shape.iter().product::<usize>() * dtype.size();
        assert_eq!(
            bytes.len(),
            expected,
            "dense buffer holds {} bytes, shape wants {expected}",
            bytes.len()
        );
        Self::build(dtype, shape, Layout::Dense, bytes, Vec::new())
    }

    /// Allocates a row-sparse tensor with no materialized rows.
    ///
    /// `shape[0]` is the full row count; `shape[1..]` is the row shape.
    pub fn row_sparse(dtype: Dtype, shape: &[usize]) -> Self {
        assert!(shape.len() >= 2, "row-sparse tensors need at least 2 dims");
        Self::build(dtype, shape, Layout::RowSparse, Vec::new(), Vec::new())
    }

    /// Wraps an owned byte buffer as a row-sparse tensor holding the given
    /// rows. Rows are reordered ascending if the caller's ids are not.
    ///
    /// # Panics
    /// If the buffer length does not match the row count, or a row id is
    /// duplicated or out of range.
    pub fn row_sparse_from_bytes(
        dtype: Dtype,
        shape: &[usize],
        rows: Vec<i64>,
        bytes: Vec<u8>,
    ) -> Self {
        assert!(shape.len() >= 2, "row-sparse tensors need at least 2 dims");
        let unit_size = shape[1..].iter().product::<usize>() * dtype.size();
        assert_eq!(
            bytes.len(),
            rows.len() * unit_size,
            "row-sparse buffer does not match its row count"
        );
        for &row in &rows {
            assert!(
                (0..shape[0] as i64).contains(&row),
                "row id {row} is out of range for {} rows",
                shape[0]
            );
        }

        let (rows, bytes) = sort_rows(rows, bytes, unit_size);
        Self::build(dtype, shape, Layout::RowSparse, bytes, rows)
    }

    fn build(
        dtype: Dtype,
        shape: &[usize],
        layout: Layout,
        bytes: Vec<u8>,
        rows: Vec<i64>,
    ) -> Self {
        Self(Arc::new(Inner {
            dtype,
            shape: shape.to_vec(),
            layout,
            data: RwLock::new(Buffer { bytes, rows }),
            writes: WriteState::default(),
        }))
    }

    pub fn dtype(&self) -> Dtype {
        self.0.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    pub fn layout(&self) -> Layout {
        self.0.layout
    }

    /// Total number of elements of the full (dense) shape.
    pub fn size(&self) -> usize {
        self.0.shape.iter().product()
    }

    /// Number of elements in one row, for row-sparse tensors.
    pub fn unit_len(&self) -> usize {
        self.0.shape[1..].iter().product()
    }

    /// Blocks until every write job scheduled against this tensor has run.
    pub fn wait_to_read(&self) {
        self.0.writes.wait_all();
    }

    pub(crate) fn begin_write(&self) {
        self.0.writes.begin();
    }

    pub(crate) fn end_write(&self) {
        self.0.writes.end();
    }

    /// Number of writes registered so far; a job submitted now must wait
    /// for exactly this many completions before reading.
    pub(crate) fn write_epoch(&self) -> u64 {
        self.0.writes.registered()
    }

    pub(crate) fn wait_write_epoch(&self, epoch: u64) {
        self.0.writes.wait_completed(epoch);
    }

    /// Copies `src` into this tensor, casting between real dtypes when they
    /// differ. Row-sparse destinations adopt the source's row set.
    ///
    /// # Panics
    /// On shape or layout mismatch, or a cast involving a storage-only
    /// dtype.
    pub fn copy_from(&self, src: &Tensor) {
        src.wait_to_read();
        self.copy_from_prewaited(src);
    }

    /// The copy itself, for callers that already waited on `src`.
    pub(crate) fn copy_from_prewaited(&self, src: &Tensor) {
        assert_eq!(self.shape(), src.shape(), "copy between unequal shapes");
        assert_eq!(self.layout(), src.layout(), "copy between unequal layouts");

        let from = src.0.data.read();
        let mut to = self.0.data.write();
        to.rows.clear();
        to.rows.extend_from_slice(&from.rows);
        convert_bytes(src.dtype(), &from.bytes, self.dtype(), &mut to.bytes);
    }

    /// Adds `src` elementwise into this tensor. Both tensors must share
    /// dtype and shape; a row-sparse source adds into the matching rows of
    /// the destination.
    pub fn add_assign(&self, src: &Tensor) {
        src.wait_to_read();
        assert_eq!(self.dtype(), src.dtype(), "add between unequal dtypes");
        assert_eq!(self.shape(), src.shape(), "add between unequal shapes");

        let from = src.0.data.read();
        let mut to = self.0.data.write();
        match (self.layout(), src.layout()) {
            (Layout::Dense, Layout::Dense) => {
                let len = to.bytes.len();
                add_bytes(self.dtype(), &mut to.bytes, &from.bytes, 0, 0, len);
            }
            (Layout::RowSparse, Layout::RowSparse) => {
                let unit_size = self.unit_len() * self.dtype().size();
                for (i, row) in from.rows.iter().enumerate() {
                    let at = to
                        .rows
                        .binary_search(row)
                        .unwrap_or_else(|_| panic!("row {row} is not materialized"));
                    add_bytes(
                        self.dtype(),
                        &mut to.bytes,
                        &from.bytes,
                        at * unit_size,
                        i * unit_size,
                        unit_size,
                    );
                }
            }
            _ => panic!("add between unequal layouts"),
        }
    }

    /// Copies the tensor's raw bytes out, waiting for pending writes first.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.wait_to_read();
        self.0.data.read().bytes.clone()
    }

    /// Reads the tensor's values as float32, casting from the stored real
    /// dtype.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.wait_to_read();
        let data = self.0.data.read();
        read_reals(self.dtype(), &data.bytes)
            .into_iter()
            .map(|v| v as f32)
            .collect()
    }

    /// Row ids currently materialized, ascending.
    pub fn row_ids(&self) -> Vec<i64> {
        self.wait_to_read();
        self.0.data.read().rows.clone()
    }

    /// Copies one materialized row's bytes into `out`.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `out` is not exactly one row long.
    ///
    /// # Panics
    /// If `row_id` is not materialized.
    pub fn copy_row_into(&self, row_id: i64, out: &mut [u8]) -> Result<()> {
        let unit_size = self.unit_len() * self.dtype().size();
        if out.len() != unit_size {
            return Err(SizeMismatchErr);
        }

        let data = self.0.data.read();
        let at = data
            .rows
            .binary_search(&row_id)
            .unwrap_or_else(|_| panic!("row {row_id} is not materialized"));
        out.copy_from_slice(&data.bytes[at * unit_size..(at + 1) * unit_size]);
        Ok(())
    }

    /// Turns this row-sparse tensor into a fully-materialized copy of the
    /// dense `src`: rows 0..n populated in order, values cast as needed.
    pub(crate) fn populate_rows_from(&self, src: &Tensor) {
        assert_eq!(self.layout(), Layout::RowSparse);
        assert_eq!(src.layout(), Layout::Dense);
        assert_eq!(self.shape(), src.shape(), "populate from unequal shapes");

        let from = src.0.data.read();
        let mut to = self.0.data.write();
        to.rows = (0..self.shape()[0] as i64).collect();
        convert_bytes(src.dtype(), &from.bytes, self.dtype(), &mut to.bytes);
    }

    /// Overwrites this tensor with the row-sparse sum of `lhs` and `rhs`:
    /// the union of their row sets, overlapping rows added elementwise.
    pub(crate) fn set_row_sparse_sum(&self, lhs: &Tensor, rhs: &Tensor) {
        assert_eq!(lhs.dtype(), rhs.dtype(), "sum between unequal dtypes");
        assert_eq!(self.dtype(), lhs.dtype(), "sum into an unequal dtype");
        assert_eq!(self.layout(), Layout::RowSparse);

        let unit_len = self.unit_len();
        let mut acc: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for side in [lhs, rhs] {
            let data = side.0.data.read();
            let reals = read_reals(side.dtype(), &data.bytes);
            for (i, &row) in data.rows.iter().enumerate() {
                let chunk = &reals[i * unit_len..(i + 1) * unit_len];
                match acc.entry(row) {
                    std::collections::btree_map::Entry::Vacant(e) => {
                        e.insert(chunk.to_vec());
                    }
                    std::collections::btree_map::Entry::Occupied(mut e) => {
                        for (a, b) in e.get_mut().iter_mut().zip(chunk) {
                            *a += b;
                        }
                    }
                }
            }
        }

        let mut to = self.0.data.write();
        to.rows = acc.keys().copied().collect();
        let flat: Vec<f64> = acc.into_values().flatten().collect();
        write_reals(self.dtype(), &flat, &mut to.bytes);
    }
}

fn sort_rows(rows: Vec<i64>, bytes: Vec<u8>, unit_size: usize) -> (Vec<i64>, Vec<u8>) {
    if rows.is_sorted() {
        return (rows, bytes);
    }

    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by_key(|&i| rows[i]);

    let mut sorted_rows = Vec::with_capacity(rows.len());
    let mut sorted_bytes = Vec::with_capacity(bytes.len());
    for i in order {
        sorted_rows.push(rows[i]);
        sorted_bytes.extend_from_slice(&bytes[i * unit_size..(i + 1) * unit_size]);
    }
    (sorted_rows, sorted_bytes)
}

fn read_reals(dtype: Dtype, bytes: &[u8]) -> Vec<f64> {
    match dtype {
        Dtype::Float32 => bytes
            .chunks_exact(4)
            .map(|c| bytemuck::pod_read_unaligned::<f32>(c) as f64)
            .collect(),
        Dtype::Float64 => bytes
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned::<f64>)
            .collect(),
        Dtype::Float16 => bytes
            .chunks_exact(2)
            .map(|c| bytemuck::pod_read_unaligned::<f16>(c).to_f64())
            .collect(),
        other => panic!("dtype {other:?} does not support arithmetic"),
    }
}

fn write_reals(dtype: Dtype, vals: &[f64], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(vals.len() * dtype.size());
    match dtype {
        Dtype::Float32 => {
            for &v in vals {
                out.extend_from_slice(&(v as f32).to_ne_bytes());
            }
        }
        Dtype::Float64 => {
            for &v in vals {
                out.extend_from_slice(&v.to_ne_bytes());
            }
        }
        Dtype::Float16 => {
            for &v in vals {
                out.extend_from_slice(&f16::from_f64(v).to_ne_bytes());
            }
        }
        other => panic!("dtype {other:?} does not support arithmetic"),
    }
}

fn convert_bytes(from: Dtype, src: &[u8], to: Dtype, dst: &mut Vec<u8>) {
    if from == to {
        dst.clear();
        dst.extend_from_slice(src);
        return;
    }

    assert!(
        from.is_real() && to.is_real(),
        "cast from {from:?} to {to:?} is not supported"
    );
    let reals = read_reals(from, src);
    write_reals(to, &reals, dst);
}

fn add_bytes(dtype: Dtype, dst: &mut [u8], src: &[u8], dst_at: usize, src_at: usize, len: usize) {
    let dst = &mut dst[dst_at..dst_at + len];
    let src = &src[src_at..src_at + len];
    let mut sum = read_reals(dtype, dst);
    for (a, b) in sum.iter_mut().zip(read_reals(dtype, src)) {
        *a += b;
    }

    let mut bytes = Vec::new();
    write_reals(dtype, &sum, &mut bytes);
    dst.copy_from_slice(&bytes);
}
