//! The async side of the tensor runtime.
//!
//! Jobs run on the rayon pool. At submission a job records each source's
//! current write epoch and registers one write on its destination; when it
//! runs it waits for exactly the recorded epochs, so a read-after-write
//! chain submitted from one thread in program order is honored, and a
//! write registered after a reader never stalls that reader.

use crate::{Layout, Tensor};

/// Schedules an async copy of `src` into `dst`.
pub fn copy_async(src: &Tensor, dst: &Tensor) {
    let src_epoch = src.write_epoch();
    dst.begin_write();
    let (src, dst) = (src.clone(), dst.clone());
    rayon::spawn(move || {
        src.wait_write_epoch(src_epoch);
        dst.copy_from_prewaited(&src);
        dst.end_write();
    });
}

/// Schedules the job that turns `dst` into a fully-materialized row-sparse
/// copy of the dense `src`: the row-index vector is populated densely and
/// values are copied, casting if the dtypes differ.
pub fn populate_rows_async(src: &Tensor, dst: &Tensor) {
    assert_eq!(src.layout(), Layout::Dense);
    assert_eq!(dst.layout(), Layout::RowSparse);

    let src_epoch = src.write_epoch();
    dst.begin_write();
    let (src, dst) = (src.clone(), dst.clone());
    rayon::spawn(move || {
        src.wait_write_epoch(src_epoch);
        dst.populate_rows_from(&src);
        dst.end_write();
    });
}

/// Schedules the row-sparse sum `out = lhs + rhs`: the union of both row
/// sets, overlapping rows added elementwise.
pub fn add_row_sparse_async(lhs: &Tensor, rhs: &Tensor, out: &Tensor) {
    let lhs_epoch = lhs.write_epoch();
    let rhs_epoch = rhs.write_epoch();
    out.begin_write();
    let (lhs, rhs, out) = (lhs.clone(), rhs.clone(), out.clone());
    rayon::spawn(move || {
        lhs.wait_write_epoch(lhs_epoch);
        rhs.wait_write_epoch(rhs_epoch);
        out.set_row_sparse_sum(&lhs, &rhs);
        out.end_write();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dtype;

    fn row_sparse_f32(shape: &[usize], rows: Vec<i64>, vals: &[f32]) -> Tensor {
        let bytes: &[u8] = bytemuck::cast_slice(vals);
        Tensor::row_sparse_from_bytes(Dtype::Float32, shape, rows, bytes.to_vec())
    }

    fn dense_2d_f32(shape: &[usize], vals: &[f32]) -> Tensor {
        let bytes: &[u8] = bytemuck::cast_slice(vals);
        Tensor::dense_from_bytes(Dtype::Float32, shape, bytes.to_vec())
    }

    #[test]
    fn test_populate_rows() {
        let src = dense_2d_f32(&[2, 2], &[1.0, 1.0, 2.0, 2.0]);
        let dst = Tensor::row_sparse(Dtype::Float32, &[2, 2]);

        populate_rows_async(&src, &dst);
        dst.wait_to_read();
        assert_eq!(dst.row_ids(), [0, 1]);
        assert_eq!(dst.to_f32_vec(), [1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_populate_casts_to_f32_master() {
        let worker = Tensor::dense(Dtype::Float16, &[2, 1]);
        worker.copy_from(&Tensor::dense_from_bytes(
            Dtype::Float32,
            &[2, 1],
            bytemuck::cast_slice(&[0.5f32, 1.5]).to_vec(),
        ));
        let master = Tensor::row_sparse(Dtype::Float32, &[2, 1]);

        populate_rows_async(&worker, &master);
        master.wait_to_read();
        assert_eq!(master.to_f32_vec(), [0.5, 1.5]);
    }

    #[test]
    fn test_row_sparse_sum_unions_rows() {
        let a = row_sparse_f32(&[3, 2], vec![0], &[10.0, 10.0]);
        let b = row_sparse_f32(&[3, 2], vec![0, 2], &[1.0, 1.0, 30.0, 30.0]);
        let out = Tensor::row_sparse(Dtype::Float32, &[3, 2]);

        add_row_sparse_async(&a, &b, &out);
        out.wait_to_read();
        assert_eq!(out.row_ids(), [0, 2]);
        assert_eq!(out.to_f32_vec(), [11.0, 11.0, 30.0, 30.0]);
    }

    #[test]
    fn test_read_after_write_chain() {
        // populate -> sum -> copy back, all submitted before any wait.
        let init = dense_2d_f32(&[3, 1], &[1.0, 2.0, 3.0]);
        let merged = Tensor::row_sparse(Dtype::Float32, &[3, 1]);
        populate_rows_async(&init, &merged);

        let grad = row_sparse_f32(&[3, 1], vec![1], &[10.0]);
        let out = Tensor::row_sparse(Dtype::Float32, &[3, 1]);
        add_row_sparse_async(&grad, &merged, &out);
        copy_async(&out, &merged);

        merged.wait_to_read();
        assert_eq!(merged.row_ids(), [0, 1, 2]);
        assert_eq!(merged.to_f32_vec(), [1.0, 12.0, 3.0]);
    }
}
