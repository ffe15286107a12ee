use comms::{KvPairs, ReqMeta, Transport};
use log::info;
use rayon::prelude::*;
use tensor::{Dtype, Tensor, engine};

use super::ParameterServer;
use crate::store::ParamId;

impl<T: Transport + Send + Sync + 'static> ParameterServer<T> {
    /// Row-sparse pushes and pulls.
    ///
    /// `keys[0]` is the master key; every further key encodes a row id as
    /// `master_key + row_id`. `lens[0]` is always zero. A push with no
    /// rows is a legal "nothing to contribute this round" signal.
    pub(super) fn handle_row_sparse(&mut self, dtype: Dtype, meta: ReqMeta, data: KvPairs) {
        let KvPairs { keys, vals, lens } = data;
        let master_key = self.decode_key(keys[0]);
        let num_rows = keys.len() - 1;

        if !meta.push {
            self.row_sparse_pull_response(dtype, master_key, num_rows, &meta, &keys);
            return;
        }

        assert!(!lens.is_empty(), "row-sparse pushes carry a lens vector");
        assert_eq!(lens[0], 0, "the master key carries no payload");

        if !self.store.serving.contains_key(&master_key) {
            if self.config.log_verbose {
                info!(key = master_key; "initial row-sparse push");
            }
            assert!(num_rows > 0, "init with empty data is not supported");
            self.init_row_sparse(dtype, master_key, num_rows, &meta, vals, &lens);
            return;
        }

        if self.config.log_verbose {
            info!(key = master_key, num_rows = num_rows; "row-sparse push");
        }

        let mp = self.has_multi_precision_copy(dtype);
        let sync = self.sync_mode;
        let shape = self.store.serving.get(&master_key).unwrap().shape().to_vec();
        let merged_dtype = if mp { Dtype::Float32 } else { dtype };

        {
            let buf = self.update_bufs.entry(master_key).or_default();
            if sync && buf.merged.is_none() {
                buf.merged = Some(Tensor::row_sparse(merged_dtype, &shape));
            }
            if mp && buf.scratch.is_none() {
                buf.scratch = Some(Tensor::row_sparse(Dtype::Float32, &shape));
            }
        }

        if num_rows == 0 {
            // Participation signal: the worker has no rows this round.
            if !sync {
                self.transport.respond(&meta, KvPairs::default());
                return;
            }

            let buf = self.update_bufs.get_mut(&master_key).unwrap();
            if buf.pending.is_empty() {
                // This worker opens the window; start from zero rows.
                buf.merged = Some(Tensor::row_sparse(merged_dtype, &shape));
            }
            buf.pending.push(meta.clone());
            self.apply_updates(dtype, master_key, &keys);
            return;
        }

        let unit_len = lens[1] as usize / dtype.size();
        assert!(unit_len > 0, "row-sparse push with zero-length rows");

        let rows = self.decode_row_ids(&keys, master_key);
        let recved = Tensor::row_sparse_from_bytes(dtype, &shape, rows, vals);

        {
            let buf = self.update_bufs.get_mut(&master_key).unwrap();
            if buf.pending.is_empty() {
                if sync {
                    buf.merged.as_ref().unwrap().copy_from(&recved);
                } else if mp {
                    buf.scratch.as_ref().unwrap().copy_from(&recved);
                } else {
                    buf.scratch = Some(recved.clone());
                }
            } else {
                assert!(sync, "async mode applies an update on every push");
                let to_merge = if mp {
                    let scratch = buf.scratch.as_ref().unwrap();
                    scratch.copy_from(&recved);
                    scratch
                } else {
                    &recved
                };

                // Sparse accumulation goes through the runtime's async
                // engine: sum into a fresh tensor, then swap it in.
                let merged = buf.merged.as_ref().unwrap();
                let out = Tensor::row_sparse(merged_dtype, &shape);
                engine::add_row_sparse_async(to_merge, merged, &out);
                engine::copy_async(&out, merged);
                merged.wait_to_read();
            }
            buf.pending.push(meta.clone());
        }

        self.apply_updates(dtype, master_key, &keys);
    }

    /// First push for a row-sparse key: allocate the serving tensor (all
    /// rows materialized) and schedule the job that populates the row
    /// index vector and copies the pushed values in.
    fn init_row_sparse(
        &mut self,
        dtype: Dtype,
        master_key: ParamId,
        num_rows: usize,
        meta: &ReqMeta,
        vals: Vec<u8>,
        lens: &[i32],
    ) {
        let mp = self.has_multi_precision_copy(dtype);
        let num_bytes = dtype.size();
        let unit_len = lens[1] as usize / num_bytes;
        assert!(unit_len > 0, "row-sparse init with zero-length rows");

        let shape = [num_rows, unit_len];
        assert_eq!(
            vals.len(),
            num_rows * unit_len * num_bytes,
            "row-sparse init payload does not match its shape"
        );
        let recved = Tensor::dense_from_bytes(dtype, &shape, vals);

        let stored_dtype = if mp { Dtype::Float32 } else { dtype };
        let stored = Tensor::row_sparse(stored_dtype, &shape);
        engine::populate_rows_async(&recved, &stored);

        if mp {
            let serving = Tensor::row_sparse(dtype, &shape);
            engine::copy_async(&stored, &serving);
            serving.wait_to_read();
            self.store.serving.insert(master_key, serving);
            self.store.master.insert(master_key, stored.clone());
        } else {
            self.store.serving.insert(master_key, stored.clone());
        }

        stored.wait_to_read();
        self.transport.respond(meta, KvPairs::default());
    }

    /// Answers a pull for a set of rows with one contiguous payload:
    /// `lens[0] = 0` and `lens[i > 0]` the row length in elements.
    fn row_sparse_pull_response(
        &self,
        dtype: Dtype,
        master_key: ParamId,
        num_rows: usize,
        meta: &ReqMeta,
        keys: &[u64],
    ) {
        if self.config.log_verbose {
            info!(key = master_key; "row-sparse pull");
        }

        if num_rows == 0 {
            let response = KvPairs {
                keys: keys.to_vec(),
                vals: Vec::new(),
                lens: vec![0; keys.len()],
            };
            self.transport.respond(meta, response);
            return;
        }

        let stored = self
            .store
            .serving
            .get(&master_key)
            .unwrap_or_else(|| panic!("init key {master_key} first"));
        if self.has_multi_precision_copy(dtype) {
            stored.wait_to_read();
        }

        let unit_len = stored.unit_len();
        let unit_size = unit_len * dtype.size();
        let rows = self.decode_row_ids(keys, master_key);

        let mut vals = vec![0u8; num_rows * unit_size];
        vals.par_chunks_mut(unit_size)
            .zip(rows.par_iter())
            .for_each(|(chunk, &row)| {
                // chunk is exactly one row long by construction.
                stored.copy_row_into(row, chunk).unwrap();
            });

        let mut lens = vec![unit_len as i32; keys.len()];
        lens[0] = 0;
        let response = KvPairs {
            keys: keys.to_vec(),
            vals,
            lens,
        };
        self.transport.respond(meta, response);
    }

    fn decode_row_ids(&self, keys: &[u64], master_key: ParamId) -> Vec<i64> {
        keys[1..]
            .iter()
            .map(|&key| (self.decode_key(key) - master_key) as i64)
            .collect()
    }
}
