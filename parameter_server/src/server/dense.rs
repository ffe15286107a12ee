use comms::{KvPairs, ReqMeta, Transport};
use log::debug;
use tensor::{Dtype, Tensor};

use super::ParameterServer;

impl<T: Transport + Send + Sync + 'static> ParameterServer<T> {
    /// Dense pushes and pulls.
    ///
    /// The received buffer is owned by this call (the payload is taken by
    /// value), so tensors created over it stay valid for as long as the
    /// aggregation needs them.
    pub(super) fn handle_dense(&mut self, dtype: Dtype, meta: ReqMeta, data: KvPairs) {
        assert_eq!(data.keys.len(), 1, "dense requests carry exactly one key");
        if meta.push {
            assert_eq!(data.lens.len(), 1, "dense pushes carry exactly one len");
            assert_eq!(
                data.vals.len(),
                data.lens[0] as usize,
                "dense push payload does not match its len"
            );
        }

        let KvPairs { keys, vals, lens } = data;
        let key = self.decode_key(keys[0]);
        if !meta.push {
            self.default_storage_response(dtype, key, &meta, &keys);
            return;
        }

        // The alternative transport acknowledges before the update is
        // applied; the versioned auto-pull below carries the new value.
        if self.config.ts_engine {
            self.transport.respond(&meta, KvPairs::default());
        }

        let mp = self.has_multi_precision_copy(dtype);
        let len = lens[0] as usize / dtype.size();
        let recved = Tensor::dense_from_bytes(dtype, &[len], vals);

        if !self.store.serving.contains_key(&key) {
            self.init_dense(dtype, key, &meta, &keys, recved);
            return;
        }

        let sync = self.sync_mode;
        {
            let buf = self.update_bufs.entry(key).or_default();
            if sync && buf.merged.is_none() {
                let merged_dtype = if mp { Dtype::Float32 } else { dtype };
                buf.merged = Some(Tensor::dense(merged_dtype, &[len]));
            }
            if mp && buf.scratch.is_none() {
                buf.scratch = Some(Tensor::dense(Dtype::Float32, &[len]));
            }

            if buf.pending.is_empty() {
                if sync {
                    buf.merged.as_ref().unwrap().copy_from(&recved);
                } else if mp {
                    buf.scratch.as_ref().unwrap().copy_from(&recved);
                } else {
                    // Async single-push window: the received tensor itself
                    // is the update source.
                    buf.scratch = Some(recved.clone());
                }
            } else {
                assert!(sync, "async mode applies an update on every push");
                if mp {
                    let scratch = buf.scratch.as_ref().unwrap();
                    scratch.copy_from(&recved);
                    buf.merged.as_ref().unwrap().add_assign(scratch);
                } else {
                    buf.merged.as_ref().unwrap().add_assign(&recved);
                }
            }

            if self.config.ts_engine {
                // Weighted contributions count once per merged worker.
                for _ in 0..meta.num_merge {
                    buf.pending.push(meta.clone());
                }
            } else {
                buf.pending.push(meta.clone());
            }
        }

        if self.config.ts_engine {
            self.apply_updates_versioned(dtype, key, &meta, &keys);
        } else {
            self.apply_updates(dtype, key, &keys);
        }
    }

    /// First push for a key: allocate the serving tensor (and the float32
    /// master when multi-precision asks for one) and adopt the pushed
    /// values as the initial state.
    fn init_dense(&mut self, dtype: Dtype, key: i32, meta: &ReqMeta, keys: &[u64], recved: Tensor) {
        debug!(key = key; "initial dense push");
        let mp = self.has_multi_precision_copy(dtype);

        let stored_dtype = if mp { Dtype::Float32 } else { dtype };
        let stored = Tensor::dense(stored_dtype, recved.shape());
        stored.copy_from(&recved);

        if !self.config.ts_engine {
            self.transport.respond(meta, KvPairs::default());
        }

        if mp {
            let serving = Tensor::dense(dtype, recved.shape());
            serving.copy_from(&stored);
            serving.wait_to_read();
            self.store.serving.insert(key, serving);
            self.store.master.insert(key, stored.clone());
        } else {
            self.store.serving.insert(key, stored.clone());
        }
        stored.wait_to_read();

        if self.config.ts_engine {
            self.store.versions.insert(key, 0);
            self.auto_pull(dtype, key, 0, meta, keys);
        }
    }
}
