use comms::{KvPairs, ReqMeta, Transport};
use log::info;
use tensor::Dtype;

use super::ParameterServer;
use crate::store::ParamId;

impl<T: Transport + Send + Sync + 'static> ParameterServer<T> {
    /// Closes the aggregation window for `key` if it is complete and
    /// applies the update rule; otherwise just keeps the merge buffer's
    /// memory valid and returns.
    ///
    /// In sync mode the window closes when every worker has contributed;
    /// in async mode every push closes its own window.
    pub(super) fn apply_updates(&mut self, dtype: Dtype, key: ParamId, keys: &[u64]) {
        let mp = self.has_multi_precision_copy(dtype);
        let sync = self.sync_mode;

        let pending = {
            let buf = self
                .update_bufs
                .get_mut(&key)
                .expect("no aggregation is in flight");
            if sync && buf.pending.len() != self.transport.num_workers() {
                buf.merged.as_ref().unwrap().wait_to_read();
                return;
            }
            std::mem::take(&mut buf.pending)
        };

        let stored = self.run_updater(mp, sync, key);

        if self.config.log_verbose {
            info!(key = key, responses = pending.len(); "aggregation window closed");
        }

        let serving = self.store.serving.get(&key).unwrap().clone();
        let has_pull = pending.iter().any(|req| req.pull);
        if has_pull {
            // One barrier before any pull reply, so no pull observes a
            // stale or partially-written tensor.
            if mp {
                serving.copy_from(&stored);
            }
            stored.wait_to_read();
            for req in &pending {
                if req.pull {
                    self.default_storage_response(dtype, key, req, keys);
                } else {
                    self.transport.respond(req, KvPairs::default());
                }
            }
        } else {
            for req in &pending {
                self.transport.respond(req, KvPairs::default());
            }
            if mp {
                serving.copy_from(&stored);
            }
            stored.wait_to_read();
        }
    }

    /// The alternative-transport applier: no per-descriptor replies, a
    /// per-key version bump on every application, and one versioned
    /// auto-pull broadcasting the updated value to the last originator.
    pub(super) fn apply_updates_versioned(
        &mut self,
        dtype: Dtype,
        key: ParamId,
        meta: &ReqMeta,
        keys: &[u64],
    ) {
        let mp = self.has_multi_precision_copy(dtype);
        let sync = self.sync_mode;

        {
            let buf = self
                .update_bufs
                .get_mut(&key)
                .expect("no aggregation is in flight");
            if let Some(merged) = &buf.merged {
                merged.wait_to_read();
            }
            if sync && buf.pending.len() != self.transport.num_workers() {
                return;
            }
            buf.pending.clear();
        }

        let stored = self.run_updater(mp, sync, key);

        let version = self.store.versions.entry(key).or_insert(0);
        *version += 1;
        let version = *version;

        let serving = self.store.serving.get(&key).unwrap().clone();
        if mp {
            serving.copy_from(&stored);
        }
        stored.wait_to_read();

        self.auto_pull(dtype, key, version, meta, keys);
    }

    /// Dispatches the registered update rule onto the executor thread (or
    /// falls back to a plain copy of the merged gradient) and returns the
    /// update target.
    fn run_updater(&mut self, mp: bool, sync: bool, key: ParamId) -> tensor::Tensor {
        let source = {
            let buf = self.update_bufs.get_mut(&key).unwrap();
            if sync {
                buf.merged.clone().unwrap()
            } else {
                buf.scratch.clone().unwrap()
            }
        };
        let stored = if mp {
            self.store.master.get(&key)
        } else {
            self.store.serving.get(&key)
        }
        .unwrap_or_else(|| panic!("init key {key} first"))
        .clone();

        if let Some(updater) = self.updater.clone() {
            let (src, dst) = (source, stored.clone());
            self.exec.exec(move || updater(key, &src, &dst));
        } else {
            assert!(sync, "an updater must be registered for async mode");
            stored.copy_from(&source);
        }

        stored
    }

    /// Pushes the serving tensor's bytes through the version-carrying
    /// update channel instead of a plain reply.
    pub(super) fn auto_pull(
        &self,
        dtype: Dtype,
        key: ParamId,
        version: u64,
        meta: &ReqMeta,
        keys: &[u64],
    ) {
        let stored = self
            .store
            .serving
            .get(&key)
            .unwrap_or_else(|| panic!("init key {key} first"));

        if self.has_multi_precision_copy(dtype) {
            stored.wait_to_read();
        }

        let vals = stored.to_bytes();
        let response = KvPairs {
            keys: keys.to_vec(),
            lens: vec![vals.len() as i32],
            vals,
        };
        self.transport.auto_pull_update(version, meta, response);
    }
}
