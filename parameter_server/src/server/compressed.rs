use comms::{KvPairs, ReqMeta, Transport};
use tensor::{Dtype, Tensor};

use super::ParameterServer;

impl<T: Transport + Send + Sync + 'static> ParameterServer<T> {
    /// Lossy-compressed pushes and pulls. The codec owns the payload
    /// format; this handler only routes buffers through it.
    ///
    /// Wire layout: `keys[0]` is the original element count, `keys[1]` the
    /// parameter id, `vals` the compressed payload of `lens[1]` bytes.
    pub(super) fn handle_compressed(&mut self, dtype: Dtype, meta: ReqMeta, data: KvPairs) {
        assert_eq!(
            dtype,
            Dtype::Float32,
            "gradient compression is supported for float32 only"
        );

        let KvPairs { keys, vals, lens } = data;
        if !meta.push {
            assert_eq!(keys.len(), 1, "compressed pulls carry exactly one key");
            assert!(lens.is_empty(), "compressed pulls carry no lens");
            let key = self.decode_key(keys[0]);
            self.default_storage_response(dtype, key, &meta, &keys);
            return;
        }

        assert_eq!(keys.len(), 2, "compressed pushes carry two keys");
        assert_eq!(lens.len(), 2, "compressed pushes carry two lens");
        assert_eq!(
            vals.len(),
            lens[1] as usize,
            "compressed push payload does not match its len"
        );

        let original_size = self.decode_key(keys[0]) as usize;
        let key = self.decode_key(keys[1]);

        let compressed_len = lens[1] as usize / dtype.size();
        let recved = Tensor::dense_from_bytes(dtype, &[compressed_len], vals);
        let dshape = [original_size];

        let decomp = self
            .decomp_bufs
            .entry(key)
            .or_insert_with(|| Tensor::dense(Dtype::Float32, &dshape))
            .clone();

        if !self.store.serving.contains_key(&key) {
            // Initialization: the first push carries the full tensor.
            let stored = Tensor::dense(Dtype::Float32, &dshape);
            self.compression.dequantize(&recved, &stored);
            self.store.serving.insert(key, stored.clone());
            self.transport.respond(&meta, KvPairs::default());
            stored.wait_to_read();
        } else if self.sync_mode {
            {
                let buf = self.update_bufs.entry(key).or_default();
                if buf.merged.is_none() {
                    buf.merged = Some(Tensor::dense(Dtype::Float32, &dshape));
                }

                let merged = buf.merged.as_ref().unwrap();
                if buf.pending.is_empty() {
                    self.compression.dequantize(&recved, merged);
                } else {
                    self.compression.dequantize(&recved, &decomp);
                    merged.add_assign(&decomp);
                }
                buf.pending.push(meta.clone());
            }
            self.apply_updates(dtype, key, &keys);
        } else {
            // Async push: decompress and hand the optimizer the scratch
            // directly, no aggregation window.
            self.compression.dequantize(&recved, &decomp);
            let updater = self
                .updater
                .clone()
                .expect("an updater must be registered for async mode");
            let stored = self.store.serving.get(&key).unwrap().clone();
            let src = decomp.clone();
            let dst = stored.clone();
            self.exec.exec(move || updater(key, &src, &dst));
            self.transport.respond(&meta, KvPairs::default());
            stored.wait_to_read();
        }
    }
}
