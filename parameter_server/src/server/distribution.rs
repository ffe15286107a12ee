use std::{
    sync::{Arc, atomic::Ordering},
    time::Instant,
};

use comms::{KvPairs, ModelPush, ReqMeta, Transport};
use log::debug;
use tensor::{Dtype, Tensor};

use super::ParameterServer;

impl<T: Transport + Send + Sync + 'static> ParameterServer<T> {
    /// A pre-aggregated push from a sub-tree of workers: fold it into the
    /// serving tensor, and once every worker is accounted for, kick off a
    /// distribution of the result.
    pub(super) fn local_aggregation(&mut self, dtype: Dtype, meta: ReqMeta, data: KvPairs) {
        assert_eq!(data.keys.len(), 1, "local aggregation carries one key");
        assert!(meta.push, "local aggregation requests are pushes");
        assert_eq!(data.lens.len(), 1, "local aggregation carries one len");
        assert_eq!(
            data.vals.len(),
            data.lens[0] as usize,
            "local aggregation payload does not match its len"
        );

        let KvPairs { keys, vals, lens } = data;
        let key = self.decode_key(keys[0]);
        let len = lens[0] as usize / dtype.size();
        let recved = Tensor::dense_from_bytes(dtype, &[len], vals);

        let stored = self
            .store
            .serving
            .entry(key)
            .or_insert_with(|| Tensor::dense(dtype, &[len]))
            .clone();
        if self.num_aggregation == 0 {
            stored.copy_from(&recved);
        } else {
            stored.add_assign(&recved);
        }
        stored.wait_to_read();

        self.num_aggregation += meta.num_aggregation;
        if self.num_aggregation as usize == self.transport.num_workers() {
            assert!(
                self.sync_mode,
                "push-based distribution requires sync mode"
            );
            self.transport.notice_iteration_finished();
            self.num_aggregation = 0;
            self.distribute_serving(meta, keys);
        }
    }

    /// Snapshots the serving tensor for `keys[0]` and hands the payload to
    /// the pool for distribution.
    pub(super) fn distribute_serving(&mut self, meta: ReqMeta, keys: Vec<u64>) {
        let key = self.decode_key(keys[0]);
        let stored = self
            .store
            .serving
            .get(&key)
            .unwrap_or_else(|| panic!("init key {key} first"));

        let vals = stored.to_bytes();
        let payload = KvPairs {
            keys,
            lens: vec![vals.len() as i32],
            vals,
        };

        let transport = self.transport.clone();
        let iteration = self.iteration.clone();
        self.pool
            .enqueue(move || run_distribution(transport, iteration, meta, payload));
    }
}

/// One model-distribution loop, run on a pool thread.
///
/// The transport's receiver oracle picks peers one at a time from the
/// elapsed time of the previous send, until it returns the quit sentinel.
fn run_distribution<T: Transport>(
    transport: Arc<T>,
    iteration: Arc<std::sync::atomic::AtomicU64>,
    meta: ReqMeta,
    payload: KvPairs,
) {
    let iteration = iteration.fetch_add(1, Ordering::SeqCst) + 1;
    let mut last_bandwidth = comms::UNKNOWN;
    let mut last_receiver = comms::UNKNOWN;

    loop {
        let receiver = transport.model_receiver(last_bandwidth, last_receiver, iteration);
        if receiver == comms::QUIT {
            break;
        }

        let msg = ModelPush {
            key: meta.key,
            version: iteration,
            timestamp: meta.timestamp,
            recver: receiver,
            data: payload.clone(),
        };

        let start = Instant::now();
        transport.send_model(msg);
        transport.wait_distribution_reply();

        // Negative elapsed microseconds: the oracle interprets the sign,
        // and even a minutes-long send still fits an i32.
        let micros = start.elapsed().as_micros() as i64;
        last_bandwidth = (-micros) as i32;
        debug!(iteration = iteration, receiver = receiver, bandwidth = last_bandwidth; "model distribution");
        last_receiver = receiver;
    }
}
