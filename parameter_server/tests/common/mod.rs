#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc, thread::JoinHandle};

use comms::{
    ControlReq, DataOp, KvPairs, ModelPush, QUIT, ReqMeta, RequestFlavor, Transport,
};
use parking_lot::{Condvar, Mutex};
use tensor::Dtype;

/// Everything the server sent back through the transport, in order of
/// arrival per channel.
#[derive(Default)]
pub struct TransportLog {
    pub responses: Vec<(ReqMeta, KvPairs)>,
    pub auto_pulls: Vec<(u64, ReqMeta, KvPairs)>,
    pub control_acks: usize,
    pub models: Vec<ModelPush>,
    pub iteration_notices: usize,
    pub oracle_calls: Vec<(i32, i32, u64)>,
}

/// A scripted stand-in for the RPC layer: records every outbound call and
/// answers the receiver oracle from a pre-seeded list.
pub struct MockTransport {
    workers: usize,
    rank: usize,
    range_begin: u64,
    pub log: Mutex<TransportLog>,
    receivers: Mutex<VecDeque<i32>>,
    distributions_done: Mutex<usize>,
    done_cv: Condvar,
}

impl MockTransport {
    pub fn new(workers: usize) -> Arc<Self> {
        Self::with_receivers(workers, Vec::new())
    }

    /// `receivers` feeds the oracle in order; once exhausted every further
    /// call answers the quit sentinel.
    pub fn with_receivers(workers: usize, receivers: Vec<i32>) -> Arc<Self> {
        Arc::new(Self {
            workers,
            rank: 0,
            range_begin: 0,
            log: Mutex::new(TransportLog::default()),
            receivers: Mutex::new(receivers.into()),
            distributions_done: Mutex::new(0),
            done_cv: Condvar::new(),
        })
    }

    pub fn with_rank(workers: usize, rank: usize) -> Arc<Self> {
        let mut transport = Self::with_receivers(workers, Vec::new());
        Arc::get_mut(&mut transport).unwrap().rank = rank;
        transport
    }

    /// Blocks until `n` distribution loops have reached the quit sentinel.
    pub fn wait_distributions(&self, n: usize) {
        let mut done = self.distributions_done.lock();
        while *done < n {
            self.done_cv.wait(&mut done);
        }
    }
}

impl Transport for MockTransport {
    fn num_workers(&self) -> usize {
        self.workers
    }

    fn my_rank(&self) -> usize {
        self.rank
    }

    fn node_id(&self) -> i32 {
        1
    }

    fn key_range_begin(&self) -> u64 {
        self.range_begin
    }

    fn respond(&self, meta: &ReqMeta, data: KvPairs) {
        self.log.lock().responses.push((meta.clone(), data));
    }

    fn ack_control(&self, _req: &ControlReq) {
        self.log.lock().control_acks += 1;
    }

    fn auto_pull_update(&self, version: u64, meta: &ReqMeta, data: KvPairs) {
        self.log.lock().auto_pulls.push((version, meta.clone(), data));
    }

    fn model_receiver(&self, last_bandwidth: i32, last_receiver: i32, iteration: u64) -> i32 {
        self.log
            .lock()
            .oracle_calls
            .push((last_bandwidth, last_receiver, iteration));

        let next = self.receivers.lock().pop_front().unwrap_or(QUIT);
        if next == QUIT {
            *self.distributions_done.lock() += 1;
            self.done_cv.notify_all();
        }
        next
    }

    fn send_model(&self, msg: ModelPush) {
        self.log.lock().models.push(msg);
    }

    fn wait_distribution_reply(&self) {}

    fn notice_iteration_finished(&self) {
        self.log.lock().iteration_notices += 1;
    }
}

pub fn data_cmd(flavor: RequestFlavor, dtype: Dtype) -> i32 {
    DataOp {
        flavor,
        dtype: dtype.code(),
    }
    .encode()
}

pub fn push_meta(key: u64, cmd: i32) -> ReqMeta {
    ReqMeta::push(key, cmd)
}

pub fn push_pull_meta(key: u64, cmd: i32) -> ReqMeta {
    ReqMeta {
        pull: true,
        ..ReqMeta::push(key, cmd)
    }
}

pub fn pull_meta(key: u64, cmd: i32) -> ReqMeta {
    ReqMeta {
        push: false,
        pull: true,
        ..ReqMeta::push(key, cmd)
    }
}

pub fn sync_mode() -> ControlReq {
    ControlReq {
        head: 3,
        body: String::new(),
    }
}

pub fn f16_bytes(vals: &[f32]) -> Vec<u8> {
    vals.iter()
        .flat_map(|&v| half::f16::from_f32(v).to_ne_bytes())
        .collect()
}

pub fn f16_payload(key: u64, vals: &[f32]) -> KvPairs {
    let bytes = f16_bytes(vals);
    KvPairs {
        keys: vec![key],
        lens: vec![bytes.len() as i32],
        vals: bytes,
    }
}

/// Spawns a thread owning the server's main executor. Stop it with a
/// `StopServer` command or `executor.stop()` before joining.
pub fn start_executor(
    server: &parameter_server::ParameterServer<MockTransport>,
) -> JoinHandle<()> {
    let exec = server.executor();
    std::thread::spawn(move || exec.run())
}
