mod apply;
mod compressed;
mod dense;
mod distribution;
mod sparse;

use std::{
    collections::HashMap,
    sync::{Arc, atomic::AtomicU64},
};

use comms::{
    CommandType, ControlCmd, ControlReq, DataOp, KvPairs, ReqMeta, RequestFlavor, Transport,
};
use log::debug;
use tensor::{Dtype, Layout, Tensor};

use crate::{
    compression::{GradientCompression, PassthroughCodec},
    config::ServerConfig,
    execution::{DistributionPool, Executor},
    profiler::{NullProfiler, Profiler, ProfilerCommand, parse_profiler_config},
    store::{KeyStore, ParamId, UpdateBuf},
};

/// The host-supplied update rule: `(key, gradient, target)`. Runs on the
/// executor thread so it may touch thread-bound host state.
pub type Updater = Arc<dyn Fn(ParamId, &Tensor, &Tensor) + Send + Sync>;

/// An arbitrary host callback invoked through the `Controller` control
/// command, also pinned to the executor thread.
pub type Controller = Arc<dyn Fn(i32, &str) + Send + Sync>;

/// The server core: dispatches pushes and pulls from the transport,
/// aggregates gradients per key, applies the update rule and serves the
/// resulting tensors back.
///
/// All request handling happens on the transport's dispatch thread, which
/// serializes requests per key; the only work leaving that thread is the
/// update rule (executor) and model-distribution loops (pool).
pub struct ParameterServer<T: Transport> {
    transport: Arc<T>,
    config: ServerConfig,
    sync_mode: bool,
    multi_precision: bool,

    store: KeyStore,
    update_bufs: HashMap<ParamId, UpdateBuf>,
    decomp_bufs: HashMap<ParamId, Tensor>,

    compression: Box<dyn GradientCompression + Send>,
    profiler: Box<dyn Profiler + Send + Sync>,
    updater: Option<Updater>,
    controller: Option<Controller>,

    exec: Arc<Executor>,
    pool: DistributionPool,
    /// Process-wide count of initiated model distributions. Bumped on the
    /// pool thread, read back as the version of distributed payloads.
    iteration: Arc<AtomicU64>,
    /// Workers already folded into the current local-aggregation round.
    num_aggregation: i32,
}

impl<T: Transport + Send + Sync + 'static> ParameterServer<T> {
    pub fn new(transport: Arc<T>, config: ServerConfig) -> Self {
        let pool_threads = if config.le_method { 1 } else { 0 };

        Self {
            transport,
            config,
            sync_mode: false,
            multi_precision: false,
            store: KeyStore::default(),
            update_bufs: HashMap::new(),
            decomp_bufs: HashMap::new(),
            compression: Box::new(PassthroughCodec::default()),
            profiler: Box::new(NullProfiler),
            updater: None,
            controller: None,
            exec: Arc::new(Executor::new()),
            pool: DistributionPool::new(pool_threads),
            iteration: Arc::new(AtomicU64::new(0)),
            num_aggregation: 0,
        }
    }

    pub fn set_updater(&mut self, updater: Updater) {
        self.updater = Some(updater);
    }

    pub fn set_controller(&mut self, controller: Controller) {
        self.controller = Some(controller);
    }

    pub fn set_compression(&mut self, codec: Box<dyn GradientCompression + Send>) {
        self.compression = codec;
    }

    pub fn set_profiler(&mut self, profiler: Box<dyn Profiler + Send + Sync>) {
        self.profiler = profiler;
    }

    /// Handle to the main executor, for the thread that will own it.
    pub fn executor(&self) -> Arc<Executor> {
        self.exec.clone()
    }

    /// Turns the calling thread into the main executor until `StopServer`
    /// arrives.
    pub fn run(&self) {
        self.exec.run();
    }

    /// Entry point for data-channel requests.
    pub fn handle_data(&mut self, meta: ReqMeta, data: KvPairs) {
        let op = DataOp::decode(meta.cmd);
        let dtype = Dtype::from_code(op.dtype);

        if self.config.le_method {
            assert!(
                op.flavor == RequestFlavor::Dense,
                "push-based distribution supports dense requests only"
            );
            match meta.control {
                Some(ControlCmd::LocalAggregation) => self.local_aggregation(dtype, meta, data),
                Some(ControlCmd::Init) => {
                    let keys = data.keys.clone();
                    self.handle_dense(dtype, meta.clone(), data);
                    self.distribute_serving(meta, keys);
                }
                _ => {}
            }
            return;
        }

        match op.flavor {
            RequestFlavor::Dense => self.handle_dense(dtype, meta, data),
            RequestFlavor::RowSparse => self.handle_row_sparse(dtype, meta, data),
            RequestFlavor::Compressed => self.handle_compressed(dtype, meta, data),
        }
    }

    /// Entry point for control-channel requests. Always acknowledges.
    pub fn handle_command(&mut self, req: ControlReq) {
        match CommandType::from_head(req.head) {
            CommandType::StopServer => self.exec.stop(),
            CommandType::SyncMode => self.sync_mode = true,
            CommandType::SetGradientCompression => self.compression.decode_params(&req.body),
            CommandType::SetProfilerParams => self.profiler_command(&req.body),
            CommandType::SetMultiPrecision => {
                if !self.multi_precision {
                    self.multi_precision = true;
                    self.create_multi_precision_copies();
                }
            }
            CommandType::Controller => {
                let controller = self
                    .controller
                    .clone()
                    .expect("no controller is registered");
                let (head, body) = (req.head, req.body.clone());
                self.exec.exec(move || controller(head, &body));
            }
        }

        self.transport.ack_control(&req);
    }

    /// Backfills float32 master copies for keys that were initialized
    /// before multi-precision mode was switched on.
    fn create_multi_precision_copies(&mut self) {
        let KeyStore {
            serving, master, ..
        } = &mut self.store;

        for (&key, stored) in serving.iter() {
            if stored.dtype() == Dtype::Float32 {
                continue;
            }

            let shadow = match stored.layout() {
                Layout::RowSparse => Tensor::row_sparse(Dtype::Float32, stored.shape()),
                Layout::Dense => Tensor::dense(Dtype::Float32, stored.shape()),
            };

            if let Some(buf) = self.update_bufs.get_mut(&key) {
                if let Some(merged) = &buf.merged {
                    buf.merged = Some(match merged.layout() {
                        Layout::RowSparse => Tensor::row_sparse(Dtype::Float32, merged.shape()),
                        Layout::Dense => Tensor::dense(Dtype::Float32, merged.shape()),
                    });
                }
                assert!(
                    buf.pending.is_empty(),
                    "multi-precision mode cannot be enabled while pushes are underway for key {key}"
                );
            }

            shadow.copy_from(stored);
            master.insert(key, shadow);
        }

        for shadow in master.values() {
            shadow.wait_to_read();
        }
    }

    fn profiler_command(&self, body: &str) {
        let tag = body
            .chars()
            .next_back()
            .and_then(|c| c.to_digit(10))
            .expect("profiler command body must end in a subcommand digit");
        let arg = || {
            body.chars()
                .next()
                .and_then(|c| c.to_digit(10))
                .expect("profiler command body must start with a digit") as i32
        };

        match ProfilerCommand::from_digit(tag) {
            ProfilerCommand::SetConfig => {
                let params = &body[..body.len() - 1];
                let (keys, vals) = parse_profiler_config(params, self.transport.my_rank());
                self.profiler.set_config(keys, vals);
            }
            ProfilerCommand::State => self.profiler.set_state(arg()),
            ProfilerCommand::Pause => self.profiler.pause(arg()),
            ProfilerCommand::Dump => self.profiler.dump(arg()),
        }
    }

    fn decode_key(&self, key: u64) -> ParamId {
        (key - self.transport.key_range_begin()) as ParamId
    }

    fn has_multi_precision_copy(&self, dtype: Dtype) -> bool {
        self.multi_precision && dtype != Dtype::Float32
    }

    /// Replies to a dense (or auto-)pull with the serving tensor's bytes.
    fn default_storage_response(&self, dtype: Dtype, key: ParamId, req: &ReqMeta, keys: &[u64]) {
        let stored = self
            .store
            .serving
            .get(&key)
            .unwrap_or_else(|| panic!("init key {key} first"));

        // The applier barriers on the master in this case, so make sure
        // the worker-dtype copy is written out too.
        if self.has_multi_precision_copy(dtype) {
            stored.wait_to_read();
        }

        let vals = stored.to_bytes();
        debug!(key = key, len = vals.len(); "storage response");
        let response = KvPairs {
            keys: keys.to_vec(),
            lens: vec![vals.len() as i32],
            vals,
        };
        self.transport.respond(req, response);
    }
}
