use crate::meta::{ControlReq, KvPairs, ModelPush, ReqMeta};

/// Feedback seed for the receiver oracle before any measurement exists.
pub const UNKNOWN: i32 = -1;
/// Sentinel receiver ending a model-distribution loop.
pub const QUIT: i32 = -2;

/// The RPC layer the server core collaborates with.
///
/// Implementations own node identity, key-range assignment and the actual
/// delivery of replies. The server relies on the transport to serialize
/// data-channel requests per key; the core keeps its maps without internal
/// locking on that guarantee.
pub trait Transport {
    /// Number of workers participating in the training job.
    fn num_workers(&self) -> usize;

    /// Rank of the local server among the server group.
    fn my_rank(&self) -> usize;

    /// Node id of the local server.
    fn node_id(&self) -> i32;

    /// Start of the key range assigned to the local server. Parameter ids
    /// are wire keys relative to this.
    fn key_range_begin(&self) -> u64;

    /// Replies to a data-channel request. An empty payload is a bare
    /// acknowledgement.
    fn respond(&self, meta: &ReqMeta, data: KvPairs);

    /// Acknowledges a control-channel request.
    fn ack_control(&self, req: &ControlReq);

    /// Pushes an updated parameter back to the request's originator over
    /// the version-carrying update channel.
    fn auto_pull_update(&self, version: u64, meta: &ReqMeta, data: KvPairs);

    /// Asks the bandwidth-aware oracle for the next model receiver.
    ///
    /// `last_bandwidth` is the feedback from the previous send (negative
    /// elapsed microseconds, [`UNKNOWN`] before the first send); returns a
    /// node id or [`QUIT`] when the distribution is complete.
    fn model_receiver(&self, last_bandwidth: i32, last_receiver: i32, iteration: u64) -> i32;

    /// Sends a model-distribution message to its chosen receiver.
    fn send_model(&self, msg: ModelPush);

    /// Blocks until the receiver of the last model push acknowledged it.
    fn wait_distribution_reply(&self);

    /// Signals the workers that the current iteration's aggregation is
    /// complete and they may advance.
    fn notice_iteration_finished(&self);
}
