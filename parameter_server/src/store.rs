use std::collections::HashMap;

use comms::ReqMeta;
use tensor::Tensor;

/// Parameter id local to this server: the wire key relative to the start
/// of the server's assigned key range.
pub type ParamId = i32;

/// Per-key aggregation state for the current window.
#[derive(Default)]
pub struct UpdateBuf {
    /// Descriptors of the requests folded into the window, in arrival
    /// order. A descriptor appears once per unit of `num_merge` it
    /// carries.
    pub pending: Vec<ReqMeta>,
    /// The merge accumulator, allocated lazily on the first sync push.
    /// Float32 when a master copy is kept, else the worker dtype.
    pub merged: Option<Tensor>,
    /// Float32 cast scratch. In async mode without a master copy it
    /// aliases the received tensor instead, which is sound because the
    /// update is applied before the handler returns.
    pub scratch: Option<Tensor>,
}

/// The authoritative per-key tensors.
///
/// All maps are touched only from the transport's dispatch thread, which
/// serializes requests per key, so none of them carries a lock.
#[derive(Default)]
pub struct KeyStore {
    /// The tensor served to pulls, in the worker dtype.
    pub serving: HashMap<ParamId, Tensor>,
    /// Float32 master copies, present only for keys whose serving dtype is
    /// lower precision while multi-precision mode is on.
    pub master: HashMap<ParamId, Tensor>,
    /// Per-key update counters for the version-carrying response path.
    pub versions: HashMap<ParamId, u64>,
}
