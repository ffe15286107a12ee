use crate::op::ControlCmd;

/// Metadata attached to every data-channel request.
#[derive(Debug, Clone)]
pub struct ReqMeta {
    /// Node id of the requesting worker.
    pub sender: i32,
    /// Transport timestamp used to pair the eventual reply.
    pub timestamp: i32,
    /// Encoded `(flavor, dtype)` opcode, see [`crate::DataOp`].
    pub cmd: i32,
    pub push: bool,
    pub pull: bool,
    /// Transport control command piggybacked on the request, if any.
    pub control: Option<ControlCmd>,
    /// How many worker contributions this request stands for when an
    /// intermediate hop has already merged gradients.
    pub num_merge: i32,
    /// How many original workers a pre-aggregated sub-tree push covers.
    pub num_aggregation: i32,
    /// The wire key the request was routed by.
    pub key: u64,
}

impl ReqMeta {
    /// A plain push descriptor for `key` with the given opcode.
    pub fn push(key: u64, cmd: i32) -> Self {
        Self {
            sender: 0,
            timestamp: 0,
            cmd,
            push: true,
            pull: false,
            control: None,
            num_merge: 1,
            num_aggregation: 0,
            key,
        }
    }
}

/// The key/value payload of a data-channel request or response.
///
/// `vals` is a raw byte buffer; its interpretation depends on the request
/// flavor and dtype carried by the opcode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvPairs {
    pub keys: Vec<u64>,
    pub vals: Vec<u8>,
    pub lens: Vec<i32>,
}

impl KvPairs {
    /// Builds a single-key payload from float32 values.
    pub fn from_f32s(key: u64, vals: &[f32]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(vals);
        Self {
            keys: vec![key],
            vals: bytes.to_vec(),
            lens: vec![bytes.len() as i32],
        }
    }

    /// Copies `vals` out as float32 values through an aligned buffer.
    ///
    /// # Panics
    /// If the byte length is not a multiple of four.
    pub fn f32_vals(&self) -> Vec<f32> {
        assert_eq!(self.vals.len() % 4, 0, "payload is not float32-sized");

        let mut nums = vec![0f32; self.vals.len() / 4];
        bytemuck::cast_slice_mut(&mut nums).copy_from_slice(&self.vals);
        nums
    }
}

/// A control-channel request: an integer command head plus an opaque body.
#[derive(Debug, Clone)]
pub struct ControlReq {
    pub head: i32,
    pub body: String,
}

/// An outbound model-distribution message, sent by the server to a peer
/// chosen by the transport's receiver oracle.
#[derive(Debug, Clone)]
pub struct ModelPush {
    pub key: u64,
    /// Iteration number of the distribution that produced this payload.
    pub version: u64,
    /// Timestamp of the request that triggered the distribution.
    pub timestamp: i32,
    /// Node id of the chosen receiver.
    pub recver: i32,
    pub data: KvPairs,
}
