use log::info;
use serde::{Deserialize, Serialize};
use tensor::Tensor;

/// The lossy-compression codec seam.
///
/// The server never interprets compressed payloads itself: it hands them
/// to the codec together with a destination tensor of the original shape.
pub trait GradientCompression {
    /// Reconfigures the codec from the opaque blob carried by the
    /// `SetGradientCompression` control command.
    fn decode_params(&mut self, blob: &str);

    /// Expands a compressed payload into `dst`.
    fn dequantize(&self, recved: &Tensor, dst: &Tensor);
}

/// Quantization family selected by the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    None,
    OneBit,
    TwoBit,
}

/// Codec parameters as carried on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompressionSpec {
    pub kind: CompressionKind,
    #[serde(default)]
    pub threshold: f32,
}

/// The default codec: stores whatever spec the frontend sends and passes
/// payloads through unchanged. Real quantizers are supplied by the host.
#[derive(Debug, Default)]
pub struct PassthroughCodec {
    spec: Option<CompressionSpec>,
}

impl PassthroughCodec {
    pub fn spec(&self) -> Option<CompressionSpec> {
        self.spec
    }
}

impl GradientCompression for PassthroughCodec {
    fn decode_params(&mut self, blob: &str) {
        let spec: CompressionSpec =
            serde_json::from_str(blob).expect("malformed gradient compression config");

        info!(kind:? = spec.kind, threshold = spec.threshold; "gradient compression configured");
        self.spec = Some(spec);
    }

    fn dequantize(&self, recved: &Tensor, dst: &Tensor) {
        dst.copy_from(recved);
    }
}
