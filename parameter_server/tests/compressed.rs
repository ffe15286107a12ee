mod common;

use std::sync::Arc;

use common::*;
use comms::{KvPairs, RequestFlavor};
use parameter_server::{
    ParameterServer, ServerConfig, Updater,
    compression::GradientCompression,
};
use tensor::{Dtype, Tensor};

fn compressed_cmd() -> i32 {
    data_cmd(RequestFlavor::Compressed, Dtype::Float32)
}

/// Fake codec: "compressed" payloads are the plain values halved, so
/// dequantization doubles them back.
struct DoublingCodec;

impl GradientCompression for DoublingCodec {
    fn decode_params(&mut self, _blob: &str) {}

    fn dequantize(&self, recved: &Tensor, dst: &Tensor) {
        let doubled: Vec<f32> = recved.to_f32_vec().iter().map(|v| v * 2.0).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&doubled);
        dst.copy_from(&Tensor::dense_from_bytes(
            Dtype::Float32,
            dst.shape(),
            bytes.to_vec(),
        ));
    }
}

fn compressed_push(original_size: u64, key: u64, vals: &[f32]) -> KvPairs {
    let bytes: &[u8] = bytemuck::cast_slice(vals);
    KvPairs {
        keys: vec![original_size, key],
        vals: bytes.to_vec(),
        lens: vec![0, bytes.len() as i32],
    }
}

#[test]
fn sync_compressed_pushes_dequantize_and_aggregate() {
    let transport = MockTransport::new(2);
    let mut server = ParameterServer::new(transport.clone(), ServerConfig::default());
    let cmd = compressed_cmd();

    server.set_compression(Box::new(DoublingCodec));
    server.handle_command(sync_mode());

    server.handle_data(push_meta(5, cmd), compressed_push(2, 5, &[0.0, 0.0]));
    server.handle_data(push_meta(5, cmd), compressed_push(2, 5, &[1.0, 1.0]));
    server.handle_data(push_meta(5, cmd), compressed_push(2, 5, &[2.0, 2.0]));

    server.handle_data(pull_meta(5, cmd), KvPairs {
        keys: vec![5],
        vals: Vec::new(),
        lens: Vec::new(),
    });

    let log = transport.log.lock();
    let (_, pulled) = log.responses.last().unwrap();
    // (1 + 2) summed after dequantization, each contribution doubled.
    assert_eq!(pulled.f32_vals(), [6.0, 6.0]);
}

#[test]
fn async_compressed_push_updates_through_the_executor() {
    let transport = MockTransport::new(1);
    let mut server = ParameterServer::new(transport.clone(), ServerConfig::default());
    let cmd = compressed_cmd();

    let updater: Updater = Arc::new(|_key, src, dst| dst.add_assign(src));
    server.set_updater(updater);
    server.set_compression(Box::new(DoublingCodec));
    let owner = start_executor(&server);

    server.handle_data(push_meta(5, cmd), compressed_push(2, 5, &[3.0, 4.0]));
    server.handle_data(push_meta(5, cmd), compressed_push(2, 5, &[0.5, 0.5]));

    server.handle_data(pull_meta(5, cmd), KvPairs {
        keys: vec![5],
        vals: Vec::new(),
        lens: Vec::new(),
    });

    {
        let log = transport.log.lock();
        let (_, pulled) = log.responses.last().unwrap();
        // init 2*[3,4], then += 2*[0.5,0.5].
        assert_eq!(pulled.f32_vals(), [7.0, 9.0]);
    }

    server.executor().stop();
    owner.join().unwrap();
}

#[test]
#[should_panic(expected = "float32 only")]
fn non_float32_compressed_push_is_fatal() {
    let transport = MockTransport::new(1);
    let mut server = ParameterServer::new(transport, ServerConfig::default());
    let cmd = data_cmd(RequestFlavor::Compressed, Dtype::Float16);

    let mut payload = compressed_push(2, 5, &[1.0]);
    payload.lens = vec![0, 4];
    server.handle_data(push_meta(5, cmd), payload);
}

#[test]
#[should_panic(expected = "carry two keys")]
fn malformed_compressed_push_is_fatal() {
    let transport = MockTransport::new(1);
    let mut server = ParameterServer::new(transport, ServerConfig::default());
    let cmd = compressed_cmd();

    let payload = KvPairs {
        keys: vec![5],
        vals: vec![0; 4],
        lens: vec![0, 4],
    };
    server.handle_data(push_meta(5, cmd), payload);
}
