// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compression plugin: LZ4 block compression of frame payloads ahead of
//! the persistence tail. The compressed payload keeps the original
//! dimensions in its metadata; the compression tag and the recorded image
//! size tell the container layer what actually landed on disk.

use crate::frame::Frame;
use crate::plugin::{FrameProcessorPlugin, PluginContext};
use crate::pool::DataBlockPools;
use framepipe_common::error::ConfigError;
use framepipe_common::CompressionType;
use framepipe_ipc::IpcMessage;
use lz4_flex::block::{compress_into, get_maximum_output_size};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, trace};

pub const CONFIG_ALGORITHM: &str = "algorithm";

pub struct CompressPlugin {
    pools: DataBlockPools,
    algorithm: CompressionType,
    bytes_in: u64,
    bytes_out: u64,
}

impl CompressPlugin {
    pub fn new(pools: DataBlockPools) -> CompressPlugin {
        CompressPlugin {
            pools,
            algorithm: CompressionType::Lz4,
            bytes_in: 0,
            bytes_out: 0,
        }
    }
}

impl FrameProcessorPlugin for CompressPlugin {
    fn process_frame(&mut self, frame: Arc<Frame>, ctx: &PluginContext<'_>) {
        if frame.meta_data().compression != CompressionType::None {
            // Already compressed upstream; pass through untouched
            if let Err(e) = ctx.push(frame) {
                ctx.set_error(e.to_string());
            }
            return;
        }

        let source = frame.image();
        let mut block = self.pools.take(get_maximum_output_size(source.len()));
        let compressed_len = match compress_into(source, block.data_mut()) {
            Ok(len) => len,
            Err(e) => {
                ctx.set_error(format!("lz4 compression failed: {e}"));
                return;
            }
        };
        trace!(
            "frame {} compressed {} -> {compressed_len} bytes",
            frame.frame_number(),
            source.len()
        );
        self.bytes_in += source.len() as u64;
        self.bytes_out += compressed_len as u64;

        let mut meta = frame.meta_data().clone();
        meta.compression = self.algorithm;
        let mut compressed = Frame::from_block(frame.frame_number(), meta, block);
        compressed.set_image_size(compressed_len);
        if let Err(e) = ctx.push(Arc::new(compressed)) {
            ctx.set_error(e.to_string());
        }
    }

    fn configure(
        &mut self,
        config: &IpcMessage,
        _reply: &mut IpcMessage,
        _ctx: &PluginContext<'_>,
    ) -> Result<(), ConfigError> {
        if let Some(algorithm) = config.get_param(CONFIG_ALGORITHM).and_then(|v| v.as_str()) {
            match algorithm {
                "lz4" => self.algorithm = CompressionType::Lz4,
                other => {
                    return Err(ConfigError::new(format!(
                        "unsupported compression algorithm: {other}"
                    )))
                }
            }
            debug!("compression algorithm set to {}", self.algorithm);
        }
        Ok(())
    }

    fn request_configuration(&self, reply: &mut IpcMessage) {
        reply.set_param(CONFIG_ALGORITHM, json!(self.algorithm.to_string()));
    }

    fn status(&self, status: &mut IpcMessage) {
        status.set_param("compress/bytes_in", json!(self.bytes_in));
        status.set_param("compress/bytes_out", json!(self.bytes_out));
    }

    fn reset_statistics(&mut self) -> bool {
        self.bytes_in = 0;
        self.bytes_out = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaPublisher;
    use crate::metadata::FrameMetaData;
    use crate::plugin::PluginHandle;
    use framepipe_common::DataType;
    use lz4_flex::block::decompress;
    use std::sync::Mutex;

    struct CapturePlugin {
        captured: Arc<Mutex<Vec<Arc<Frame>>>>,
    }

    impl FrameProcessorPlugin for CapturePlugin {
        fn process_frame(&mut self, frame: Arc<Frame>, _ctx: &PluginContext<'_>) {
            self.captured.lock().unwrap().push(frame);
        }
    }

    #[test]
    fn compresses_and_round_trips() {
        let pools = DataBlockPools::default();
        let (meta, _rx) = MetaPublisher::new();
        let compress = PluginHandle::new(
            "compress",
            Box::new(CompressPlugin::new(pools.clone())),
            meta.clone(),
        );
        let captured = Arc::new(Mutex::new(Vec::new()));
        let capture = PluginHandle::new(
            "capture",
            Box::new(CapturePlugin {
                captured: captured.clone(),
            }),
            meta,
        );
        compress.register_callback("capture", capture, true);

        let payload: Vec<u8> = std::iter::repeat_n([1u8, 2, 3, 4], 256)
            .flatten()
            .collect();
        let frame_meta = FrameMetaData::new(
            "data",
            DataType::U8,
            "acq",
            vec![32, 32],
            CompressionType::None,
        );
        let frame = Arc::new(Frame::from_data_block(
            5,
            frame_meta,
            pools.take(1024),
            &payload,
        ));
        compress.callback(frame);

        let frames = captured.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let out = &frames[0];
        assert_eq!(out.meta_data().compression, CompressionType::Lz4);
        assert!(out.image_size() < payload.len());
        let restored = decompress(out.image(), payload.len()).unwrap();
        assert_eq!(restored, payload);
    }
}
