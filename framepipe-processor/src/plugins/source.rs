// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Detector process plugin for the simulated UDP format: takes raw frames
//! straight out of the shared buffer arena, skips the receiver's
//! reassembly header and republishes a typed image frame onto the chain.

use crate::frame::Frame;
use crate::metadata::{FrameMetaData, ParamValue};
use crate::plugin::{AllowedValue, FrameProcessorPlugin, ParamMetadata, PluginContext};
use crate::pool::DataBlockPools;
use framepipe_common::error::ConfigError;
use framepipe_common::{CompressionType, DataType};
use framepipe_ipc::IpcMessage;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, trace};

pub const CONFIG_IMAGE_WIDTH: &str = "width";
pub const CONFIG_IMAGE_HEIGHT: &str = "height";
pub const CONFIG_DATASET_NAME: &str = "dataset_name";
pub const CONFIG_HEADER_SIZE: &str = "frame_header_size";

const COMMAND_PRINT: &str = "print";

/// Header the receiver's decoder leaves at the front of each shared buffer.
const DEFAULT_FRAME_HEADER_SIZE: usize = 56;

pub struct DummyProcessPlugin {
    pools: DataBlockPools,
    image_width: usize,
    image_height: usize,
    dataset_name: String,
    frame_header_size: usize,
    frames_processed: u64,
    config_metadata: Vec<(String, ParamMetadata)>,
}

impl DummyProcessPlugin {
    pub fn new(pools: DataBlockPools) -> DummyProcessPlugin {
        let config_metadata = vec![
            (
                CONFIG_IMAGE_WIDTH.to_string(),
                ParamMetadata {
                    type_name: "integer".to_string(),
                    access_mode: "rw".to_string(),
                    allowed_values: None,
                    min: Some(1),
                    max: None,
                },
            ),
            (
                CONFIG_DATASET_NAME.to_string(),
                ParamMetadata {
                    type_name: "string".to_string(),
                    access_mode: "rw".to_string(),
                    allowed_values: Some(vec![
                        AllowedValue::Str("data".to_string()),
                        AllowedValue::Str("raw".to_string()),
                    ]),
                    min: None,
                    max: None,
                },
            ),
        ];
        DummyProcessPlugin {
            pools,
            image_width: 1024,
            image_height: 768,
            dataset_name: "data".to_string(),
            frame_header_size: DEFAULT_FRAME_HEADER_SIZE,
            frames_processed: 0,
            config_metadata,
        }
    }

    fn image_bytes(&self) -> usize {
        self.image_width * self.image_height * DataType::U16.size()
    }
}

impl FrameProcessorPlugin for DummyProcessPlugin {
    fn process_frame(&mut self, frame: Arc<Frame>, ctx: &PluginContext<'_>) {
        trace!("process plugin handling frame {}", frame.frame_number());
        let raw = frame.data();
        if raw.len() < self.frame_header_size + self.image_bytes() {
            ctx.set_error(format!(
                "raw frame of {} bytes too small for {}x{} image",
                raw.len(),
                self.image_width,
                self.image_height
            ));
            return;
        }
        let image = &raw[self.frame_header_size..self.frame_header_size + self.image_bytes()];

        let mut meta = FrameMetaData::new(
            self.dataset_name.clone(),
            DataType::U16,
            frame.meta_data().acquisition_id.clone(),
            vec![self.image_height as u64, self.image_width as u64],
            CompressionType::None,
        );
        meta.set_parameter("source_buffer_frame", ParamValue::U64(frame.frame_number()));

        let block = self.pools.take(image.len());
        let typed = Frame::from_data_block(frame.frame_number(), meta, block, image);
        self.frames_processed += 1;
        if let Err(e) = ctx.push(Arc::new(typed)) {
            ctx.set_error(e.to_string());
        }
    }

    fn configure(
        &mut self,
        config: &IpcMessage,
        _reply: &mut IpcMessage,
        _ctx: &PluginContext<'_>,
    ) -> Result<(), ConfigError> {
        if let Some(width) = config.get_param(CONFIG_IMAGE_WIDTH).and_then(|v| v.as_u64()) {
            self.image_width = width as usize;
        }
        if let Some(height) = config.get_param(CONFIG_IMAGE_HEIGHT).and_then(|v| v.as_u64()) {
            self.image_height = height as usize;
        }
        if let Some(name) = config.get_param(CONFIG_DATASET_NAME).and_then(|v| v.as_str()) {
            self.dataset_name = name.to_string();
        }
        if let Some(size) = config.get_param(CONFIG_HEADER_SIZE).and_then(|v| v.as_u64()) {
            self.frame_header_size = size as usize;
        }
        debug!(
            "process plugin configured for {}x{} frames into dataset {}",
            self.image_width, self.image_height, self.dataset_name
        );
        Ok(())
    }

    fn request_configuration(&self, reply: &mut IpcMessage) {
        reply.set_param(CONFIG_IMAGE_WIDTH, json!(self.image_width));
        reply.set_param(CONFIG_IMAGE_HEIGHT, json!(self.image_height));
        reply.set_param(CONFIG_DATASET_NAME, json!(self.dataset_name));
        reply.set_param(CONFIG_HEADER_SIZE, json!(self.frame_header_size));
        for (param, metadata) in &self.config_metadata {
            metadata.write_to(reply, "dummy", param);
        }
    }

    fn execute(&mut self, command: &str, reply: &mut IpcMessage) -> Result<(), ConfigError> {
        match command {
            COMMAND_PRINT => {
                info!(
                    "process plugin: {} frames processed into dataset {}",
                    self.frames_processed, self.dataset_name
                );
                reply.set_param("frames_processed", json!(self.frames_processed));
                Ok(())
            }
            other => Err(ConfigError::new(format!(
                "submitted command not supported: {other}"
            ))),
        }
    }

    fn commands(&self) -> Vec<String> {
        vec![COMMAND_PRINT.to_string()]
    }

    fn status(&self, status: &mut IpcMessage) {
        status.set_param("dummy/frames_processed", json!(self.frames_processed));
    }

    fn reset_statistics(&mut self) -> bool {
        self.frames_processed = 0;
        true
    }
}
